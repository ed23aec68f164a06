use std::sync::Arc;

use num_bigint::BigInt;
use num_traits::Zero;
use tokio::sync::{mpsc, oneshot};
use tondex_models::{JettonBurn, JettonMasterData, JettonTransfer, JettonWalletData};
use tondex_util::time::now_sec;
use tycho_types::boc::Boc;
use tycho_types::cell::{Cell, CellBuilder, HashBytes, Load};
use tycho_types::models::{IntAddr, StdAddr};

use super::{
    addr_from_slice_cell, expect_stack, load_opt_addr, opt_addr_from_slice_cell, run_get_method,
    token_data, DetectRequest, EntityCache, InterfaceKind, InterfaceManagerHandle,
};
use crate::insert::InsertManagerHandle;
use crate::vm::{ContractExecutor, GetMethodParams, StackEntry, StackEntryKind};
use crate::{IndexerError, Result};

const JETTON_TRANSFER_OP: u32 = 0x0f8a7ea5;
const JETTON_BURN_OP: u32 = 0x595f07bc;

enum MasterCommand {
    Detect(DetectRequest<JettonMasterData>),
    GetWalletAddress {
        master: StdAddr,
        owner: StdAddr,
        respond: oneshot::Sender<Result<StdAddr>>,
    },
    GetCached {
        address: StdAddr,
        respond: oneshot::Sender<Option<JettonMasterData>>,
    },
}

#[derive(Clone)]
pub struct JettonMasterHandle {
    tx: mpsc::UnboundedSender<MasterCommand>,
}

impl JettonMasterHandle {
    pub async fn detect(
        &self,
        address: StdAddr,
        code: Cell,
        data: Cell,
        last_tx_lt: u64,
    ) -> Result<JettonMasterData> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(MasterCommand::Detect(DetectRequest {
                address,
                code,
                data,
                last_tx_lt,
                respond: tx,
            }))
            .map_err(detector_stopped)?;
        rx.await.map_err(|_| stopped_error())?
    }

    /// Asks the cached master contract for the wallet address of `owner`.
    ///
    /// Fails with `NotFound` when the master has not been indexed yet.
    pub async fn get_wallet_address(&self, master: StdAddr, owner: StdAddr) -> Result<StdAddr> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(MasterCommand::GetWalletAddress {
                master,
                owner,
                respond: tx,
            })
            .map_err(detector_stopped)?;
        rx.await.map_err(|_| stopped_error())?
    }

    pub async fn get_cached(&self, address: StdAddr) -> Option<JettonMasterData> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(MasterCommand::GetCached {
                address,
                respond: tx,
            })
            .ok()?;
        rx.await.ok().flatten()
    }
}

/// Detects Jetton masters per TEP-74: `get_jetton_data` must return
/// `(int total_supply, int mintable, slice admin_address, cell jetton_content,
/// cell jetton_wallet_code)`.
pub struct JettonMasterDetector {
    cache: EntityCache<JettonMasterData>,
    manager: InterfaceManagerHandle,
    insert: InsertManagerHandle,
    executor: Arc<dyn ContractExecutor>,
    rx: mpsc::UnboundedReceiver<MasterCommand>,
}

impl JettonMasterDetector {
    pub fn new(
        manager: InterfaceManagerHandle,
        insert: InsertManagerHandle,
        executor: Arc<dyn ContractExecutor>,
    ) -> (JettonMasterHandle, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (JettonMasterHandle { tx }, Self {
            cache: EntityCache::new(),
            manager,
            insert,
            executor,
            rx,
        })
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                MasterCommand::Detect(req) => {
                    let res = self.detect(&req).await;
                    req.respond.send(res).ok();
                }
                MasterCommand::GetWalletAddress {
                    master,
                    owner,
                    respond,
                } => {
                    respond.send(self.get_wallet_address(&master, &owner).await).ok();
                }
                MasterCommand::GetCached { address, respond } => {
                    respond.send(self.cache.get(&address)).ok();
                }
            }
        }
    }

    async fn detect(&mut self, req: &DetectRequest<JettonMasterData>) -> Result<JettonMasterData> {
        let code_hash = *req.code.repr_hash();
        if self
            .manager
            .check_interface(code_hash, InterfaceKind::JettonMaster)
            .await
            == Some(false)
        {
            return Err(IndexerError::CodeHashRejected);
        }

        let data_hash = *req.data.repr_hash();
        if let Some(cached) = self
            .cache
            .check(&req.address, &code_hash, &data_hash, req.last_tx_lt)
        {
            return Ok(cached);
        }

        let stack = match self.run_jetton_data(req).await {
            Ok(stack) => stack,
            Err(e) => {
                if matches!(e, IndexerError::InterfaceParse(_)) {
                    self.manager
                        .set_interface(code_hash, InterfaceKind::JettonMaster, false);
                }
                return Err(e);
            }
        };

        let total_supply = stack[0].as_int().cloned().unwrap_or_default();
        let mintable = !stack[1].as_int().map(BigInt::is_zero).unwrap_or(true);
        let admin_address = opt_addr_from_slice_cell(
            stack[2].as_slice_cell().expect("validated by expect_stack"),
        )?;

        let jetton_content = stack[3]
            .as_cell()
            .and_then(|cell| match token_data::parse_token_data(cell) {
                Ok(content) => Some(content),
                Err(e) => {
                    tracing::warn!(address = %req.address, "failed to parse jetton content: {e}");
                    None
                }
            });

        let jetton_wallet_code_hash =
            *stack[4].as_cell().expect("validated by expect_stack").repr_hash();

        let data = JettonMasterData {
            address: req.address.clone(),
            total_supply,
            mintable,
            admin_address,
            jetton_content,
            jetton_wallet_code_hash,
            code_hash,
            data_hash,
            last_transaction_lt: req.last_tx_lt,
            code_boc: Boc::encode(&req.code),
            data_boc: Boc::encode(&req.data),
        };

        self.manager
            .set_interface(code_hash, InterfaceKind::JettonMaster, true);
        self.cache.insert(req.address.clone(), data.clone());
        self.insert.upsert_jetton_master(data.clone());

        Ok(data)
    }

    async fn run_jetton_data(
        &self,
        req: &DetectRequest<JettonMasterData>,
    ) -> Result<Vec<StackEntry>> {
        let output = run_get_method(&self.executor, GetMethodParams {
            code: req.code.clone(),
            data: req.data.clone(),
            address: req.address.clone(),
            method: "get_jetton_data",
            stack: Vec::new(),
            now: now_sec(),
        })
        .await?;

        expect_stack(
            output,
            &[
                StackEntryKind::Int,
                StackEntryKind::Int,
                StackEntryKind::Slice,
                StackEntryKind::Cell,
                StackEntryKind::Cell,
            ],
            "get_jetton_data",
        )
    }

    async fn get_wallet_address(&self, master: &StdAddr, owner: &StdAddr) -> Result<StdAddr> {
        let Some(data) = self.cache.get(master) else {
            return Err(IndexerError::NotFound("jetton master is not indexed"));
        };

        let code = Boc::decode(&data.code_boc).map_err(|e| anyhow::Error::new(e))?;
        let data_cell = Boc::decode(&data.data_boc).map_err(|e| anyhow::Error::new(e))?;

        let owner_cell = CellBuilder::build_from(IntAddr::Std(owner.clone()))
            .map_err(|e| anyhow::Error::new(e))?;

        let output = run_get_method(&self.executor, GetMethodParams {
            code,
            data: data_cell,
            address: master.clone(),
            method: "get_wallet_address",
            stack: vec![StackEntry::Slice(owner_cell)],
            now: now_sec(),
        })
        .await?;

        let stack = expect_stack(output, &[StackEntryKind::Slice], "get_wallet_address")?;
        addr_from_slice_cell(stack[0].as_slice_cell().expect("validated by expect_stack"))
    }
}

enum WalletCommand {
    Detect(DetectRequest<JettonWalletData>),
    ParseTransfer {
        transaction_hash: HashBytes,
        account: StdAddr,
        source: Option<StdAddr>,
        body: Cell,
        respond: oneshot::Sender<Result<JettonTransfer>>,
    },
    ParseBurn {
        transaction_hash: HashBytes,
        account: StdAddr,
        body: Cell,
        respond: oneshot::Sender<Result<JettonBurn>>,
    },
}

#[derive(Clone)]
pub struct JettonWalletHandle {
    tx: mpsc::UnboundedSender<WalletCommand>,
}

impl JettonWalletHandle {
    pub async fn detect(
        &self,
        address: StdAddr,
        code: Cell,
        data: Cell,
        last_tx_lt: u64,
    ) -> Result<JettonWalletData> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalletCommand::Detect(DetectRequest {
                address,
                code,
                data,
                last_tx_lt,
                respond: tx,
            }))
            .map_err(detector_stopped)?;
        rx.await.map_err(|_| stopped_error())?
    }

    /// Decodes a TEP-74 `transfer` body observed on a known jetton wallet.
    pub async fn parse_transfer(
        &self,
        transaction_hash: HashBytes,
        account: StdAddr,
        source: Option<StdAddr>,
        body: Cell,
    ) -> Result<JettonTransfer> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalletCommand::ParseTransfer {
                transaction_hash,
                account,
                source,
                body,
                respond: tx,
            })
            .map_err(detector_stopped)?;
        rx.await.map_err(|_| stopped_error())?
    }

    /// Decodes a TEP-74 `burn` body observed on a known jetton wallet.
    pub async fn parse_burn(
        &self,
        transaction_hash: HashBytes,
        account: StdAddr,
        body: Cell,
    ) -> Result<JettonBurn> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalletCommand::ParseBurn {
                transaction_hash,
                account,
                body,
                respond: tx,
            })
            .map_err(detector_stopped)?;
        rx.await.map_err(|_| stopped_error())?
    }
}

/// Detects Jetton wallets per TEP-74: `get_wallet_data` must return
/// `(int balance, slice owner, slice jetton, cell jetton_wallet_code)` and
/// the referenced master must recognize the wallet.
pub struct JettonWalletDetector {
    cache: EntityCache<JettonWalletData>,
    master: JettonMasterHandle,
    manager: InterfaceManagerHandle,
    insert: InsertManagerHandle,
    executor: Arc<dyn ContractExecutor>,
    rx: mpsc::UnboundedReceiver<WalletCommand>,
}

impl JettonWalletDetector {
    pub fn new(
        master: JettonMasterHandle,
        manager: InterfaceManagerHandle,
        insert: InsertManagerHandle,
        executor: Arc<dyn ContractExecutor>,
    ) -> (JettonWalletHandle, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (JettonWalletHandle { tx }, Self {
            cache: EntityCache::new(),
            master,
            manager,
            insert,
            executor,
            rx,
        })
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                WalletCommand::Detect(req) => {
                    let res = self.detect(&req).await;
                    req.respond.send(res).ok();
                }
                WalletCommand::ParseTransfer {
                    transaction_hash,
                    account,
                    source,
                    body,
                    respond,
                } => {
                    respond
                        .send(self.parse_transfer(transaction_hash, account, source, &body))
                        .ok();
                }
                WalletCommand::ParseBurn {
                    transaction_hash,
                    account,
                    body,
                    respond,
                } => {
                    respond
                        .send(self.parse_burn(transaction_hash, account, &body))
                        .ok();
                }
            }
        }
    }

    async fn detect(&mut self, req: &DetectRequest<JettonWalletData>) -> Result<JettonWalletData> {
        let code_hash = *req.code.repr_hash();
        if self
            .manager
            .check_interface(code_hash, InterfaceKind::JettonWallet)
            .await
            == Some(false)
        {
            return Err(IndexerError::CodeHashRejected);
        }

        let data_hash = *req.data.repr_hash();
        if let Some(cached) = self
            .cache
            .check(&req.address, &code_hash, &data_hash, req.last_tx_lt)
        {
            return Ok(cached);
        }

        let stack = match self.run_wallet_data(req).await {
            Ok(stack) => stack,
            Err(e) => {
                if matches!(e, IndexerError::InterfaceParse(_)) {
                    self.manager
                        .set_interface(code_hash, InterfaceKind::JettonWallet, false);
                }
                return Err(e);
            }
        };

        let balance = stack[0].as_int().cloned().unwrap_or_default();
        let owner =
            addr_from_slice_cell(stack[1].as_slice_cell().expect("validated by expect_stack"))?;
        let jetton =
            addr_from_slice_cell(stack[2].as_slice_cell().expect("validated by expect_stack"))?;

        let data = JettonWalletData {
            address: req.address.clone(),
            balance,
            owner,
            jetton,
            code_hash,
            data_hash,
            last_transaction_lt: req.last_tx_lt,
        };

        self.verify_belonging_to_master(data).await
    }

    async fn run_wallet_data(
        &self,
        req: &DetectRequest<JettonWalletData>,
    ) -> Result<Vec<StackEntry>> {
        let output = run_get_method(&self.executor, GetMethodParams {
            code: req.code.clone(),
            data: req.data.clone(),
            address: req.address.clone(),
            method: "get_wallet_data",
            stack: Vec::new(),
            now: now_sec(),
        })
        .await?;

        expect_stack(
            output,
            &[
                StackEntryKind::Int,
                StackEntryKind::Slice,
                StackEntryKind::Slice,
                StackEntryKind::Cell,
            ],
            "get_wallet_data",
        )
    }

    /// Only a wallet whose master recomputes the same address is genuine.
    async fn verify_belonging_to_master(
        &mut self,
        data: JettonWalletData,
    ) -> Result<JettonWalletData> {
        match self
            .master
            .get_wallet_address(data.jetton.clone(), data.owner.clone())
            .await
        {
            Ok(address) if address == data.address => self.accept(data),
            Ok(address) => {
                tracing::warn!(
                    wallet = %data.address,
                    returned = %address,
                    "jetton master returned a different wallet address",
                );
                Err(IndexerError::InterfaceParse(
                    "jetton wallet failed master verification",
                ))
            }
            Err(IndexerError::NotFound(_)) => {
                // The master is not indexed yet, so the address cannot be
                // verified. Accept provisionally and keep the record.
                // TODO: reconcile provisionally accepted wallets once the
                // master gets indexed.
                self.accept(data)
            }
            Err(e) => Err(e),
        }
    }

    fn accept(&mut self, data: JettonWalletData) -> Result<JettonWalletData> {
        self.manager
            .set_interface(data.code_hash, InterfaceKind::JettonWallet, true);
        self.cache.insert(data.address.clone(), data.clone());
        self.insert.upsert_jetton_wallet(data.clone());
        Ok(data)
    }

    fn parse_transfer(
        &self,
        transaction_hash: HashBytes,
        account: StdAddr,
        source: Option<StdAddr>,
        body: &Cell,
    ) -> Result<JettonTransfer> {
        if self.cache.get(&account).is_none() {
            return Err(IndexerError::EventParse("jetton wallet is not known"));
        }

        let malformed = |_| IndexerError::EventParse("malformed jetton transfer");
        let mut cs = body.as_slice().map_err(malformed)?;

        if cs.load_u32().map_err(malformed)? != JETTON_TRANSFER_OP {
            return Err(IndexerError::EventParse("not a jetton transfer"));
        }
        let query_id = cs.load_u64().map_err(malformed)?;
        let amount = load_coins(&mut cs, "malformed jetton transfer")?;
        let destination = load_opt_addr(&mut cs)
            .ok()
            .flatten()
            .ok_or(IndexerError::EventParse("bad transfer destination"))?;
        let response_destination =
            load_opt_addr(&mut cs).map_err(|_| IndexerError::EventParse("bad response address"))?;
        let custom_payload = load_maybe_ref(&mut cs).map_err(malformed)?;
        let forward_ton_amount = load_coins(&mut cs, "malformed jetton transfer")?;
        let forward_payload = load_maybe_ref(&mut cs).map_err(malformed)?;

        Ok(JettonTransfer {
            transaction_hash,
            query_id,
            amount,
            source: source.ok_or(IndexerError::EventParse("transfer without source"))?,
            destination,
            response_destination,
            custom_payload,
            forward_ton_amount,
            forward_payload,
        })
    }

    fn parse_burn(
        &self,
        transaction_hash: HashBytes,
        account: StdAddr,
        body: &Cell,
    ) -> Result<JettonBurn> {
        if self.cache.get(&account).is_none() {
            return Err(IndexerError::EventParse("jetton wallet is not known"));
        }

        let malformed = |_| IndexerError::EventParse("malformed jetton burn");
        let mut cs = body.as_slice().map_err(malformed)?;

        if cs.load_u32().map_err(malformed)? != JETTON_BURN_OP {
            return Err(IndexerError::EventParse("not a jetton burn"));
        }
        let query_id = cs.load_u64().map_err(malformed)?;
        let amount = load_coins(&mut cs, "malformed jetton burn")?;
        let response_destination =
            load_opt_addr(&mut cs).map_err(|_| IndexerError::EventParse("bad response address"))?;
        let custom_payload = load_maybe_ref(&mut cs).map_err(malformed)?;

        Ok(JettonBurn {
            transaction_hash,
            query_id,
            amount,
            response_destination,
            custom_payload,
        })
    }
}

fn load_coins(cs: &mut tycho_types::cell::CellSlice<'_>, ctx: &'static str) -> Result<BigInt> {
    use tycho_types::num::Tokens;
    let tokens = Tokens::load_from(cs).map_err(|_| IndexerError::EventParse(ctx))?;
    Ok(BigInt::from(tokens.into_inner()))
}

fn load_maybe_ref(
    cs: &mut tycho_types::cell::CellSlice<'_>,
) -> std::result::Result<Option<Vec<u8>>, tycho_types::error::Error> {
    Ok(if cs.load_bit()? {
        Some(Boc::encode(cs.load_reference_cloned()?))
    } else {
        None
    })
}

fn detector_stopped<T>(_: mpsc::error::SendError<T>) -> IndexerError {
    stopped_error()
}

fn stopped_error() -> IndexerError {
    IndexerError::Transient(anyhow::anyhow!("detector stopped"))
}

#[cfg(test)]
mod tests {
    use tycho_types::cell::CellFamily;
    use tycho_types::num::Tokens;
    use tycho_types::prelude::Store;

    use super::*;
    use crate::store::InMemoryStore;
    use crate::vm::GetMethodOutput;

    struct NoVm;

    impl ContractExecutor for NoVm {
        fn run_get_method(&self, _: GetMethodParams) -> Result<GetMethodOutput> {
            Err(IndexerError::Vm("no vm in this test".to_owned()))
        }

        fn emulate_transaction(
            &self,
            _: &crate::vm::EmulationEnv,
            _: Option<&tycho_types::models::Account>,
            _: &Cell,
        ) -> Result<crate::vm::EmulatedTransaction> {
            Err(IndexerError::Vm("no vm in this test".to_owned()))
        }
    }

    fn wallet_detector() -> (JettonWalletDetector, InsertManagerHandle) {
        let store = Arc::new(InMemoryStore::new());
        let (insert, _manager) =
            crate::insert::InsertManager::new(Default::default(), store);
        let (manager_handle, _interface_manager) = super::super::InterfaceManager::new();
        let (master_handle, _master) = JettonMasterDetector::new(
            manager_handle.clone(),
            insert.clone(),
            Arc::new(NoVm),
        );
        let (_, detector) = JettonWalletDetector::new(
            master_handle,
            manager_handle,
            insert.clone(),
            Arc::new(NoVm),
        );
        (detector, insert)
    }

    fn addr(byte: u8) -> StdAddr {
        StdAddr::new(0, HashBytes([byte; 32]))
    }

    fn wallet_data(address: &StdAddr) -> JettonWalletData {
        JettonWalletData {
            address: address.clone(),
            balance: BigInt::from(10),
            owner: addr(2),
            jetton: addr(3),
            code_hash: HashBytes::ZERO,
            data_hash: HashBytes::ZERO,
            last_transaction_lt: 1,
        }
    }

    fn transfer_body(destination: &StdAddr) -> Cell {
        let mut b = CellBuilder::new();
        b.store_u32(JETTON_TRANSFER_OP).unwrap();
        b.store_u64(77).unwrap();
        Tokens::new(1000)
            .store_into(&mut b, Cell::empty_context())
            .unwrap();
        IntAddr::Std(destination.clone())
            .store_into(&mut b, Cell::empty_context())
            .unwrap();
        // response_destination = addr_none
        b.store_bit(false).unwrap();
        b.store_bit(false).unwrap();
        // no custom payload
        b.store_bit(false).unwrap();
        Tokens::new(5)
            .store_into(&mut b, Cell::empty_context())
            .unwrap();
        // no forward payload
        b.store_bit(false).unwrap();
        b.build().unwrap()
    }

    #[test]
    fn parses_known_wallet_transfer() {
        let (mut detector, _insert) = wallet_detector();
        let wallet = addr(1);
        detector.cache.insert(wallet.clone(), wallet_data(&wallet));

        let destination = addr(4);
        let body = transfer_body(&destination);

        let transfer = detector
            .parse_transfer(HashBytes([9; 32]), wallet, Some(addr(2)), &body)
            .unwrap();
        assert_eq!(transfer.query_id, 77);
        assert_eq!(transfer.amount, BigInt::from(1000));
        assert_eq!(transfer.destination, destination);
        assert_eq!(transfer.response_destination, None);
        assert_eq!(transfer.forward_ton_amount, BigInt::from(5));
    }

    #[test]
    fn rejects_transfer_on_unknown_wallet() {
        let (detector, _insert) = wallet_detector();
        let body = transfer_body(&addr(4));

        let err = detector
            .parse_transfer(HashBytes::ZERO, addr(1), Some(addr(2)), &body)
            .unwrap_err();
        assert!(matches!(err, IndexerError::EventParse(_)));
    }

    #[test]
    fn rejects_foreign_op_code() {
        let (mut detector, _insert) = wallet_detector();
        let wallet = addr(1);
        detector.cache.insert(wallet.clone(), wallet_data(&wallet));

        let mut b = CellBuilder::new();
        b.store_u32(0xdeadbeef).unwrap();
        let body = b.build().unwrap();

        let err = detector
            .parse_transfer(HashBytes::ZERO, wallet, Some(addr(2)), &body)
            .unwrap_err();
        assert!(matches!(err, IndexerError::EventParse(_)));
    }
}
