use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tondex_models::{JettonMasterData, JettonWalletData, NftCollectionData, NftItemData};
use tondex_util::sync::rayon_run;
use tondex_util::FastHashMap;
use tycho_types::cell::{Cell, CellSlice, HashBytes, Load};
use tycho_types::models::StdAddr;

pub use self::jetton::{
    JettonMasterDetector, JettonMasterHandle, JettonWalletDetector, JettonWalletHandle,
};
pub use self::nft::{NftCollectionDetector, NftCollectionHandle, NftItemDetector, NftItemHandle};

mod jetton;
mod nft;
pub mod token_data;

/// The fixed set of known contract standards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    JettonMaster,
    JettonWallet,
    NftCollection,
    NftItem,
}

/// A classified contract interface with its decoded get-method record.
#[derive(Debug, Clone, Serialize)]
pub enum DetectedInterface {
    JettonMaster(JettonMasterData),
    JettonWallet(JettonWalletData),
    NftCollection(NftCollectionData),
    NftItem(NftItemData),
}

impl DetectedInterface {
    pub fn kind(&self) -> InterfaceKind {
        match self {
            Self::JettonMaster(_) => InterfaceKind::JettonMaster,
            Self::JettonWallet(_) => InterfaceKind::JettonWallet,
            Self::NftCollection(_) => InterfaceKind::NftCollection,
            Self::NftItem(_) => InterfaceKind::NftItem,
        }
    }
}

enum ManagerCommand {
    Check {
        code_hash: HashBytes,
        kind: InterfaceKind,
        respond: oneshot::Sender<Option<bool>>,
    },
    Set {
        code_hash: HashBytes,
        kind: InterfaceKind,
        value: bool,
    },
}

/// Mailbox of the code-hash classification cache.
#[derive(Clone)]
pub struct InterfaceManagerHandle {
    tx: mpsc::UnboundedSender<ManagerCommand>,
}

impl InterfaceManagerHandle {
    /// Returns the cached classification for the code hash, or `None` when
    /// this code hash was never classified for the kind.
    pub async fn check_interface(&self, code_hash: HashBytes, kind: InterfaceKind) -> Option<bool> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ManagerCommand::Check {
                code_hash,
                kind,
                respond: tx,
            })
            .ok()?;
        rx.await.ok().flatten()
    }

    pub fn set_interface(&self, code_hash: HashBytes, kind: InterfaceKind, value: bool) {
        self.tx
            .send(ManagerCommand::Set {
                code_hash,
                kind,
                value,
            })
            .ok();
    }
}

/// Owns the `{code_hash, interface_kind} -> bool` cache; the detectors are
/// the only writers, through the mailbox.
pub struct InterfaceManager {
    cache: FastHashMap<(HashBytes, InterfaceKind), bool>,
    rx: mpsc::UnboundedReceiver<ManagerCommand>,
}

impl InterfaceManager {
    pub fn new() -> (InterfaceManagerHandle, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (InterfaceManagerHandle { tx }, Self {
            cache: FastHashMap::default(),
            rx,
        })
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                ManagerCommand::Check {
                    code_hash,
                    kind,
                    respond,
                } => {
                    respond.send(self.cache.get(&(code_hash, kind)).copied()).ok();
                }
                ManagerCommand::Set {
                    code_hash,
                    kind,
                    value,
                } => {
                    self.cache.insert((code_hash, kind), value);
                }
            }
        }
    }
}

/// All four detectors behind one façade; used by the per-trace interface
/// detection pass.
#[derive(Clone)]
pub struct DetectorSet {
    pub jetton_master: JettonMasterHandle,
    pub jetton_wallet: JettonWalletHandle,
    pub nft_collection: NftCollectionHandle,
    pub nft_item: NftItemHandle,
}

impl DetectorSet {
    /// Runs every detector against the account; negative classifications
    /// are expected and silently skipped.
    pub async fn detect_all(
        &self,
        address: &StdAddr,
        code: &Cell,
        data: &Cell,
        last_tx_lt: u64,
    ) -> Vec<DetectedInterface> {
        let mut found = Vec::new();

        match self
            .jetton_master
            .detect(address.clone(), code.clone(), data.clone(), last_tx_lt)
            .await
        {
            Ok(data) => found.push(DetectedInterface::JettonMaster(data)),
            Err(e) => log_negative(address, InterfaceKind::JettonMaster, &e),
        }
        match self
            .jetton_wallet
            .detect(address.clone(), code.clone(), data.clone(), last_tx_lt)
            .await
        {
            Ok(data) => found.push(DetectedInterface::JettonWallet(data)),
            Err(e) => log_negative(address, InterfaceKind::JettonWallet, &e),
        }
        match self
            .nft_collection
            .detect(address.clone(), code.clone(), data.clone(), last_tx_lt)
            .await
        {
            Ok(data) => found.push(DetectedInterface::NftCollection(data)),
            Err(e) => log_negative(address, InterfaceKind::NftCollection, &e),
        }
        match self
            .nft_item
            .detect(address.clone(), code.clone(), data.clone(), last_tx_lt)
            .await
        {
            Ok(data) => found.push(DetectedInterface::NftItem(data)),
            Err(e) => log_negative(address, InterfaceKind::NftItem, &e),
        }

        found
    }
}

fn log_negative(address: &StdAddr, kind: InterfaceKind, e: &crate::IndexerError) {
    use crate::IndexerError;
    match e {
        IndexerError::CodeHashRejected | IndexerError::InterfaceParse(_) => {}
        e => tracing::warn!(%address, ?kind, "interface detection failed: {e}"),
    }
}

/// A request every detector understands.
pub(crate) struct DetectRequest<T> {
    pub address: StdAddr,
    pub code: Cell,
    pub data: Cell,
    pub last_tx_lt: u64,
    pub respond: oneshot::Sender<crate::Result<T>>,
}

/// Entity records that can answer the per-address cache fast path.
pub(crate) trait CachedEntity: Clone {
    fn code_hash(&self) -> &HashBytes;
    fn data_hash(&self) -> &HashBytes;
    fn last_transaction_lt(&self) -> u64;
}

macro_rules! impl_cached_entity {
    ($($ty:ty),*) => {$(
        impl CachedEntity for $ty {
            fn code_hash(&self) -> &HashBytes {
                &self.code_hash
            }
            fn data_hash(&self) -> &HashBytes {
                &self.data_hash
            }
            fn last_transaction_lt(&self) -> u64 {
                self.last_transaction_lt
            }
        }
    )*};
}

impl_cached_entity!(JettonMasterData, JettonWalletData, NftCollectionData, NftItemData);

/// Per-address cache of decoded entity records. Authoritative for the
/// process lifetime; persisted state is advisory on restart.
pub(crate) struct EntityCache<T> {
    map: FastHashMap<StdAddr, T>,
}

impl<T: CachedEntity> EntityCache<T> {
    pub fn new() -> Self {
        Self {
            map: FastHashMap::default(),
        }
    }

    /// Returns the cached record when it still matches the observed
    /// `(code_hash, data_hash)` or is strictly newer than the requested lt.
    pub fn check(
        &self,
        address: &StdAddr,
        code_hash: &HashBytes,
        data_hash: &HashBytes,
        last_tx_lt: u64,
    ) -> Option<T> {
        let cached = self.map.get(address)?;
        let unchanged = cached.code_hash() == code_hash && cached.data_hash() == data_hash;
        if unchanged || cached.last_transaction_lt() > last_tx_lt {
            Some(cached.clone())
        } else {
            None
        }
    }

    pub fn get(&self, address: &StdAddr) -> Option<T> {
        self.map.get(address).cloned()
    }

    pub fn insert(&mut self, address: StdAddr, data: T) {
        self.map.insert(address, data);
    }
}

/// Bridges the synchronous VM to the actor world through the rayon pool.
pub(crate) async fn run_get_method(
    executor: &Arc<dyn crate::vm::ContractExecutor>,
    params: crate::vm::GetMethodParams,
) -> crate::Result<crate::vm::GetMethodOutput> {
    let executor = executor.clone();
    rayon_run(move || executor.run_get_method(params)).await
}

/// Validates that the stack has exactly the expected depth and entry kinds.
pub(crate) fn expect_stack(
    output: crate::vm::GetMethodOutput,
    expected: &[crate::vm::StackEntryKind],
    method: &'static str,
) -> crate::Result<Vec<crate::vm::StackEntry>> {
    if !output.success || output.stack.len() != expected.len() {
        return Err(crate::IndexerError::InterfaceParse(method));
    }
    for (entry, kind) in output.stack.iter().zip(expected) {
        if entry.kind() != *kind {
            return Err(crate::IndexerError::InterfaceParse(method));
        }
    }
    Ok(output.stack)
}

/// Loads `addr_none` or `addr_std`; anything else is a parse error.
pub(crate) fn load_opt_addr(cs: &mut CellSlice<'_>) -> crate::Result<Option<StdAddr>> {
    use crate::IndexerError;

    let malformed = |_| IndexerError::InterfaceParse("malformed address");
    if cs.load_bit().map_err(malformed)? {
        if cs.load_bit().map_err(malformed)? {
            return Err(IndexerError::InterfaceParse("addr_var is not supported"));
        }
        if cs.load_bit().map_err(malformed)? {
            return Err(IndexerError::InterfaceParse("anycast is not supported"));
        }
        let workchain = cs.load_u8().map_err(malformed)? as i8;
        let address = HashBytes::load_from(cs).map_err(malformed)?;
        Ok(Some(StdAddr::new(workchain, address)))
    } else {
        if cs.load_bit().map_err(malformed)? {
            return Err(IndexerError::InterfaceParse("addr_extern is not supported"));
        }
        Ok(None)
    }
}

/// Decodes the address a get-method returned in a slice stack entry.
pub(crate) fn opt_addr_from_slice_cell(cell: &Cell) -> crate::Result<Option<StdAddr>> {
    let mut cs = cell
        .as_slice()
        .map_err(|_| crate::IndexerError::InterfaceParse("pruned address slice"))?;
    load_opt_addr(&mut cs)
}

pub(crate) fn addr_from_slice_cell(cell: &Cell) -> crate::Result<StdAddr> {
    opt_addr_from_slice_cell(cell)?
        .ok_or(crate::IndexerError::InterfaceParse("address is addr_none"))
}
