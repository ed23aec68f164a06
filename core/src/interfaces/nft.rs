use std::sync::Arc;

use num_bigint::BigInt;
use num_traits::Zero;
use tokio::sync::{mpsc, oneshot};
use tondex_models::{NftCollectionData, NftItemData, NftTransfer, TokenContent};
use tycho_types::boc::Boc;
use tycho_types::cell::{Cell, HashBytes, Load};
use tycho_types::models::StdAddr;

use super::{
    addr_from_slice_cell, expect_stack, load_opt_addr, opt_addr_from_slice_cell, run_get_method,
    token_data, DetectRequest, EntityCache, InterfaceKind, InterfaceManagerHandle,
};
use crate::insert::InsertManagerHandle;
use crate::vm::{ContractExecutor, GetMethodParams, StackEntry, StackEntryKind};
use crate::{IndexerError, Result};

const NFT_TRANSFER_OP: u32 = 0x5fcc3d14;

enum CollectionCommand {
    Detect(DetectRequest<NftCollectionData>),
    GetCached {
        address: StdAddr,
        respond: oneshot::Sender<Option<NftCollectionData>>,
    },
}

#[derive(Clone)]
pub struct NftCollectionHandle {
    tx: mpsc::UnboundedSender<CollectionCommand>,
}

impl NftCollectionHandle {
    pub async fn detect(
        &self,
        address: StdAddr,
        code: Cell,
        data: Cell,
        last_tx_lt: u64,
    ) -> Result<NftCollectionData> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CollectionCommand::Detect(DetectRequest {
                address,
                code,
                data,
                last_tx_lt,
                respond: tx,
            }))
            .map_err(|_| stopped_error())?;
        rx.await.map_err(|_| stopped_error())?
    }

    pub async fn get_cached(&self, address: StdAddr) -> Option<NftCollectionData> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CollectionCommand::GetCached {
                address,
                respond: tx,
            })
            .ok()?;
        rx.await.ok().flatten()
    }
}

/// Detects NFT collections per TEP-62: `get_collection_data` must return
/// `(int next_item_index, cell collection_content, slice owner_address)`.
pub struct NftCollectionDetector {
    cache: EntityCache<NftCollectionData>,
    manager: InterfaceManagerHandle,
    insert: InsertManagerHandle,
    executor: Arc<dyn ContractExecutor>,
    rx: mpsc::UnboundedReceiver<CollectionCommand>,
}

impl NftCollectionDetector {
    pub fn new(
        manager: InterfaceManagerHandle,
        insert: InsertManagerHandle,
        executor: Arc<dyn ContractExecutor>,
    ) -> (NftCollectionHandle, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (NftCollectionHandle { tx }, Self {
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
                CollectionCommand::Detect(req) => {
                    let res = self.detect(&req).await;
                    req.respond.send(res).ok();
                }
                CollectionCommand::GetCached { address, respond } => {
                    respond.send(self.cache.get(&address)).ok();
                }
            }
        }
    }

    async fn detect(&mut self, req: &DetectRequest<NftCollectionData>) -> Result<NftCollectionData> {
        let code_hash = *req.code.repr_hash();
        if self
            .manager
            .check_interface(code_hash, InterfaceKind::NftCollection)
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

        let stack = match self.run_collection_data(req).await {
            Ok(stack) => stack,
            Err(e) => {
                if matches!(e, IndexerError::InterfaceParse(_)) {
                    self.manager
                        .set_interface(code_hash, InterfaceKind::NftCollection, false);
                }
                return Err(e);
            }
        };

        let next_item_index = stack[0].as_int().cloned().unwrap_or_default();
        let owner_address = opt_addr_from_slice_cell(
            stack[2].as_slice_cell().expect("validated by expect_stack"),
        )?;

        let collection_content = stack[1]
            .as_cell()
            .and_then(|cell| match token_data::parse_token_data(cell) {
                Ok(content) => Some(content),
                Err(e) => {
                    tracing::warn!(
                        address = %req.address,
                        "failed to parse collection content: {e}",
                    );
                    None
                }
            });

        let data = NftCollectionData {
            address: req.address.clone(),
            next_item_index,
            owner_address,
            collection_content,
            code_hash,
            data_hash,
            last_transaction_lt: req.last_tx_lt,
            code_boc: Boc::encode(&req.code),
            data_boc: Boc::encode(&req.data),
        };

        self.manager
            .set_interface(code_hash, InterfaceKind::NftCollection, true);
        self.cache.insert(req.address.clone(), data.clone());
        self.insert.upsert_nft_collection(data.clone());

        Ok(data)
    }

    async fn run_collection_data(
        &self,
        req: &DetectRequest<NftCollectionData>,
    ) -> Result<Vec<StackEntry>> {
        let output = run_get_method(&self.executor, GetMethodParams {
            code: req.code.clone(),
            data: req.data.clone(),
            address: req.address.clone(),
            method: "get_collection_data",
            stack: Vec::new(),
            now: tondex_util::time::now_sec(),
        })
        .await?;

        expect_stack(
            output,
            &[
                StackEntryKind::Int,
                StackEntryKind::Cell,
                StackEntryKind::Slice,
            ],
            "get_collection_data",
        )
    }
}

enum ItemCommand {
    Detect(DetectRequest<NftItemData>),
    ParseTransfer {
        transaction_hash: HashBytes,
        account: StdAddr,
        old_owner: Option<StdAddr>,
        body: Cell,
        respond: oneshot::Sender<Result<NftTransfer>>,
    },
}

#[derive(Clone)]
pub struct NftItemHandle {
    tx: mpsc::UnboundedSender<ItemCommand>,
}

impl NftItemHandle {
    pub async fn detect(
        &self,
        address: StdAddr,
        code: Cell,
        data: Cell,
        last_tx_lt: u64,
    ) -> Result<NftItemData> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ItemCommand::Detect(DetectRequest {
                address,
                code,
                data,
                last_tx_lt,
                respond: tx,
            }))
            .map_err(|_| stopped_error())?;
        rx.await.map_err(|_| stopped_error())?
    }

    /// Decodes a TEP-62 `transfer` body observed on a known NFT item.
    pub async fn parse_transfer(
        &self,
        transaction_hash: HashBytes,
        account: StdAddr,
        old_owner: Option<StdAddr>,
        body: Cell,
    ) -> Result<NftTransfer> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ItemCommand::ParseTransfer {
                transaction_hash,
                account,
                old_owner,
                body,
                respond: tx,
            })
            .map_err(|_| stopped_error())?;
        rx.await.map_err(|_| stopped_error())?
    }
}

/// Detects NFT items per TEP-62: `get_nft_data` must return
/// `(int init?, int index, slice collection_address, slice owner_address,
/// cell individual_content)` and the referenced collection must recompute
/// the item address from its index.
pub struct NftItemDetector {
    cache: EntityCache<NftItemData>,
    collection: NftCollectionHandle,
    manager: InterfaceManagerHandle,
    insert: InsertManagerHandle,
    executor: Arc<dyn ContractExecutor>,
    rx: mpsc::UnboundedReceiver<ItemCommand>,
}

impl NftItemDetector {
    pub fn new(
        collection: NftCollectionHandle,
        manager: InterfaceManagerHandle,
        insert: InsertManagerHandle,
        executor: Arc<dyn ContractExecutor>,
    ) -> (NftItemHandle, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (NftItemHandle { tx }, Self {
            cache: EntityCache::new(),
            collection,
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
                ItemCommand::Detect(req) => {
                    let res = self.detect(&req).await;
                    req.respond.send(res).ok();
                }
                ItemCommand::ParseTransfer {
                    transaction_hash,
                    account,
                    old_owner,
                    body,
                    respond,
                } => {
                    respond
                        .send(self.parse_transfer(transaction_hash, account, old_owner, &body))
                        .ok();
                }
            }
        }
    }

    async fn detect(&mut self, req: &DetectRequest<NftItemData>) -> Result<NftItemData> {
        let code_hash = *req.code.repr_hash();
        if self
            .manager
            .check_interface(code_hash, InterfaceKind::NftItem)
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

        let stack = match self.run_nft_data(req).await {
            Ok(stack) => stack,
            Err(e) => {
                if matches!(e, IndexerError::InterfaceParse(_)) {
                    self.manager
                        .set_interface(code_hash, InterfaceKind::NftItem, false);
                }
                return Err(e);
            }
        };

        let init = !stack[0].as_int().map(BigInt::is_zero).unwrap_or(true);
        let index = stack[1].as_int().cloned().unwrap_or_default();
        let collection_address = opt_addr_from_slice_cell(
            stack[2].as_slice_cell().expect("validated by expect_stack"),
        )?;
        let owner_address = opt_addr_from_slice_cell(
            stack[3].as_slice_cell().expect("validated by expect_stack"),
        )?;
        let ind_content = stack[4]
            .as_cell()
            .expect("validated by expect_stack")
            .clone();

        let mut data = NftItemData {
            address: req.address.clone(),
            init,
            index,
            collection_address: collection_address.clone(),
            owner_address,
            content: None,
            code_hash,
            data_hash,
            last_transaction_lt: req.last_tx_lt,
        };

        match collection_address {
            None => {
                // A standalone item carries its full content itself.
                data.content = match token_data::parse_token_data(&ind_content) {
                    Ok(content) => Some(content),
                    Err(e) => {
                        tracing::warn!(address = %req.address, "failed to parse nft content: {e}");
                        None
                    }
                };
            }
            Some(collection_address) => {
                match self.collection.get_cached(collection_address.clone()).await {
                    None => {
                        // The collection is not indexed yet, so neither the
                        // address nor the content can be resolved. Accept
                        // provisionally and keep the record.
                        // TODO: reconcile provisionally accepted items once
                        // the collection gets indexed.
                        tracing::debug!(
                            item = %req.address,
                            collection = %collection_address,
                            "nft collection not indexed yet, accepting item provisionally",
                        );
                    }
                    Some(collection) => {
                        self.verify_belonging_to_collection(&data, &collection)
                            .await?;
                        data.content = match self.get_content(&data, &ind_content, &collection).await
                        {
                            Ok(content) => Some(content),
                            Err(e) => {
                                tracing::warn!(
                                    address = %req.address,
                                    "failed to resolve nft content: {e}",
                                );
                                None
                            }
                        };
                    }
                }
            }
        }

        self.manager
            .set_interface(code_hash, InterfaceKind::NftItem, true);
        self.cache.insert(req.address.clone(), data.clone());
        self.insert.upsert_nft_item(data.clone());

        Ok(data)
    }

    async fn run_nft_data(&self, req: &DetectRequest<NftItemData>) -> Result<Vec<StackEntry>> {
        let output = run_get_method(&self.executor, GetMethodParams {
            code: req.code.clone(),
            data: req.data.clone(),
            address: req.address.clone(),
            method: "get_nft_data",
            stack: Vec::new(),
            now: tondex_util::time::now_sec(),
        })
        .await?;

        expect_stack(
            output,
            &[
                StackEntryKind::Int,
                StackEntryKind::Int,
                StackEntryKind::Slice,
                StackEntryKind::Slice,
                StackEntryKind::Cell,
            ],
            "get_nft_data",
        )
    }

    /// Only an item whose collection recomputes the same address from the
    /// item index is genuine.
    async fn verify_belonging_to_collection(
        &self,
        item: &NftItemData,
        collection: &NftCollectionData,
    ) -> Result<()> {
        let code = Boc::decode(&collection.code_boc).map_err(anyhow::Error::new)?;
        let data = Boc::decode(&collection.data_boc).map_err(anyhow::Error::new)?;

        let output = run_get_method(&self.executor, GetMethodParams {
            code,
            data,
            address: collection.address.clone(),
            method: "get_nft_address_by_index",
            stack: vec![StackEntry::Int(item.index.clone())],
            now: tondex_util::time::now_sec(),
        })
        .await?;

        let stack = expect_stack(output, &[StackEntryKind::Slice], "get_nft_address_by_index")?;
        let address =
            addr_from_slice_cell(stack[0].as_slice_cell().expect("validated by expect_stack"))?;

        if address == item.address {
            Ok(())
        } else {
            tracing::warn!(
                item = %item.address,
                returned = %address,
                "nft collection returned a different item address",
            );
            Err(IndexerError::InterfaceParse(
                "nft item does not belong to the referred collection",
            ))
        }
    }

    async fn get_content(
        &self,
        item: &NftItemData,
        ind_content: &Cell,
        collection: &NftCollectionData,
    ) -> Result<TokenContent> {
        let code = Boc::decode(&collection.code_boc).map_err(anyhow::Error::new)?;
        let data = Boc::decode(&collection.data_boc).map_err(anyhow::Error::new)?;

        let output = run_get_method(&self.executor, GetMethodParams {
            code,
            data,
            address: collection.address.clone(),
            method: "get_nft_content",
            stack: vec![
                StackEntry::Int(item.index.clone()),
                StackEntry::Cell(ind_content.clone()),
            ],
            now: tondex_util::time::now_sec(),
        })
        .await?;

        let stack = expect_stack(output, &[StackEntryKind::Cell], "get_nft_content")?;
        token_data::parse_token_data(stack[0].as_cell().expect("validated by expect_stack"))
    }

    fn parse_transfer(
        &self,
        transaction_hash: HashBytes,
        account: StdAddr,
        old_owner: Option<StdAddr>,
        body: &Cell,
    ) -> Result<NftTransfer> {
        if self.cache.get(&account).is_none() {
            return Err(IndexerError::EventParse("nft item is not known"));
        }

        let malformed = |_| IndexerError::EventParse("malformed nft transfer");
        let mut cs = body.as_slice().map_err(malformed)?;

        if cs.load_u32().map_err(malformed)? != NFT_TRANSFER_OP {
            return Err(IndexerError::EventParse("not an nft transfer"));
        }
        let query_id = cs.load_u64().map_err(malformed)?;
        let new_owner = load_opt_addr(&mut cs)
            .ok()
            .flatten()
            .ok_or(IndexerError::EventParse("bad new owner address"))?;
        let response_destination =
            load_opt_addr(&mut cs).map_err(|_| IndexerError::EventParse("bad response address"))?;
        let custom_payload = load_maybe_ref(&mut cs).map_err(malformed)?;
        let forward_amount = {
            use tycho_types::num::Tokens;
            let tokens = Tokens::load_from(&mut cs).map_err(malformed)?;
            BigInt::from(tokens.into_inner())
        };
        let forward_payload = load_maybe_ref(&mut cs).map_err(malformed)?;

        Ok(NftTransfer {
            transaction_hash,
            query_id,
            nft_item: account,
            old_owner,
            new_owner,
            response_destination,
            custom_payload,
            forward_amount,
            forward_payload,
        })
    }
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

fn stopped_error() -> IndexerError {
    IndexerError::Transient(anyhow::anyhow!("detector stopped"))
}
