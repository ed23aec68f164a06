use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tondex_models::{JettonMasterData, JettonWalletData, NftCollectionData, NftItemData};
use tondex_util::FastDashMap;
use tycho_types::cell::HashBytes;
use tycho_types::models::StdAddr;

use crate::models::ParsedBlockPtr;

/// Connection credentials of the analytical store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreCredentials {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
}

impl Default for StoreCredentials {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 9000,
            user: "default".to_owned(),
            password: String::new(),
            dbname: "default".to_owned(),
        }
    }
}

/// The analytical store, consumed by the insert manager and the detectors.
///
/// Bulk inserts are transactional per batch: either every row of the batch
/// lands or none does. Upserts are idempotent.
pub trait AnalyticalStore: Send + Sync + 'static {
    fn select_existing_seqnos(&self) -> BoxFuture<'_, Result<BTreeSet<u32>>>;

    fn insert_blocks<'a>(&'a self, batch: &'a [ParsedBlockPtr]) -> BoxFuture<'a, Result<()>>;

    fn upsert_jetton_master(&self, data: JettonMasterData) -> BoxFuture<'_, Result<()>>;
    fn upsert_jetton_wallet(&self, data: JettonWalletData) -> BoxFuture<'_, Result<()>>;
    fn upsert_nft_collection(&self, data: NftCollectionData) -> BoxFuture<'_, Result<()>>;
    fn upsert_nft_item(&self, data: NftItemData) -> BoxFuture<'_, Result<()>>;
}

/// In-memory analytical store used by tests and the dev wiring.
///
/// Rows are keyed the way the real store deduplicates them, so replaying a
/// seqno range is idempotent.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Arc<InMemoryStoreInner>,
}

#[derive(Default)]
struct InMemoryStoreInner {
    seqnos: Mutex<BTreeSet<u32>>,
    transactions: FastDashMap<(i8, HashBytes, u64), tondex_models::Transaction>,
    blocks: FastDashMap<(i8, u64, u32), tondex_models::Block>,
    messages: FastDashMap<HashBytes, tondex_models::Message>,
    jetton_masters: FastDashMap<StdAddr, JettonMasterData>,
    jetton_wallets: FastDashMap<StdAddr, JettonWalletData>,
    nft_collections: FastDashMap<StdAddr, NftCollectionData>,
    nft_items: FastDashMap<StdAddr, NftItemData>,
    fail_next_inserts: AtomicU32,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` bulk inserts fail with a transient error.
    pub fn fail_next_inserts(&self, count: u32) {
        self.inner.fail_next_inserts.store(count, Ordering::SeqCst);
    }

    pub fn contains_seqno(&self, seqno: u32) -> bool {
        self.inner.seqnos.lock().contains(&seqno)
    }

    pub fn transaction_count(&self) -> usize {
        self.inner.transactions.len()
    }

    pub fn transaction_rows(&self) -> Vec<tondex_models::Transaction> {
        self.inner
            .transactions
            .iter()
            .map(|item| item.value().clone())
            .collect()
    }

    pub fn jetton_wallet(&self, address: &StdAddr) -> Option<JettonWalletData> {
        self.inner
            .jetton_wallets
            .get(address)
            .map(|item| item.value().clone())
    }

    pub fn jetton_master(&self, address: &StdAddr) -> Option<JettonMasterData> {
        self.inner
            .jetton_masters
            .get(address)
            .map(|item| item.value().clone())
    }
}

impl Clone for InMemoryStore {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl AnalyticalStore for InMemoryStore {
    fn select_existing_seqnos(&self) -> BoxFuture<'_, Result<BTreeSet<u32>>> {
        async move { Ok(self.inner.seqnos.lock().clone()) }.boxed()
    }

    fn insert_blocks<'a>(&'a self, batch: &'a [ParsedBlockPtr]) -> BoxFuture<'a, Result<()>> {
        async move {
            let prev = self
                .inner
                .fail_next_inserts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .unwrap_or(0);
            if prev > 0 {
                anyhow::bail!("injected insert failure");
            }

            for parsed in batch {
                for row in &parsed.context.blocks {
                    self.inner
                        .blocks
                        .insert((row.workchain, row.shard, row.seqno), row.clone());
                }
                for row in &parsed.context.transactions {
                    self.inner
                        .transactions
                        .insert((row.workchain, row.account_id, row.lt), row.clone());
                }
                for row in &parsed.context.messages {
                    self.inner.messages.insert(row.message_hash, row.clone());
                }
                self.inner.seqnos.lock().insert(parsed.mc_seqno);
            }
            Ok(())
        }
        .boxed()
    }

    fn upsert_jetton_master(&self, data: JettonMasterData) -> BoxFuture<'_, Result<()>> {
        async move {
            self.inner.jetton_masters.insert(data.address.clone(), data);
            Ok(())
        }
        .boxed()
    }

    fn upsert_jetton_wallet(&self, data: JettonWalletData) -> BoxFuture<'_, Result<()>> {
        async move {
            self.inner.jetton_wallets.insert(data.address.clone(), data);
            Ok(())
        }
        .boxed()
    }

    fn upsert_nft_collection(&self, data: NftCollectionData) -> BoxFuture<'_, Result<()>> {
        async move {
            self.inner
                .nft_collections
                .insert(data.address.clone(), data);
            Ok(())
        }
        .boxed()
    }

    fn upsert_nft_item(&self, data: NftItemData) -> BoxFuture<'_, Result<()>> {
        async move {
            self.inner.nft_items.insert(data.address.clone(), data);
            Ok(())
        }
        .boxed()
    }
}
