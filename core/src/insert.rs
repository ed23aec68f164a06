use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tondex_models::{JettonMasterData, JettonWalletData, NftCollectionData, NftItemData};
use tondex_util::serde_helpers;

use crate::models::{ParsedBlockPtr, QueueState};
use crate::store::AnalyticalStore;
use crate::{IndexerError, Result as CoreResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InsertManagerConfig {
    /// Max number of parsed mc blocks per insert batch.
    ///
    /// Default: 512.
    pub batch_blocks_count: u32,

    /// Max number of insert workers running at once.
    ///
    /// Default: 32.
    pub max_parallel_insert_actors: u32,

    /// Per-batch content caps.
    ///
    /// Defaults: 1024 mc blocks, 2048 blocks, 32768 txs, 65536 msgs.
    pub max_insert_mc_blocks: u32,
    pub max_insert_blocks: u32,
    pub max_insert_txs: u32,
    pub max_insert_msgs: u32,

    /// Period of the batch assembly tick.
    ///
    /// Default: 1 second.
    #[serde(with = "serde_helpers::humantime")]
    pub insert_interval: Duration,
}

impl Default for InsertManagerConfig {
    fn default() -> Self {
        Self {
            batch_blocks_count: 512,
            max_parallel_insert_actors: 32,
            max_insert_mc_blocks: 1024,
            max_insert_blocks: 2048,
            max_insert_txs: 32768,
            max_insert_msgs: 65536,
            insert_interval: Duration::from_secs(1),
        }
    }
}

impl InsertManagerConfig {
    fn insert_caps(&self) -> QueueState {
        QueueState {
            mc_blocks: self.max_insert_mc_blocks,
            blocks: self.max_insert_blocks,
            txs: self.max_insert_txs,
            msgs: self.max_insert_msgs,
        }
    }
}

/// A unit of work owned by the insert manager between enqueue and
/// completion.
pub struct InsertTask {
    pub mc_seqno: u32,
    pub parsed_block: ParsedBlockPtr,
    /// Fires with the new queue state once the task is admitted.
    pub queued: oneshot::Sender<QueueState>,
    /// Fires once the task is persisted (or failed together with its
    /// batch).
    pub inserted: oneshot::Sender<Result<(), Arc<anyhow::Error>>>,
}

/// An admitted task waiting in the insert queue.
struct QueuedTask {
    mc_seqno: u32,
    parsed_block: ParsedBlockPtr,
    inserted: oneshot::Sender<Result<(), Arc<anyhow::Error>>>,
}

enum InsertCommand {
    Insert(InsertTask),
    GetQueueState(oneshot::Sender<QueueState>),
    GetExistingSeqnos(oneshot::Sender<Result<BTreeSet<u32>>>),
    UpsertJettonMaster(JettonMasterData),
    UpsertJettonWallet(JettonWalletData),
    UpsertNftCollection(NftCollectionData),
    UpsertNftItem(NftItemData),
    BatchFinished,
}

/// Cloneable mailbox of the insert manager actor.
#[derive(Clone)]
pub struct InsertManagerHandle {
    tx: mpsc::UnboundedSender<InsertCommand>,
}

impl InsertManagerHandle {
    /// Enqueues a parsed block; returns once it has been admitted, with the
    /// queue state right after admission. The second receiver fires when
    /// the block is persisted.
    pub async fn insert(
        &self,
        mc_seqno: u32,
        parsed_block: ParsedBlockPtr,
    ) -> CoreResult<(QueueState, oneshot::Receiver<Result<(), Arc<anyhow::Error>>>)> {
        let (queued_tx, queued_rx) = oneshot::channel();
        let (inserted_tx, inserted_rx) = oneshot::channel();
        self.send(InsertCommand::Insert(InsertTask {
            mc_seqno,
            parsed_block,
            queued: queued_tx,
            inserted: inserted_tx,
        }))?;

        let state = queued_rx
            .await
            .map_err(|_| IndexerError::Transient(anyhow::anyhow!("insert manager stopped")))?;
        Ok((state, inserted_rx))
    }

    pub async fn get_queue_state(&self) -> CoreResult<QueueState> {
        let (tx, rx) = oneshot::channel();
        self.send(InsertCommand::GetQueueState(tx))?;
        rx.await
            .map_err(|_| IndexerError::Transient(anyhow::anyhow!("insert manager stopped")))
    }

    pub async fn get_existing_seqnos(&self) -> CoreResult<BTreeSet<u32>> {
        let (tx, rx) = oneshot::channel();
        self.send(InsertCommand::GetExistingSeqnos(tx))?;
        rx.await
            .map_err(|_| IndexerError::Transient(anyhow::anyhow!("insert manager stopped")))?
            .map_err(IndexerError::Transient)
    }

    /// Fire-and-forget idempotent entity upserts; failures are logged by
    /// the manager.
    pub fn upsert_jetton_master(&self, data: JettonMasterData) {
        self.send(InsertCommand::UpsertJettonMaster(data)).ok();
    }

    pub fn upsert_jetton_wallet(&self, data: JettonWalletData) {
        self.send(InsertCommand::UpsertJettonWallet(data)).ok();
    }

    pub fn upsert_nft_collection(&self, data: NftCollectionData) {
        self.send(InsertCommand::UpsertNftCollection(data)).ok();
    }

    pub fn upsert_nft_item(&self, data: NftItemData) {
        self.send(InsertCommand::UpsertNftItem(data)).ok();
    }

    fn send(&self, cmd: InsertCommand) -> CoreResult<()> {
        self.tx
            .send(cmd)
            .map_err(|_| IndexerError::Transient(anyhow::anyhow!("insert manager stopped")))
    }
}

/// Batching sink in front of the analytical store.
///
/// Keeps a size-bounded queue of parsed blocks, assembles greedy batches at
/// every tick and runs up to `max_parallel_insert_actors` insert workers,
/// each with its own store connection.
pub struct InsertManager {
    config: InsertManagerConfig,
    store: Arc<dyn AnalyticalStore>,

    queue: VecDeque<QueuedTask>,
    queue_state: QueueState,
    active_workers: u32,

    rx: mpsc::UnboundedReceiver<InsertCommand>,
    self_tx: mpsc::UnboundedSender<InsertCommand>,
}

impl InsertManager {
    pub fn new(
        config: InsertManagerConfig,
        store: Arc<dyn AnalyticalStore>,
    ) -> (InsertManagerHandle, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = InsertManagerHandle { tx: tx.clone() };
        let manager = Self {
            config,
            store,
            queue: VecDeque::new(),
            queue_state: QueueState::default(),
            active_workers: 0,
            rx,
            self_tx: tx,
        };
        (handle, manager)
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.config.insert_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = interval.tick() => self.tick(),
            }
        }
    }

    fn handle(&mut self, cmd: InsertCommand) {
        match cmd {
            InsertCommand::Insert(task) => {
                let InsertTask {
                    mc_seqno,
                    parsed_block,
                    queued,
                    inserted,
                } = task;

                self.queue_state += parsed_block.queue_contribution();
                self.report_queue_gauges();

                queued.send(self.queue_state).ok();
                self.queue.push_back(QueuedTask {
                    mc_seqno,
                    parsed_block,
                    inserted,
                });
            }
            InsertCommand::GetQueueState(tx) => {
                tx.send(self.queue_state).ok();
            }
            InsertCommand::GetExistingSeqnos(tx) => {
                let store = self.store.clone();
                tokio::spawn(async move {
                    tx.send(store.select_existing_seqnos().await).ok();
                });
            }
            InsertCommand::UpsertJettonMaster(data) => {
                self.run_upsert("jetton master", move |store| async move {
                    store.upsert_jetton_master(data).await
                });
            }
            InsertCommand::UpsertJettonWallet(data) => {
                self.run_upsert("jetton wallet", move |store| async move {
                    store.upsert_jetton_wallet(data).await
                });
            }
            InsertCommand::UpsertNftCollection(data) => {
                self.run_upsert("nft collection", move |store| async move {
                    store.upsert_nft_collection(data).await
                });
            }
            InsertCommand::UpsertNftItem(data) => {
                self.run_upsert("nft item", move |store| async move {
                    store.upsert_nft_item(data).await
                });
            }
            InsertCommand::BatchFinished => {
                self.active_workers = self.active_workers.saturating_sub(1);
                self.tick();
            }
        }
    }

    fn run_upsert<F, Fut>(&self, entity: &'static str, f: F)
    where
        F: FnOnce(Arc<dyn AnalyticalStore>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send,
    {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = f(store).await {
                tracing::error!(entity, "failed to upsert entity: {e:?}");
            }
        });
    }

    /// Spawns insert workers for batches assembled at the queue head while
    /// the worker budget and the batch caps allow.
    fn tick(&mut self) {
        while self.active_workers < self.config.max_parallel_insert_actors
            && !self.queue.is_empty()
        {
            let batch = self.assemble_batch();
            if batch.is_empty() {
                break;
            }
            self.spawn_worker(batch);
        }
    }

    /// Greedy but bounded: accumulates tasks from the queue head until the
    /// block count cap or any content cap would be exceeded. A head task
    /// that alone exceeds every cap is emitted as a singleton batch so the
    /// queue always drains.
    fn assemble_batch(&mut self) -> Vec<QueuedTask> {
        let caps = self.config.insert_caps();
        let mut batch = Vec::new();
        let mut batch_state = QueueState::default();

        while let Some(task) = self.queue.front() {
            let contribution = task.parsed_block.queue_contribution();
            let next_state = batch_state.checked_add(&contribution);

            if !batch.is_empty()
                && (batch.len() as u32 >= self.config.batch_blocks_count
                    || !next_state.fits_within(&caps))
            {
                break;
            }

            batch_state = next_state;
            let task = self.queue.pop_front().expect("queue front checked");
            self.queue_state -= contribution;
            batch.push(task);
        }

        self.report_queue_gauges();
        batch
    }

    fn spawn_worker(&mut self, batch: Vec<QueuedTask>) {
        self.active_workers += 1;
        let store = self.store.clone();
        let self_tx = self.self_tx.clone();

        tokio::spawn(async move {
            let _histogram =
                tondex_util::metrics::HistogramGuard::begin("tondex_insert_batch_time");

            let blocks: Vec<ParsedBlockPtr> =
                batch.iter().map(|task| task.parsed_block.clone()).collect();
            let first_seqno = batch.first().map(|task| task.mc_seqno).unwrap_or_default();
            let last_seqno = batch.last().map(|task| task.mc_seqno).unwrap_or_default();

            let res = store.insert_blocks(&blocks).await;
            match res {
                Ok(()) => {
                    tracing::debug!(first_seqno, last_seqno, "inserted batch");
                    for task in batch {
                        task.inserted.send(Ok(())).ok();
                    }
                }
                Err(e) => {
                    tracing::error!(batch_len = batch.len(), "failed to insert batch: {e:?}");
                    let e = Arc::new(e);
                    for task in batch {
                        task.inserted.send(Err(e.clone())).ok();
                    }
                }
            }

            self_tx.send(InsertCommand::BatchFinished).ok();
        });
    }

    fn report_queue_gauges(&self) {
        metrics::gauge!("tondex_insert_queue_mc_blocks").set(self.queue_state.mc_blocks);
        metrics::gauge!("tondex_insert_queue_blocks").set(self.queue_state.blocks);
        metrics::gauge!("tondex_insert_queue_txs").set(self.queue_state.txs);
        metrics::gauge!("tondex_insert_queue_msgs").set(self.queue_state.msgs);
    }
}

#[cfg(test)]
mod tests {
    use tondex_models::ProcessingContext;

    use super::*;
    use crate::models::ParsedBlock;
    use crate::store::InMemoryStore;

    fn parsed(mc_seqno: u32, txs: usize) -> ParsedBlockPtr {
        let mut context = ProcessingContext::default();
        for _ in 0..txs {
            context.transactions.push(tondex_models::Transaction {
                workchain: 0,
                account_id: Default::default(),
                lt: 0,
                time: 0,
                hash: Default::default(),
                block_shard: 0,
                block_seqno: mc_seqno,
                block_hash: Default::default(),
                mc_seqno,
                tx_type: tondex_models::TransactionType::Ordinary,
                aborted: false,
                balance_change: 0,
                exit_code: None,
                result_code: None,
            });
        }
        Arc::new(ParsedBlock {
            mc_seqno,
            block_count: 1,
            context,
            transactions: Vec::new(),
        })
    }

    fn manager_parts() -> (InsertManagerHandle, InsertManager, InMemoryStore) {
        let store = InMemoryStore::new();
        let (handle, manager) =
            InsertManager::new(InsertManagerConfig::default(), Arc::new(store.clone()));
        (handle, manager, store)
    }

    #[test]
    fn batch_respects_caps() {
        let store = InMemoryStore::new();
        let config = InsertManagerConfig {
            max_insert_txs: 10,
            ..Default::default()
        };
        let (_handle, mut manager) = InsertManager::new(config, Arc::new(store));

        for seqno in 0..4 {
            let parsed_block = parsed(seqno, 4);
            manager.queue_state += parsed_block.queue_contribution();
            manager.queue.push_back(QueuedTask {
                mc_seqno: seqno,
                parsed_block,
                inserted: oneshot::channel().0,
            });
        }

        // 4 + 4 + 4 > 10, so only two tasks fit.
        let batch = manager.assemble_batch();
        assert_eq!(batch.len(), 2);
        assert_eq!(manager.queue.len(), 2);
        assert_eq!(manager.queue_state.txs, 8);
    }

    #[test]
    fn oversized_head_goes_out_alone() {
        let store = InMemoryStore::new();
        let config = InsertManagerConfig {
            max_insert_txs: 10,
            ..Default::default()
        };
        let (_handle, mut manager) = InsertManager::new(config, Arc::new(store));

        let parsed_block = parsed(0, 200);
        manager.queue_state += parsed_block.queue_contribution();
        manager.queue.push_back(QueuedTask {
            mc_seqno: 0,
            parsed_block,
            inserted: oneshot::channel().0,
        });

        let batch = manager.assemble_batch();
        assert_eq!(batch.len(), 1);
        assert_eq!(manager.queue_state, QueueState::default());
    }

    #[tokio::test]
    async fn insert_roundtrip() {
        let (handle, manager, store) = manager_parts();
        let _actor = manager.spawn();

        let (state, inserted) = handle.insert(7, parsed(7, 3)).await.unwrap();
        assert_eq!(state.mc_blocks, 1);
        assert_eq!(state.txs, 3);

        inserted.await.unwrap().unwrap();
        assert!(store.contains_seqno(7));
        assert_eq!(store.transaction_count(), 3);

        // Queue is drained afterwards.
        let state = handle.get_queue_state().await.unwrap();
        assert_eq!(state, QueueState::default());
    }

    #[tokio::test]
    async fn batch_failure_fails_every_task() {
        let (handle, manager, store) = manager_parts();
        store.fail_next_inserts(1);
        let _actor = manager.spawn();

        let (_, inserted) = handle.insert(1, parsed(1, 1)).await.unwrap();
        assert!(inserted.await.unwrap().is_err());
        assert!(!store.contains_seqno(1));

        // The next attempt succeeds.
        let (_, inserted) = handle.insert(1, parsed(1, 1)).await.unwrap();
        inserted.await.unwrap().unwrap();
        assert!(store.contains_seqno(1));
    }
}
