use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tondex_util::serde_helpers;
use tondex_util::sync::rayon_run;
use tondex_util::{FastHashMap, FastHashSet};

use crate::emulator::BlockEmulatorHandle;
use crate::insert::InsertManagerHandle;
use crate::models::{ParsedBlockPtr, QueueState};
use crate::parser::parse_masterchain;
use crate::provider::{BlockSource, MasterchainBlockDataState};
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSchedulerConfig {
    /// Max number of seqnos in flight at once.
    ///
    /// Default: 32.
    pub max_active_tasks: usize,

    /// Admission stalls while the insert queue is at or above any of these
    /// caps.
    ///
    /// Defaults: 16384 mc blocks, 16384 blocks, 524288 txs, 524288 msgs.
    pub max_queue_mc_blocks: u32,
    pub max_queue_blocks: u32,
    pub max_queue_txs: u32,
    pub max_queue_msgs: u32,

    /// Tip refresh and progress reporting period.
    ///
    /// Default: 1 second.
    #[serde(with = "serde_helpers::humantime")]
    pub tick_interval: Duration,

    /// Indexing starts above this seqno unless the store knows better.
    ///
    /// Default: 0.
    pub from_seqno: u32,
}

impl Default for IndexSchedulerConfig {
    fn default() -> Self {
        Self {
            max_active_tasks: 32,
            max_queue_mc_blocks: 16384,
            max_queue_blocks: 16384,
            max_queue_txs: 524288,
            max_queue_msgs: 524288,
            tick_interval: Duration::from_secs(1),
            from_seqno: 0,
        }
    }
}

impl IndexSchedulerConfig {
    fn queue_caps(&self) -> QueueState {
        QueueState {
            mc_blocks: self.max_queue_mc_blocks,
            blocks: self.max_queue_blocks,
            txs: self.max_queue_txs,
            msgs: self.max_queue_msgs,
        }
    }
}

enum SchedulerEvent {
    GotLastKnownSeqno(Result<u32>),
    Fetched {
        seqno: u32,
        result: Result<MasterchainBlockDataState>,
    },
    Parsed {
        seqno: u32,
        mc: MasterchainBlockDataState,
        result: Result<crate::models::ParsedBlock>,
    },
    InsertQueued {
        seqno: u32,
        state: QueueState,
    },
    QueueStateRefreshed(QueueState),
    Inserted {
        seqno: u32,
        tx_count: u64,
        result: std::result::Result<(), Arc<anyhow::Error>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct IndexSchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerEvent>,
}

impl IndexSchedulerHandle {
    /// Stops admission and waits for the in-flight seqnos to drain.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(SchedulerEvent::Shutdown { done: tx }).is_ok() {
            rx.await.ok();
        }
    }
}

/// Coordinates the bounded pipeline `fetch -> parse -> enrich -> persist`
/// for masterchain seqnos, enforcing backpressure from the insert queue.
pub struct IndexScheduler {
    config: IndexSchedulerConfig,
    block_source: Arc<dyn BlockSource>,
    insert: InsertManagerHandle,
    emulator: BlockEmulatorHandle,

    queued_seqnos: VecDeque<u32>,
    queued_set: FastHashSet<u32>,
    processing_seqnos: BTreeSet<u32>,
    existing_seqnos: BTreeSet<u32>,
    /// Parsed blocks waiting for (or retrying) persistence; keyed by seqno
    /// so an insert failure re-queues without refetching.
    pending_insert: FastHashMap<u32, ParsedBlockPtr>,

    last_known_seqno: u32,
    last_indexed_seqno: u32,

    insert_queue_state: QueueState,
    /// Set after a fetch failure; admission resumes at the next tick.
    fetch_backoff: bool,

    txs_since_tick: u64,
    last_tick_at: Instant,
    avg_tps: f64,

    shutdown: Option<oneshot::Sender<()>>,

    rx: mpsc::UnboundedReceiver<SchedulerEvent>,
    self_tx: mpsc::UnboundedSender<SchedulerEvent>,
}

impl IndexScheduler {
    pub fn new(
        config: IndexSchedulerConfig,
        block_source: Arc<dyn BlockSource>,
        insert: InsertManagerHandle,
        emulator: BlockEmulatorHandle,
    ) -> (IndexSchedulerHandle, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (IndexSchedulerHandle { tx: tx.clone() }, Self {
            config,
            block_source,
            insert,
            emulator,
            queued_seqnos: VecDeque::new(),
            queued_set: FastHashSet::default(),
            processing_seqnos: BTreeSet::new(),
            existing_seqnos: BTreeSet::new(),
            pending_insert: FastHashMap::default(),
            last_known_seqno: 0,
            last_indexed_seqno: 0,
            insert_queue_state: QueueState::default(),
            fetch_backoff: false,
            txs_since_tick: 0,
            last_tick_at: Instant::now(),
            avg_tps: 0.0,
            shutdown: None,
            rx,
            self_tx: tx,
        })
    }

    /// Drives the scheduler until shutdown is requested and the in-flight
    /// work drains.
    pub async fn run(mut self) -> Result<()> {
        self.start().await?;

        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = interval.tick() => self.tick(),
            }

            if let Some(done) = self.try_finish_shutdown() {
                done.send(()).ok();
                break;
            }
        }

        tracing::info!("index scheduler stopped");
        Ok(())
    }

    /// Loads the set of already-indexed seqnos and discovers the chain tip.
    async fn start(&mut self) -> Result<()> {
        self.existing_seqnos = self.insert.get_existing_seqnos().await?;

        let existing_max = self.existing_seqnos.iter().next_back().copied().unwrap_or(0);
        self.last_known_seqno = existing_max.max(self.config.from_seqno);
        self.last_indexed_seqno = self.last_known_seqno;
        self.advance_last_indexed();
        self.emulator.start_from(self.last_known_seqno + 1);

        tracing::info!(
            existing = self.existing_seqnos.len(),
            from_seqno = self.last_known_seqno + 1,
            "index scheduler starting",
        );

        self.request_last_known_seqno();
        Ok(())
    }

    fn handle(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::GotLastKnownSeqno(result) => match result {
                Ok(tip) => {
                    self.enqueue_new_seqnos(tip);
                    self.schedule_next();
                }
                Err(e) => tracing::warn!("failed to get last known seqno: {e}"),
            },
            SchedulerEvent::Fetched { seqno, result } => match result {
                Ok(mc) => self.spawn_parse(seqno, mc),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(seqno, "fetch failed, rescheduling: {e}");
                    self.reschedule_seqno(seqno);
                }
                Err(e) => {
                    tracing::error!(seqno, "dropping seqno, fetch failed permanently: {e:?}");
                    self.processing_seqnos.remove(&seqno);
                    self.emulator.skip_block(seqno);
                }
            },
            SchedulerEvent::Parsed { seqno, mc, result } => match result {
                Ok(parsed) => {
                    let parsed = Arc::new(parsed);
                    self.emulator
                        .process_block(mc, parsed.transactions.clone());
                    self.pending_insert.insert(seqno, parsed.clone());
                    self.spawn_insert(seqno, parsed);
                }
                Err(e) if e.is_retryable() => {
                    tracing::debug!(seqno, "parse failed, rescheduling: {e}");
                    self.reschedule_seqno(seqno);
                }
                Err(e) => {
                    tracing::error!(seqno, "dropping seqno, block is malformed: {e:?}");
                    self.processing_seqnos.remove(&seqno);
                    self.emulator.skip_block(seqno);
                }
            },
            SchedulerEvent::InsertQueued { seqno, state } => {
                tracing::debug!(seqno, "queued for insert");
                self.insert_queue_state = state;
                self.schedule_next();
            }
            SchedulerEvent::QueueStateRefreshed(state) => {
                self.insert_queue_state = state;
                self.schedule_next();
            }
            SchedulerEvent::Inserted {
                seqno,
                tx_count,
                result,
            } => match result {
                Ok(()) => {
                    self.processing_seqnos.remove(&seqno);
                    self.pending_insert.remove(&seqno);
                    self.existing_seqnos.insert(seqno);
                    self.txs_since_tick += tx_count;
                    self.advance_last_indexed();
                    self.schedule_next();
                }
                Err(e) => {
                    tracing::warn!(seqno, "insert failed, re-queueing batch member: {e}");
                    if let Some(parsed) = self.pending_insert.get(&seqno) {
                        self.spawn_insert(seqno, parsed.clone());
                    } else {
                        self.reschedule_seqno(seqno);
                    }
                }
            },
            SchedulerEvent::Shutdown { done } => {
                tracing::info!("index scheduler draining for shutdown");
                self.shutdown = Some(done);
            }
        }
    }

    /// Periodic: refreshes the tip, reports progress, schedules admissions.
    fn tick(&mut self) {
        self.fetch_backoff = false;

        let elapsed = self.last_tick_at.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.avg_tps = self.txs_since_tick as f64 / elapsed;
        }
        self.txs_since_tick = 0;
        self.last_tick_at = Instant::now();

        metrics::gauge!("tondex_last_known_seqno").set(self.last_known_seqno);
        metrics::gauge!("tondex_last_indexed_seqno").set(self.last_indexed_seqno);
        metrics::gauge!("tondex_processing_seqnos").set(self.processing_seqnos.len() as f64);
        metrics::gauge!("tondex_queued_seqnos").set(self.queued_seqnos.len() as f64);

        tracing::info!(
            last_known = self.last_known_seqno,
            last_indexed = self.last_indexed_seqno,
            queued = self.queued_seqnos.len(),
            processing = self.processing_seqnos.len(),
            avg_tps = format!("{:.1}", self.avg_tps),
            "indexing progress",
        );

        self.request_last_known_seqno();
        self.request_queue_state();
        self.schedule_next();
    }

    /// Admission rule: fill the active-task budget while the insert queue
    /// is strictly below every cap. Work is delayed, never dropped.
    fn schedule_next(&mut self) {
        if self.shutdown.is_some() || self.fetch_backoff {
            return;
        }

        let caps = self.config.queue_caps();
        while self.processing_seqnos.len() < self.config.max_active_tasks
            && self.insert_queue_state.is_below(&caps)
        {
            let Some(seqno) = self.queued_seqnos.pop_front() else {
                break;
            };
            self.queued_set.remove(&seqno);
            self.processing_seqnos.insert(seqno);
            self.spawn_fetch(seqno);
        }
    }

    /// Reinserts a transiently failed seqno at the queue head.
    fn reschedule_seqno(&mut self, seqno: u32) {
        self.processing_seqnos.remove(&seqno);
        self.pending_insert.remove(&seqno);
        if self.queued_set.insert(seqno) {
            self.queued_seqnos.push_front(seqno);
        }
        self.fetch_backoff = true;
    }

    fn enqueue_new_seqnos(&mut self, tip: u32) {
        for seqno in (self.last_known_seqno + 1)..=tip {
            if self.existing_seqnos.contains(&seqno)
                || self.processing_seqnos.contains(&seqno)
                || !self.queued_set.insert(seqno)
            {
                continue;
            }
            self.queued_seqnos.push_back(seqno);
        }
        self.last_known_seqno = self.last_known_seqno.max(tip);
    }

    fn spawn_fetch(&self, seqno: u32) {
        let source = self.block_source.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = source.fetch_masterchain(seqno).await;
            tx.send(SchedulerEvent::Fetched { seqno, result }).ok();
        });
    }

    fn spawn_parse(&self, seqno: u32, mc: MasterchainBlockDataState) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = {
                let mc = mc.clone();
                rayon_run(move || parse_masterchain(&mc)).await
            };
            tx.send(SchedulerEvent::Parsed { seqno, mc, result }).ok();
        });
    }

    fn spawn_insert(&self, seqno: u32, parsed: ParsedBlockPtr) {
        let insert = self.insert.clone();
        let tx = self.self_tx.clone();
        let tx_count = parsed.context.transactions.len() as u64;
        tokio::spawn(async move {
            match insert.insert(seqno, parsed).await {
                Ok((state, inserted_rx)) => {
                    tx.send(SchedulerEvent::InsertQueued { seqno, state }).ok();
                    let result = match inserted_rx.await {
                        Ok(result) => result,
                        Err(_) => Err(Arc::new(anyhow::anyhow!("insert manager stopped"))),
                    };
                    tx.send(SchedulerEvent::Inserted {
                        seqno,
                        tx_count,
                        result,
                    })
                    .ok();
                }
                Err(e) => {
                    tx.send(SchedulerEvent::Inserted {
                        seqno,
                        tx_count,
                        result: Err(Arc::new(anyhow::Error::new(e))),
                    })
                    .ok();
                }
            }
        });
    }

    fn request_last_known_seqno(&self) {
        let source = self.block_source.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = source.get_last_known_seqno().await;
            tx.send(SchedulerEvent::GotLastKnownSeqno(result)).ok();
        });
    }

    fn request_queue_state(&self) {
        let insert = self.insert.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            if let Ok(state) = insert.get_queue_state().await {
                tx.send(SchedulerEvent::QueueStateRefreshed(state)).ok();
            }
        });
    }

    /// The reported "last indexed" seqno is the longest contiguous prefix
    /// of completions, not the latest one.
    fn advance_last_indexed(&mut self) {
        while self.existing_seqnos.contains(&(self.last_indexed_seqno + 1)) {
            self.last_indexed_seqno += 1;
        }
    }

    fn try_finish_shutdown(&mut self) -> Option<oneshot::Sender<()>> {
        if self.shutdown.is_some() && self.processing_seqnos.is_empty() {
            self.shutdown.take()
        } else {
            None
        }
    }
}
