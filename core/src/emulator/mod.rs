use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tondex_util::{FastHashMap, FastHashSet};
use tycho_types::cell::{Cell, HashBytes};
use tycho_types::models::{AccountState, IntAddr, MsgInfo, StdAddr};

use self::tail::{emulate_trace, TraceContext};
use crate::interfaces::DetectorSet;
use crate::models::{Trace, TraceId, TransactionInfo};
use crate::provider::MasterchainBlockDataState;
use crate::vm::ContractExecutor;
use crate::{IndexerError, Result};

mod tail;

/// Emulated hops per trace subtree are cut off beyond this depth.
pub const MAX_TRACE_DEPTH: u16 = 20;

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BlockEmulatorConfig {
    /// Wall-clock bound for a single VM call during emulation.
    ///
    /// Default: none, the VM's own budget applies.
    #[serde(with = "tondex_util::serde_helpers::humantime_opt")]
    pub vm_timeout: Option<std::time::Duration>,
}

/// Consumes completed traces (e.g. the stream-cache inserter).
pub trait TraceProcessor: Send + Sync + 'static {
    fn process<'a>(&'a self, trace: &'a Trace) -> BoxFuture<'a, anyhow::Result<()>>;
}

enum EmulatorCommand {
    StartFrom(u32),
    ProcessBlock {
        mc: MasterchainBlockDataState,
        transactions: Vec<TransactionInfo>,
    },
    SkipBlock(u32),
    TraceFinished {
        mc_seqno: u32,
        trace_id: TraceId,
    },
}

/// Mailbox of the block emulator actor.
#[derive(Clone)]
pub struct BlockEmulatorHandle {
    tx: mpsc::UnboundedSender<EmulatorCommand>,
}

impl BlockEmulatorHandle {
    /// Tells the emulator which seqno indexing starts at; everything below
    /// it will never arrive. Arrivals before this call fall back to the
    /// first observed seqno.
    pub fn start_from(&self, seqno: u32) {
        self.tx.send(EmulatorCommand::StartFrom(seqno)).ok();
    }

    /// Hands the parsed transactions of one seqno to the emulator.
    ///
    /// Blocks may arrive in any order; the emulator itself reorders by
    /// seqno so that interblock trace links resolve deterministically.
    pub fn process_block(
        &self,
        mc: MasterchainBlockDataState,
        transactions: Vec<TransactionInfo>,
    ) {
        self.tx
            .send(EmulatorCommand::ProcessBlock { mc, transactions })
            .ok();
    }

    /// Marks a permanently dropped seqno so the reorder cursor can move
    /// past it.
    pub fn skip_block(&self, seqno: u32) {
        self.tx.send(EmulatorCommand::SkipBlock(seqno)).ok();
    }
}

/// Reconstructs trace graphs across block boundaries and emulates the
/// missing hops through the VM.
pub struct BlockEmulator {
    config: BlockEmulatorConfig,
    executor: Arc<dyn ContractExecutor>,
    processor: Arc<dyn TraceProcessor>,
    detectors: Option<DetectorSet>,

    /// Trace membership of messages whose consumer was not seen yet.
    interblock_trace_ids: FastHashMap<HashBytes, TraceId>,
    /// Traces currently being emulated, to prevent duplicate emulation.
    traces_in_progress: FastHashSet<TraceId>,
    /// Per-seqno bookkeeping for the completion log line.
    blocks_in_progress: FastHashMap<u32, BlockProgress>,

    /// Reorder buffer for out-of-order scheduler completions; `None`
    /// entries are seqnos the scheduler dropped permanently.
    next_seqno: Option<u32>,
    pending: BTreeMap<u32, Option<(MasterchainBlockDataState, Vec<TransactionInfo>)>>,

    rx: mpsc::UnboundedReceiver<EmulatorCommand>,
    self_tx: mpsc::UnboundedSender<EmulatorCommand>,
}

struct BlockProgress {
    started_at: Instant,
    traces_left: usize,
    traces_total: usize,
}

impl BlockEmulator {
    pub fn new(
        config: BlockEmulatorConfig,
        executor: Arc<dyn ContractExecutor>,
        processor: Arc<dyn TraceProcessor>,
        detectors: Option<DetectorSet>,
    ) -> (BlockEmulatorHandle, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (BlockEmulatorHandle { tx: tx.clone() }, Self {
            config,
            executor,
            processor,
            detectors,
            interblock_trace_ids: FastHashMap::default(),
            traces_in_progress: FastHashSet::default(),
            blocks_in_progress: FastHashMap::default(),
            next_seqno: None,
            pending: BTreeMap::new(),
            rx,
            self_tx: tx,
        })
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                EmulatorCommand::StartFrom(seqno) => {
                    if self.next_seqno.is_none() {
                        self.next_seqno = Some(seqno);
                    }
                }
                EmulatorCommand::ProcessBlock { mc, transactions } => {
                    let seqno = mc.seqno();
                    self.enqueue(seqno, Some((mc, transactions)));
                }
                EmulatorCommand::SkipBlock(seqno) => {
                    self.enqueue(seqno, None);
                }
                EmulatorCommand::TraceFinished { mc_seqno, trace_id } => {
                    self.trace_finished(mc_seqno, trace_id);
                }
            }
        }
    }

    fn enqueue(
        &mut self,
        seqno: u32,
        block: Option<(MasterchainBlockDataState, Vec<TransactionInfo>)>,
    ) {
        let next = *self.next_seqno.get_or_insert(seqno);
        if seqno < next {
            tracing::warn!(seqno, next, "dropping already-emulated block");
            return;
        }

        self.pending.insert(seqno, block);
        self.try_process_next();
    }

    /// Blocks are emulated strictly one at a time in seqno order, so the
    /// interblock side table is complete before the next block reads it.
    fn try_process_next(&mut self) {
        while self.blocks_in_progress.is_empty() {
            let Some(next) = self.next_seqno else { break };
            let Some(entry) = self.pending.remove(&next) else {
                break;
            };
            self.next_seqno = Some(next + 1);
            match entry {
                Some((mc, transactions)) => self.process_block(mc, transactions),
                None => tracing::debug!(seqno = next, "skipping dropped block"),
            }
        }
    }

    fn process_block(&mut self, mc: MasterchainBlockDataState, mut txs: Vec<TransactionInfo>) {
        let mc_seqno = mc.seqno();

        txs.sort_by_key(|tx| tx.lt);
        assign_trace_ids(&mut txs, &mut self.interblock_trace_ids);

        let mut by_in_msg =
            FastHashMap::with_capacity_and_hasher(txs.len(), Default::default());
        for tx in &txs {
            by_in_msg.insert(tx.in_msg_hash, tx.clone());
        }
        let by_in_msg = Arc::new(by_in_msg);

        let mut traces_started = 0usize;
        for tx in txs {
            let Some(trace_id) = tx.initial_msg_hash else {
                // Orphans were already logged during assignment.
                continue;
            };
            if !self.traces_in_progress.insert(trace_id) {
                continue;
            }
            traces_started += 1;
            self.start_trace(mc.clone(), by_in_msg.clone(), tx, trace_id);
        }

        if traces_started == 0 {
            tracing::info!(mc_seqno, traces = 0, "finished emulating block");
        } else {
            self.blocks_in_progress.insert(mc_seqno, BlockProgress {
                started_at: Instant::now(),
                traces_left: traces_started,
                traces_total: traces_started,
            });
        }
    }

    fn start_trace(
        &self,
        mc: MasterchainBlockDataState,
        by_in_msg: Arc<FastHashMap<HashBytes, TransactionInfo>>,
        root_tx: TransactionInfo,
        trace_id: TraceId,
    ) {
        let mc_seqno = mc.seqno();
        let ctx = TraceContext {
            mc,
            by_in_msg,
            executor: self.executor.clone(),
            max_depth: MAX_TRACE_DEPTH,
            vm_timeout: self.config.vm_timeout,
        };
        let processor = self.processor.clone();
        let detectors = self.detectors.clone();
        let self_tx = self.self_tx.clone();
        let root_tx_hash = root_tx.hash;

        tokio::spawn(async move {
            match emulate_trace(ctx, root_tx).await {
                Ok(mut trace) => {
                    tracing::info!(
                        trace_id = %trace.id,
                        transactions = trace.transactions_count(),
                        depth = trace.depth(),
                        "emulated trace",
                    );

                    if let Some(detectors) = &detectors {
                        detect_trace_interfaces(detectors, &mut trace).await;
                    }

                    if let Err(e) = processor.process(&trace).await {
                        tracing::error!(trace_id = %trace.id, "failed to insert trace: {e:?}");
                    }
                }
                Err(e) => {
                    tracing::error!(
                        %trace_id,
                        root_tx = %root_tx_hash,
                        "failed to emulate trace: {e}",
                    );
                }
            }

            self_tx
                .send(EmulatorCommand::TraceFinished { mc_seqno, trace_id })
                .ok();
        });
    }

    fn trace_finished(&mut self, mc_seqno: u32, trace_id: TraceId) {
        self.traces_in_progress.remove(&trace_id);
        if let Some(progress) = self.blocks_in_progress.get_mut(&mc_seqno) {
            progress.traces_left -= 1;
            if progress.traces_left == 0 {
                self.block_finished(mc_seqno);
            }
        }
    }

    fn block_finished(&mut self, mc_seqno: u32) {
        if let Some(progress) = self.blocks_in_progress.remove(&mc_seqno) {
            tracing::info!(
                mc_seqno,
                traces = progress.traces_total,
                elapsed_ms = progress.started_at.elapsed().as_millis() as u64,
                "finished emulating block",
            );
        }
        self.try_process_next();
    }
}

/// Resolves the trace id of every transaction, in lt order:
/// external-in roots start a new trace, in-block children inherit from the
/// producer of their in-msg, cross-block children adopt from the rolling
/// side table. Unresolvable transactions are left orphaned with a warning
/// and do not block their siblings.
///
/// Every resolved transaction propagates its trace id to its out-msgs in
/// the side table so downstream blocks can attach.
fn assign_trace_ids(
    txs: &mut [TransactionInfo],
    interblock_trace_ids: &mut FastHashMap<HashBytes, TraceId>,
) {
    let mut by_out_msg: FastHashMap<HashBytes, usize> =
        FastHashMap::with_capacity_and_hasher(txs.len(), Default::default());
    for (index, tx) in txs.iter().enumerate() {
        for out_msg in &tx.out_msgs {
            by_out_msg.insert(out_msg.hash, index);
        }
    }

    for index in 0..txs.len() {
        let initial = if txs[index].is_first {
            Some(txs[index].in_msg_hash)
        } else if let Some(parent) = by_out_msg
            .get(&txs[index].in_msg_hash)
            .and_then(|&parent| txs[parent].initial_msg_hash)
        {
            Some(parent)
        } else if let Some(adopted) = interblock_trace_ids.get(&txs[index].in_msg_hash) {
            Some(*adopted)
        } else {
            tracing::warn!(
                tx_hash = %txs[index].hash,
                "couldn't resolve initial_msg_hash, transaction will be skipped",
            );
            None
        };

        txs[index].initial_msg_hash = initial;

        if let Some(initial) = initial {
            for out_msg in &txs[index].out_msgs {
                interblock_trace_ids.insert(out_msg.hash, initial);
            }
        }
    }
}

/// Classifies every account the VM mutated during the trace and attaches
/// the detected interfaces.
async fn detect_trace_interfaces(detectors: &DetectorSet, trace: &mut Trace) {
    for (address, mutations) in &trace.emulated_accounts {
        let Some((lt, Some(account))) = mutations.last() else {
            continue;
        };
        let AccountState::Active(state_init) = &account.state else {
            continue;
        };
        let (Some(code), Some(data)) = (&state_init.code, &state_init.data) else {
            continue;
        };

        let found = detectors.detect_all(address, code, data, *lt).await;
        if !found.is_empty() {
            trace.interfaces.insert(address.clone(), found);
        }
    }
}

/// Where an out-msg goes, for trace linkage.
pub(crate) enum MsgTarget {
    Internal(StdAddr),
    ExternalOut,
    ExternalIn,
}

pub(crate) fn msg_target(root: &Cell) -> Result<MsgTarget> {
    let info = root
        .parse::<MsgInfo>()
        .map_err(|e| IndexerError::MalformedBlock(anyhow::Error::new(e)))?;
    Ok(match info {
        MsgInfo::Int(info) => match info.dst {
            IntAddr::Std(addr) => MsgTarget::Internal(addr),
            IntAddr::Var(_) => {
                return Err(IndexerError::MalformedBlock(anyhow::anyhow!(
                    "var destination addresses are not supported"
                )))
            }
        },
        MsgInfo::ExtOut(_) => MsgTarget::ExternalOut,
        MsgInfo::ExtIn(_) => MsgTarget::ExternalIn,
    })
}

#[cfg(test)]
mod tests {
    use tycho_types::cell::{CellBuilder, CellFamily};

    use super::*;
    use crate::models::OutMsgInfo;

    fn hash(byte: u8) -> HashBytes {
        HashBytes([byte; 32])
    }

    fn tx(
        lt: u64,
        in_msg_hash: HashBytes,
        is_first: bool,
        out_msg_hashes: &[HashBytes],
    ) -> TransactionInfo {
        TransactionInfo {
            account: StdAddr::new(0, hash(0xaa)),
            lt,
            hash: hash(lt as u8),
            root: Cell::empty_cell(),
            in_msg_hash,
            is_first,
            out_msgs: out_msg_hashes
                .iter()
                .map(|h| OutMsgInfo {
                    hash: *h,
                    root: CellBuilder::new().build().unwrap(),
                })
                .collect(),
            initial_msg_hash: None,
        }
    }

    #[test]
    fn roots_and_children_resolve_in_block() {
        let mut interblock = FastHashMap::default();
        let mut txs = vec![
            tx(1, hash(1), true, &[hash(2), hash(3)]),
            tx(2, hash(2), false, &[]),
            tx(3, hash(3), false, &[hash(4)]),
        ];

        assign_trace_ids(&mut txs, &mut interblock);

        assert_eq!(txs[0].initial_msg_hash, Some(hash(1)));
        assert_eq!(txs[1].initial_msg_hash, Some(hash(1)));
        assert_eq!(txs[2].initial_msg_hash, Some(hash(1)));
        // The unmatched out-msg is exported for the next block.
        assert_eq!(interblock.get(&hash(4)), Some(&hash(1)));
    }

    #[test]
    fn interblock_adoption() {
        let mut interblock = FastHashMap::default();
        interblock.insert(hash(7), hash(42));

        let mut txs = vec![tx(5, hash(7), false, &[hash(8)])];
        assign_trace_ids(&mut txs, &mut interblock);

        assert_eq!(txs[0].initial_msg_hash, Some(hash(42)));
        assert_eq!(interblock.get(&hash(8)), Some(&hash(42)));
    }

    #[test]
    fn orphans_do_not_block_siblings() {
        let mut interblock = FastHashMap::default();
        let mut txs = vec![
            tx(1, hash(1), false, &[hash(9)]),
            tx(2, hash(2), true, &[]),
        ];

        assign_trace_ids(&mut txs, &mut interblock);

        assert_eq!(txs[0].initial_msg_hash, None);
        assert_eq!(txs[1].initial_msg_hash, Some(hash(2)));
        // Orphans must not export trace ids.
        assert!(!interblock.contains_key(&hash(9)));
    }
}
