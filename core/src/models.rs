use std::collections::BTreeMap;
use std::ops::{AddAssign, SubAssign};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tondex_models::ProcessingContext;
use tondex_util::FastHashMap;
use tycho_types::cell::{Cell, HashBytes};
use tycho_types::models::{Account, StdAddr};

use crate::interfaces::DetectedInterface;

/// The trace id is the hash of the external message that started the trace.
pub type TraceId = HashBytes;

/// Outbound message of a transaction.
///
/// External-out messages are retained here but never participate in trace
/// linkage.
#[derive(Debug, Clone)]
pub struct OutMsgInfo {
    pub hash: HashBytes,
    pub root: Cell,
}

/// A single ordinary transaction extracted from a block.
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    pub account: StdAddr,
    pub lt: u64,
    pub hash: HashBytes,
    pub root: Cell,
    pub in_msg_hash: HashBytes,
    /// Whether the inbound message is external-in.
    pub is_first: bool,
    /// Outbound messages in out-msg slot order.
    pub out_msgs: Vec<OutMsgInfo>,
    /// Hash of the message that started the whole trace, once resolved.
    pub initial_msg_hash: Option<HashBytes>,
}

/// A node of a reconstructed trace tree.
///
/// `node_id` equals the `in_msg_hash` of the transaction the node
/// represents; children are positionally indexed by the transaction's
/// out-msg slots (external-out slots are skipped).
#[derive(Debug, Clone)]
pub struct TraceNode {
    pub node_id: HashBytes,
    pub transaction_root: Cell,
    pub account: StdAddr,
    pub lt: u64,
    /// `true` iff the transaction was produced by the VM rather than
    /// observed on-chain.
    pub emulated: bool,
    pub children: Vec<TraceNode>,
}

impl TraceNode {
    pub fn transactions_count(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(TraceNode::transactions_count)
            .sum::<usize>()
    }

    pub fn depth(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(TraceNode::depth)
            .max()
            .unwrap_or(0)
    }
}

/// Account state after an emulated transaction, keyed by the lt of the
/// emulated transaction that produced it. `None` means the account is
/// still uninitialized.
pub type EmulatedAccounts = BTreeMap<StdAddr, Vec<(u64, Option<Box<Account>>)>>;

/// A fully reconstructed trace.
#[derive(Debug, Clone)]
pub struct Trace {
    pub id: TraceId,
    pub root: TraceNode,
    pub emulated_accounts: EmulatedAccounts,
    pub interfaces: FastHashMap<StdAddr, Vec<DetectedInterface>>,
}

impl Trace {
    pub fn transactions_count(&self) -> usize {
        self.root.transactions_count()
    }

    pub fn depth(&self) -> usize {
        self.root.depth()
    }
}

/// Occupancy counters of the insert queue, used for admission control.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueState {
    pub mc_blocks: u32,
    pub blocks: u32,
    pub txs: u32,
    pub msgs: u32,
}

impl QueueState {
    /// `true` iff every component is strictly below the matching cap.
    pub fn is_below(&self, caps: &QueueState) -> bool {
        self.mc_blocks < caps.mc_blocks
            && self.blocks < caps.blocks
            && self.txs < caps.txs
            && self.msgs < caps.msgs
    }

    /// `true` iff every component is less than or equal to the matching cap.
    pub fn fits_within(&self, caps: &QueueState) -> bool {
        self.mc_blocks <= caps.mc_blocks
            && self.blocks <= caps.blocks
            && self.txs <= caps.txs
            && self.msgs <= caps.msgs
    }

    pub fn checked_add(&self, other: &QueueState) -> QueueState {
        QueueState {
            mc_blocks: self.mc_blocks + other.mc_blocks,
            blocks: self.blocks + other.blocks,
            txs: self.txs + other.txs,
            msgs: self.msgs + other.msgs,
        }
    }
}

impl AddAssign for QueueState {
    fn add_assign(&mut self, rhs: QueueState) {
        self.mc_blocks += rhs.mc_blocks;
        self.blocks += rhs.blocks;
        self.txs += rhs.txs;
        self.msgs += rhs.msgs;
    }
}

impl SubAssign for QueueState {
    fn sub_assign(&mut self, rhs: QueueState) {
        self.mc_blocks = self.mc_blocks.saturating_sub(rhs.mc_blocks);
        self.blocks = self.blocks.saturating_sub(rhs.blocks);
        self.txs = self.txs.saturating_sub(rhs.txs);
        self.msgs = self.msgs.saturating_sub(rhs.msgs);
    }
}

/// Everything extracted from the blocks of one masterchain seqno.
#[derive(Debug)]
pub struct ParsedBlock {
    pub mc_seqno: u32,
    /// Total number of blocks contributing rows (masterchain + shards).
    pub block_count: u32,
    /// Rows for the analytical store.
    pub context: ProcessingContext,
    /// Ordinary transactions of all blocks, for trace reconstruction.
    pub transactions: Vec<TransactionInfo>,
}

pub type ParsedBlockPtr = Arc<ParsedBlock>;

impl ParsedBlock {
    /// Contribution of this block to the insert queue counters.
    pub fn queue_contribution(&self) -> QueueState {
        QueueState {
            mc_blocks: 1,
            blocks: self.block_count,
            txs: self.context.transactions.len() as u32,
            msgs: self.context.messages.len() as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use tycho_types::cell::CellFamily;

    use super::*;

    #[test]
    fn queue_state_admission() {
        let caps = QueueState {
            mc_blocks: 2,
            blocks: 4,
            txs: 100,
            msgs: 100,
        };

        let mut state = QueueState::default();
        assert!(state.is_below(&caps));

        state += QueueState {
            mc_blocks: 1,
            blocks: 2,
            txs: 100,
            msgs: 10,
        };
        assert!(!state.is_below(&caps));

        state -= QueueState {
            mc_blocks: 0,
            blocks: 0,
            txs: 50,
            msgs: 0,
        };
        assert!(state.is_below(&caps));

        // Subtraction saturates instead of wrapping.
        state -= QueueState {
            mc_blocks: 10,
            blocks: 10,
            txs: 1000,
            msgs: 1000,
        };
        assert_eq!(state, QueueState::default());
    }

    #[test]
    fn trace_node_stats() {
        fn node(children: Vec<TraceNode>) -> TraceNode {
            TraceNode {
                node_id: HashBytes::ZERO,
                transaction_root: Cell::empty_cell(),
                account: StdAddr::new(0, HashBytes::ZERO),
                lt: 0,
                emulated: false,
                children,
            }
        }

        let tree = node(vec![node(vec![node(vec![])]), node(vec![])]);
        assert_eq!(tree.transactions_count(), 4);
        assert_eq!(tree.depth(), 3);
    }
}
