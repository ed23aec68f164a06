#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tondex_core::emulator::TraceProcessor;
use tondex_core::models::{Trace, TransactionInfo};
use tondex_core::provider::{BlockSource, MasterchainBlockDataState, ShardBlockData};
use tondex_core::vm::{
    ContractExecutor, EmulatedTransaction, EmulationEnv, GetMethodOutput, GetMethodParams,
};
use tondex_core::{IndexerError, Result};
use tondex_util::FastHashMap;
use tycho_types::cell::{Cell, CellBuilder, CellFamily, HashBytes, Lazy, Store};
use tycho_types::models::{
    Account, AccountBlock, AccountStatus, Block, BlockExtra, BlockId, BlockInfo, BlockRef,
    BlockchainConfig, BlockchainConfigParams, ComputePhase, ComputePhaseSkipReason,
    CurrencyCollection, ExtInMsgInfo, HashUpdate, IntAddr, IntMsgInfo, MsgInfo, OrdinaryTxInfo,
    OutMsgQueueUpdates, PrevBlockRef, ShardAccounts, ShardIdent, SkippedComputePhase, StdAddr,
    Transaction, TxInfo,
};
use tycho_types::num::{Tokens, Uint15};
use tycho_types::prelude::Dict;

pub fn addr(byte: u8) -> StdAddr {
    StdAddr::new(0, HashBytes([byte; 32]))
}

/// Builds a full message cell: info, no state init, empty inline body.
pub fn msg_cell(info: MsgInfo) -> Cell {
    let mut b = CellBuilder::new();
    info.store_into(&mut b, Cell::empty_context()).unwrap();
    b.store_bit(false).unwrap();
    b.store_bit(false).unwrap();
    b.build().unwrap()
}

/// External-in message; `salt` makes the hash unique.
pub fn ext_in_msg(dst: &StdAddr, salt: u64) -> Cell {
    msg_cell(MsgInfo::ExtIn(ExtInMsgInfo {
        dst: IntAddr::Std(dst.clone()),
        import_fee: Tokens::new(salt as u128),
        ..Default::default()
    }))
}

/// Internal message; `created_lt` makes the hash unique.
pub fn int_msg(src: &StdAddr, dst: &StdAddr, created_lt: u64) -> Cell {
    msg_cell(MsgInfo::Int(IntMsgInfo {
        src: IntAddr::Std(src.clone()),
        dst: IntAddr::Std(dst.clone()),
        created_lt,
        ..Default::default()
    }))
}

pub struct TxSpec {
    pub account: StdAddr,
    pub lt: u64,
    pub in_msg: Cell,
    pub out_msgs: Vec<Cell>,
}

fn build_transaction(spec: &TxSpec) -> Lazy<Transaction> {
    let mut out_msgs = Dict::<Uint15, Cell>::new();
    for (index, msg) in spec.out_msgs.iter().enumerate() {
        out_msgs.set(Uint15::new(index as u16), msg.clone()).unwrap();
    }

    let info = TxInfo::Ordinary(OrdinaryTxInfo {
        credit_first: true,
        storage_phase: None,
        credit_phase: None,
        compute_phase: ComputePhase::Skipped(SkippedComputePhase {
            reason: ComputePhaseSkipReason::NoState,
        }),
        action_phase: None,
        aborted: false,
        bounce_phase: None,
        destroyed: false,
    });

    Lazy::new(&Transaction {
        account: spec.account.address,
        lt: spec.lt,
        prev_trans_hash: HashBytes::ZERO,
        prev_trans_lt: 0,
        now: 1_700_000_000,
        out_msg_count: Uint15::new(spec.out_msgs.len() as u16),
        orig_status: AccountStatus::Active,
        end_status: AccountStatus::Active,
        in_msg: Some(spec.in_msg.clone()),
        out_msgs,
        total_fees: CurrencyCollection::ZERO,
        state_update: Lazy::new(&HashUpdate {
            old: HashBytes::ZERO,
            new: HashBytes::ZERO,
        })
        .unwrap(),
        info: Lazy::new(&info).unwrap(),
    })
    .unwrap()
}

/// Builds a masterchain block (with its post state) holding the given
/// transactions.
pub fn build_mc_state(seqno: u32, txs: &[TxSpec]) -> MasterchainBlockDataState {
    build_mc_state_with_accounts(seqno, txs, ShardAccounts::new())
}

pub fn build_mc_state_with_accounts(
    seqno: u32,
    txs: &[TxSpec],
    accounts: ShardAccounts,
) -> MasterchainBlockDataState {
    let mut by_account: BTreeMap<HashBytes, BTreeMap<u64, (CurrencyCollection, Lazy<Transaction>)>> =
        BTreeMap::new();
    for spec in txs {
        by_account
            .entry(spec.account.address)
            .or_default()
            .insert(spec.lt, (CurrencyCollection::ZERO, build_transaction(spec)));
    }

    let mut account_blocks: BTreeMap<HashBytes, (CurrencyCollection, AccountBlock)> =
        BTreeMap::new();
    for (account, transactions) in by_account {
        let account_block = AccountBlock {
            account,
            transactions: tycho_types::dict::AugDict::try_from_btree(&transactions).unwrap(),
            state_update: Lazy::new(&HashUpdate {
                old: HashBytes::ZERO,
                new: HashBytes::ZERO,
            })
            .unwrap(),
        };
        account_blocks.insert(account, (CurrencyCollection::ZERO, account_block));
    }
    let account_blocks = tycho_types::dict::AugDict::try_from_btree(&account_blocks).unwrap();

    let mut info = BlockInfo {
        shard: ShardIdent::MASTERCHAIN,
        seqno,
        gen_utime: 1_700_000_000,
        start_lt: 1_000,
        end_lt: 2_000,
        ..Default::default()
    };
    info.set_prev_ref(&PrevBlockRef::Single(BlockRef {
        end_lt: 0,
        seqno: seqno.saturating_sub(1),
        root_hash: HashBytes::ZERO,
        file_hash: HashBytes::ZERO,
    }));

    let extra = BlockExtra {
        account_blocks: Lazy::new(&account_blocks).unwrap(),
        ..Default::default()
    };

    let block = Block {
        global_id: 0,
        info: Lazy::new(&info).unwrap(),
        value_flow: Lazy::from_raw(Cell::empty_cell()).unwrap(),
        state_update: Lazy::from_raw(Cell::empty_cell()).unwrap(),
        out_msg_queue_updates: OutMsgQueueUpdates {
            diff_hash: HashBytes::ZERO,
            tail_len: 0,
        },
        extra: Lazy::new(&extra).unwrap(),
    };

    let root = CellBuilder::build_from(&block).unwrap();
    let block_id = BlockId {
        shard: ShardIdent::MASTERCHAIN,
        seqno,
        root_hash: *root.repr_hash(),
        file_hash: HashBytes([seqno as u8; 32]),
    };

    MasterchainBlockDataState::new(
        vec![ShardBlockData {
            block_id,
            block,
            root,
            accounts,
        }],
        vec![block_id],
        BlockchainConfig {
            address: HashBytes::ZERO,
            params: BlockchainConfigParams::from_raw(Cell::empty_cell()),
        },
        Dict::new(),
    )
    .unwrap()
}

/// Parsed-transaction view of a `TxSpec`, bypassing the block parser.
pub fn tx_info(spec: &TxSpec, is_first: bool) -> TransactionInfo {
    TransactionInfo {
        account: spec.account.clone(),
        lt: spec.lt,
        hash: HashBytes([spec.lt as u8; 32]),
        root: build_transaction(spec).inner().clone(),
        in_msg_hash: *spec.in_msg.repr_hash(),
        is_first,
        out_msgs: spec
            .out_msgs
            .iter()
            .map(|msg| tondex_core::models::OutMsgInfo {
                hash: *msg.repr_hash(),
                root: msg.clone(),
            })
            .collect(),
        initial_msg_hash: None,
    }
}

/// Block source serving pre-built block states.
#[derive(Default)]
pub struct StubBlockSource {
    blocks: Mutex<BTreeMap<u32, MasterchainBlockDataState>>,
}

impl StubBlockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, state: MasterchainBlockDataState) {
        self.blocks.lock().insert(state.seqno(), state);
    }
}

impl BlockSource for StubBlockSource {
    fn get_last_known_seqno(&self) -> BoxFuture<'_, Result<u32>> {
        async move {
            self.blocks
                .lock()
                .keys()
                .next_back()
                .copied()
                .ok_or(IndexerError::NotFound("no blocks yet"))
        }
        .boxed()
    }

    fn fetch_masterchain(&self, seqno: u32) -> BoxFuture<'_, Result<MasterchainBlockDataState>> {
        async move {
            self.blocks
                .lock()
                .get(&seqno)
                .cloned()
                .ok_or(IndexerError::NotFound("block is not known yet"))
        }
        .boxed()
    }
}

/// VM stub scripted per in-msg hash (emulation) and per code hash + method
/// (get-methods).
#[derive(Default)]
pub struct ScriptedExecutor {
    emulations: Mutex<FastHashMap<HashBytes, ScriptedEmulation>>,
    methods: Mutex<FastHashMap<(HashBytes, &'static str), GetMethodOutputSpec>>,
}

pub struct ScriptedEmulation {
    pub lt: u64,
    pub out_msgs: Vec<Cell>,
    pub account: Option<Box<Account>>,
}

pub struct GetMethodOutputSpec {
    pub success: bool,
    pub stack: Vec<tondex_core::vm::StackEntry>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_emulation(&self, in_msg: &Cell, emulation: ScriptedEmulation) {
        self.emulations.lock().insert(*in_msg.repr_hash(), emulation);
    }

    pub fn script_method(
        &self,
        code: &Cell,
        method: &'static str,
        success: bool,
        stack: Vec<tondex_core::vm::StackEntry>,
    ) {
        self.methods
            .lock()
            .insert((*code.repr_hash(), method), GetMethodOutputSpec { success, stack });
    }
}

impl ContractExecutor for ScriptedExecutor {
    fn run_get_method(&self, params: GetMethodParams) -> Result<GetMethodOutput> {
        match self.methods.lock().get(&(*params.code.repr_hash(), params.method)) {
            Some(spec) => Ok(GetMethodOutput {
                success: spec.success,
                stack: spec.stack.clone(),
            }),
            None => Ok(GetMethodOutput {
                success: false,
                stack: Vec::new(),
            }),
        }
    }

    fn emulate_transaction(
        &self,
        _env: &EmulationEnv,
        _account: Option<&Account>,
        in_msg: &Cell,
    ) -> Result<EmulatedTransaction> {
        let emulations = self.emulations.lock();
        let Some(emulation) = emulations.get(in_msg.repr_hash()) else {
            return Err(IndexerError::Vm("unscripted emulation".to_owned()));
        };

        let mut b = CellBuilder::new();
        b.store_u64(emulation.lt).unwrap();
        let transaction_root = b.build().unwrap();

        Ok(EmulatedTransaction {
            account: emulation.account.clone(),
            lt: emulation.lt,
            transaction_root,
            out_msgs: emulation.out_msgs.clone(),
        })
    }
}

/// Trace processor that records every committed trace.
#[derive(Default)]
pub struct CapturingProcessor {
    traces: Mutex<Vec<Trace>>,
}

impl CapturingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traces(&self) -> Vec<Trace> {
        self.traces.lock().clone()
    }

    pub async fn wait_for(&self, count: usize) -> Vec<Trace> {
        for _ in 0..500 {
            let traces = self.traces.lock().clone();
            if traces.len() >= count {
                return traces;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {count} traces");
    }
}

impl TraceProcessor for CapturingProcessor {
    fn process<'a>(&'a self, trace: &'a Trace) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            self.traces.lock().push(trace.clone());
            Ok(())
        }
        .boxed()
    }
}

/// Polls until the condition holds or a few seconds elapse.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for condition");
}
