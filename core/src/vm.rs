use num_bigint::BigInt;
use tycho_types::cell::{Cell, HashBytes};
use tycho_types::models::{Account, BlockchainConfig, LibDescr, StdAddr};
use tycho_types::prelude::Dict;

use crate::Result;

/// A value on the TVM stack, as returned by get-methods.
#[derive(Debug, Clone)]
pub enum StackEntry {
    Null,
    Int(BigInt),
    Cell(Cell),
    /// A slice value, carried as the cell it points into.
    Slice(Cell),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackEntryKind {
    Null,
    Int,
    Cell,
    Slice,
}

impl StackEntry {
    pub fn kind(&self) -> StackEntryKind {
        match self {
            Self::Null => StackEntryKind::Null,
            Self::Int(_) => StackEntryKind::Int,
            Self::Cell(_) => StackEntryKind::Cell,
            Self::Slice(_) => StackEntryKind::Slice,
        }
    }

    pub fn as_int(&self) -> Option<&BigInt> {
        match self {
            Self::Int(int) => Some(int),
            _ => None,
        }
    }

    pub fn as_cell(&self) -> Option<&Cell> {
        match self {
            Self::Cell(cell) => Some(cell),
            _ => None,
        }
    }

    pub fn as_slice_cell(&self) -> Option<&Cell> {
        match self {
            Self::Slice(cell) => Some(cell),
            _ => None,
        }
    }
}

/// Input of a read-only get-method call.
pub struct GetMethodParams {
    pub code: Cell,
    pub data: Cell,
    pub address: StdAddr,
    pub method: &'static str,
    pub stack: Vec<StackEntry>,
    pub now: u32,
}

/// Raw outcome of a get-method call. `success == false` means the VM did
/// not terminate normally (e.g. the method is missing).
pub struct GetMethodOutput {
    pub success: bool,
    pub stack: Vec<StackEntry>,
}

/// Chain parameters needed to emulate a transaction.
#[derive(Clone)]
pub struct EmulationEnv {
    pub config: BlockchainConfig,
    pub libraries: Dict<HashBytes, LibDescr>,
    /// Unix time the emulated transactions are executed at.
    pub now: u32,
}

/// A transaction synthesized by the VM.
pub struct EmulatedTransaction {
    /// Account state after the transaction; `None` when it stays
    /// uninitialized.
    pub account: Option<Box<Account>>,
    pub lt: u64,
    pub transaction_root: Cell,
    /// Outbound message cells in slot order.
    pub out_msgs: Vec<Cell>,
}

/// The smart-contract VM, consumed by detectors and the trace emulator.
///
/// Implementations are synchronous: callers bridge them to the async world
/// through the rayon pool.
pub trait ContractExecutor: Send + Sync + 'static {
    fn run_get_method(&self, params: GetMethodParams) -> Result<GetMethodOutput>;

    fn emulate_transaction(
        &self,
        env: &EmulationEnv,
        account: Option<&Account>,
        in_msg: &Cell,
    ) -> Result<EmulatedTransaction>;
}

/// Stub executor for wirings without a VM: every get-method reports
/// failure and emulation is unavailable.
pub struct NoopExecutor;

impl ContractExecutor for NoopExecutor {
    fn run_get_method(&self, _params: GetMethodParams) -> Result<GetMethodOutput> {
        Ok(GetMethodOutput {
            success: false,
            stack: Vec::new(),
        })
    }

    fn emulate_transaction(
        &self,
        _env: &EmulationEnv,
        _account: Option<&Account>,
        _in_msg: &Cell,
    ) -> Result<EmulatedTransaction> {
        Err(crate::IndexerError::Vm(
            "transaction emulation is not available".to_owned(),
        ))
    }
}
