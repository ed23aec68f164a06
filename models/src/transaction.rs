use serde::Serialize;
use tycho_types::cell::HashBytes;

#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub workchain: i8,
    pub account_id: HashBytes,
    pub lt: u64,
    pub time: u32,
    pub hash: HashBytes,
    pub block_shard: u64,
    pub block_seqno: u32,
    pub block_hash: HashBytes,
    pub mc_seqno: u32,
    pub tx_type: TransactionType,
    pub aborted: bool,
    pub balance_change: i64,
    /// Compute phase result.
    pub exit_code: Option<i32>,
    /// Action phase result.
    pub result_code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Ordinary,
    TickTock,
    Storage,
}
