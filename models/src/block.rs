use serde::Serialize;
use tycho_types::cell::HashBytes;

#[derive(Debug, Clone, Serialize)]
pub struct Block {
    pub workchain: i8,
    pub shard: u64,
    pub seqno: u32,
    pub root_hash: HashBytes,
    pub file_hash: HashBytes,
    pub mc_seqno: u32,
    pub is_key_block: bool,
    pub transaction_count: u16,
    pub gen_utime: u32,
    pub gen_software_version: u32,
    pub start_lt: u64,
    pub end_lt: u64,
    pub prev1: HashBytes,
    pub prev1_seqno: u32,
    pub prev2: Option<HashBytes>,
    pub prev2_seqno: Option<u32>,
    pub prev_key_block: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountUpdate {
    pub workchain: i8,
    pub address: HashBytes,
    pub last_transaction_time: u32,
    pub last_transaction_lt: u64,
    pub state: AccountStateKind,
    pub code_hash: Option<HashBytes>,
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStateKind {
    NonExist,
    Uninit,
    Active,
    Frozen,
}
