use serde::Serialize;
use tycho_types::cell::HashBytes;

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub message_hash: HashBytes,
    pub src_workchain: i8,
    pub src_address: Option<HashBytes>,
    pub dst_workchain: i8,
    pub dst_address: Option<HashBytes>,
    pub message_type: MessageType,
    pub message_value: u64,
    pub ihr_fee: u64,
    pub fwd_fee: u64,
    pub import_fee: u64,
    pub created_lt: u64,
    pub created_at: u32,
    pub bounce: bool,
    pub bounced: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionMessage {
    pub transaction_hash: HashBytes,
    pub index_in_transaction: u16,
    pub is_out: bool,
    pub transaction_lt: u64,
    pub transaction_account_workchain: i8,
    pub transaction_account_address: HashBytes,
    pub block_hash: HashBytes,
    pub message_hash: HashBytes,
    pub message_type: MessageType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Internal,
    ExternalIn,
    ExternalOut,
}
