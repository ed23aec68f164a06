use std::collections::BTreeMap;

use num_bigint::BigInt;
use serde::Serialize;
use tycho_types::cell::HashBytes;
use tycho_types::models::StdAddr;

/// Decoded TEP-64-style token metadata; keys are attribute names.
pub type TokenContent = BTreeMap<String, String>;

/// Jetton master state decoded from `get_jetton_data`.
#[derive(Debug, Clone, Serialize)]
pub struct JettonMasterData {
    pub address: StdAddr,
    pub total_supply: BigInt,
    pub mintable: bool,
    pub admin_address: Option<StdAddr>,
    pub jetton_content: Option<TokenContent>,
    pub jetton_wallet_code_hash: HashBytes,
    pub code_hash: HashBytes,
    pub data_hash: HashBytes,
    pub last_transaction_lt: u64,
    pub code_boc: Vec<u8>,
    pub data_boc: Vec<u8>,
}

/// Jetton wallet state decoded from `get_wallet_data`.
#[derive(Debug, Clone, Serialize)]
pub struct JettonWalletData {
    pub address: StdAddr,
    pub balance: BigInt,
    pub owner: StdAddr,
    pub jetton: StdAddr,
    pub code_hash: HashBytes,
    pub data_hash: HashBytes,
    pub last_transaction_lt: u64,
}

/// NFT collection state decoded from `get_collection_data`.
#[derive(Debug, Clone, Serialize)]
pub struct NftCollectionData {
    pub address: StdAddr,
    pub next_item_index: BigInt,
    pub owner_address: Option<StdAddr>,
    pub collection_content: Option<TokenContent>,
    pub code_hash: HashBytes,
    pub data_hash: HashBytes,
    pub last_transaction_lt: u64,
    pub code_boc: Vec<u8>,
    pub data_boc: Vec<u8>,
}

/// NFT item state decoded from `get_nft_data`.
#[derive(Debug, Clone, Serialize)]
pub struct NftItemData {
    pub address: StdAddr,
    pub init: bool,
    pub index: BigInt,
    pub collection_address: Option<StdAddr>,
    pub owner_address: Option<StdAddr>,
    pub content: Option<TokenContent>,
    pub code_hash: HashBytes,
    pub data_hash: HashBytes,
    pub last_transaction_lt: u64,
}

/// Jetton transfer notification payload (TEP-74 `transfer`).
#[derive(Debug, Clone, Serialize)]
pub struct JettonTransfer {
    pub transaction_hash: HashBytes,
    pub query_id: u64,
    pub amount: BigInt,
    pub source: StdAddr,
    pub destination: StdAddr,
    pub response_destination: Option<StdAddr>,
    pub custom_payload: Option<Vec<u8>>,
    pub forward_ton_amount: BigInt,
    pub forward_payload: Option<Vec<u8>>,
}

/// Jetton burn payload (TEP-74 `burn`).
#[derive(Debug, Clone, Serialize)]
pub struct JettonBurn {
    pub transaction_hash: HashBytes,
    pub query_id: u64,
    pub amount: BigInt,
    pub response_destination: Option<StdAddr>,
    pub custom_payload: Option<Vec<u8>>,
}

/// NFT ownership transfer payload (TEP-62 `transfer`).
#[derive(Debug, Clone, Serialize)]
pub struct NftTransfer {
    pub transaction_hash: HashBytes,
    pub query_id: u64,
    pub nft_item: StdAddr,
    pub old_owner: Option<StdAddr>,
    pub new_owner: StdAddr,
    pub response_destination: Option<StdAddr>,
    pub custom_payload: Option<Vec<u8>>,
    pub forward_amount: BigInt,
    pub forward_payload: Option<Vec<u8>>,
}
