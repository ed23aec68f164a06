use std::sync::Arc;

use num_bigint::BigInt;
use tondex_core::insert::InsertManager;
use tondex_core::interfaces::{
    InterfaceManager, JettonMasterDetector, JettonMasterHandle, JettonWalletDetector,
    JettonWalletHandle,
};
use tondex_core::store::InMemoryStore;
use tondex_core::vm::StackEntry;
use tondex_core::IndexerError;
use tycho_types::cell::{Cell, CellBuilder};
use tycho_types::models::IntAddr;

use self::common::{addr, wait_until, ScriptedExecutor};

mod common;

fn cell(tag: u32) -> Cell {
    let mut b = CellBuilder::new();
    b.store_u32(tag).unwrap();
    b.build().unwrap()
}

fn addr_slice(address: &tycho_types::models::StdAddr) -> Cell {
    CellBuilder::build_from(IntAddr::Std(address.clone())).unwrap()
}

fn offchain_content(uri: &str) -> Cell {
    let mut b = CellBuilder::new();
    b.store_u8(0x01).unwrap();
    b.store_raw(uri.as_bytes(), (uri.len() * 8) as u16).unwrap();
    b.build().unwrap()
}

struct Detectors {
    executor: Arc<ScriptedExecutor>,
    store: InMemoryStore,
    master: JettonMasterHandle,
    wallet: JettonWalletHandle,
}

fn spawn_detectors() -> Detectors {
    let executor = Arc::new(ScriptedExecutor::new());
    let store = InMemoryStore::new();

    let (insert, insert_manager) = InsertManager::new(Default::default(), Arc::new(store.clone()));
    insert_manager.spawn();

    let (manager, interface_manager) = InterfaceManager::new();
    interface_manager.spawn();

    let (master, master_actor) =
        JettonMasterDetector::new(manager.clone(), insert.clone(), executor.clone());
    master_actor.spawn();

    let (wallet, wallet_actor) =
        JettonWalletDetector::new(master.clone(), manager, insert, executor.clone());
    wallet_actor.spawn();

    Detectors {
        executor,
        store,
        master,
        wallet,
    }
}

/// S4: a wallet whose master is not yet indexed is accepted provisionally,
/// and a later detection of the master does not retroactively reject it.
#[tokio::test]
async fn provisional_wallet_survives_master_detection() {
    let detectors = spawn_detectors();

    let wallet_address = addr(1);
    let owner = addr(2);
    let master_address = addr(3);

    let wallet_code = cell(100);
    let wallet_data = cell(101);
    detectors.executor.script_method(
        &wallet_code,
        "get_wallet_data",
        true,
        vec![
            StackEntry::Int(BigInt::from(500)),
            StackEntry::Slice(addr_slice(&owner)),
            StackEntry::Slice(addr_slice(&master_address)),
            StackEntry::Cell(wallet_code.clone()),
        ],
    );

    // The master is unknown: provisional accept.
    let detected = detectors
        .wallet
        .detect(wallet_address.clone(), wallet_code.clone(), wallet_data.clone(), 10)
        .await
        .unwrap();
    assert_eq!(detected.owner, owner);
    assert_eq!(detected.jetton, master_address);

    // The write-through upsert is fire-and-forget.
    {
        let store = detectors.store.clone();
        let wallet_address = wallet_address.clone();
        wait_until(move || store.jetton_wallet(&wallet_address).is_some()).await;
    }
    assert_eq!(
        detectors
            .store
            .jetton_wallet(&wallet_address)
            .map(|row| row.balance),
        Some(BigInt::from(500)),
    );

    // Now the master gets indexed.
    let master_code = cell(200);
    let master_data = cell(201);
    detectors.executor.script_method(
        &master_code,
        "get_jetton_data",
        true,
        vec![
            StackEntry::Int(BigInt::from(1_000_000)),
            StackEntry::Int(BigInt::from(1)),
            StackEntry::Slice(addr_slice(&addr(9))),
            StackEntry::Cell(offchain_content("https://example.com/jetton.json")),
            StackEntry::Cell(wallet_code.clone()),
        ],
    );
    let master = detectors
        .master
        .detect(master_address.clone(), master_code, master_data, 20)
        .await
        .unwrap();
    assert!(master.mintable);
    assert_eq!(
        master
            .jetton_content
            .as_ref()
            .and_then(|content| content.get("uri"))
            .map(String::as_str),
        Some("https://example.com/jetton.json"),
    );

    // Re-detection of the wallet serves the provisional record from cache.
    let again = detectors
        .wallet
        .detect(wallet_address.clone(), wallet_code, wallet_data, 10)
        .await
        .unwrap();
    assert_eq!(again.address, wallet_address);
}

/// A wallet the master disowns is rejected.
#[tokio::test]
async fn wallet_failing_verification_is_rejected() {
    let detectors = spawn_detectors();

    let owner = addr(2);
    let master_address = addr(3);

    // Index the master first so verification can run.
    let master_code = cell(200);
    let master_data = cell(201);
    detectors.executor.script_method(
        &master_code,
        "get_jetton_data",
        true,
        vec![
            StackEntry::Int(BigInt::from(1_000_000)),
            StackEntry::Int(BigInt::from(0)),
            StackEntry::Slice(addr_slice(&addr(9))),
            StackEntry::Cell(offchain_content("https://example.com/jetton.json")),
            StackEntry::Cell(cell(100)),
        ],
    );
    detectors
        .master
        .detect(master_address.clone(), master_code.clone(), master_data, 20)
        .await
        .unwrap();

    // The master claims the wallet lives somewhere else.
    detectors.executor.script_method(
        &master_code,
        "get_wallet_address",
        true,
        vec![StackEntry::Slice(addr_slice(&addr(42)))],
    );

    let wallet_code = cell(100);
    detectors.executor.script_method(
        &wallet_code,
        "get_wallet_data",
        true,
        vec![
            StackEntry::Int(BigInt::from(500)),
            StackEntry::Slice(addr_slice(&owner)),
            StackEntry::Slice(addr_slice(&master_address)),
            StackEntry::Cell(wallet_code.clone()),
        ],
    );

    let err = detectors
        .wallet
        .detect(addr(1), wallet_code, cell(101), 10)
        .await
        .unwrap_err();
    assert!(matches!(err, IndexerError::InterfaceParse(_)));
}

/// The code-hash filter short-circuits repeated negative probes.
#[tokio::test]
async fn rejected_code_hash_short_circuits() {
    let detectors = spawn_detectors();

    let code = cell(300);
    // No scripted method: the probe fails and classifies the code hash as
    // not-a-wallet.
    let err = detectors
        .wallet
        .detect(addr(1), code.clone(), cell(301), 10)
        .await
        .unwrap_err();
    assert!(matches!(err, IndexerError::InterfaceParse(_)));

    let err = detectors
        .wallet
        .detect(addr(2), code, cell(302), 10)
        .await
        .unwrap_err();
    assert!(matches!(err, IndexerError::CodeHashRejected));
}

/// Equal lt must re-run detection; only strictly newer cache entries are
/// served when the observed state hashes changed.
#[tokio::test]
async fn stale_cache_entry_is_refreshed() {
    let detectors = spawn_detectors();

    let master_address = addr(3);
    let master_code = cell(200);

    let script = |data_tag: u32, supply: i64| {
        detectors.executor.script_method(
            &master_code,
            "get_jetton_data",
            true,
            vec![
                StackEntry::Int(BigInt::from(supply)),
                StackEntry::Int(BigInt::from(1)),
                StackEntry::Slice(addr_slice(&addr(9))),
                StackEntry::Cell(offchain_content("https://example.com/jetton.json")),
                StackEntry::Cell(cell(data_tag)),
            ],
        );
    };

    script(100, 10);
    let first = detectors
        .master
        .detect(master_address.clone(), master_code.clone(), cell(201), 50)
        .await
        .unwrap();
    assert_eq!(first.total_supply, BigInt::from(10));

    // Same lt, different data hash: the cache is not fresher, so the
    // get-method runs again.
    script(100, 20);
    let second = detectors
        .master
        .detect(master_address.clone(), master_code.clone(), cell(202), 50)
        .await
        .unwrap();
    assert_eq!(second.total_supply, BigInt::from(20));

    // An older request is served from the now-newer cache.
    let third = detectors
        .master
        .detect(master_address, master_code, cell(203), 49)
        .await
        .unwrap();
    assert_eq!(third.total_supply, BigInt::from(20));
}
