use std::sync::Arc;
use std::time::Duration;

use tondex_core::insert::InsertManagerConfig;
use tondex_core::parser::parse_masterchain;
use tondex_core::pipeline::{IndexerBuilder, IndexerConfig};
use tondex_core::scheduler::IndexSchedulerConfig;
use tondex_core::store::InMemoryStore;
use tondex_core::tracesink::InMemoryStreamCache;
use tondex_core::vm::NoopExecutor;
use tondex_util::FastHashSet;

use self::common::{
    addr, build_mc_state, ext_in_msg, int_msg, wait_until, StubBlockSource, TxSpec,
};

mod common;

fn test_config() -> IndexerConfig {
    IndexerConfig {
        scheduler: IndexSchedulerConfig {
            tick_interval: Duration::from_millis(50),
            ..Default::default()
        },
        insert: InsertManagerConfig {
            insert_interval: Duration::from_millis(20),
            ..Default::default()
        },
        detect_interfaces: false,
        ..Default::default()
    }
}

/// One block per seqno, each holding a two-hop chain plus `extra_txs`
/// independent external transactions.
fn block_with_txs(seqno: u32, tx_count: usize) -> tondex_core::provider::MasterchainBlockDataState {
    let mut txs = Vec::with_capacity(tx_count);
    for i in 0..tx_count {
        let account = addr((i % 200) as u8);
        let lt = (seqno as u64) * 10_000 + i as u64;
        txs.push(TxSpec {
            account: account.clone(),
            lt,
            in_msg: ext_in_msg(&account, (seqno as u64) << 32 | i as u64),
            out_msgs: vec![],
        });
    }
    build_mc_state(seqno, &txs)
}

#[test]
fn parser_extracts_rows_and_transactions() {
    let a = addr(1);
    let b = addr(2);

    let root_in = ext_in_msg(&a, 7);
    let to_b = int_msg(&a, &b, 11);

    let mc = build_mc_state(5, &[
        TxSpec {
            account: a.clone(),
            lt: 10,
            in_msg: root_in.clone(),
            out_msgs: vec![to_b.clone()],
        },
        TxSpec {
            account: b.clone(),
            lt: 20,
            in_msg: to_b.clone(),
            out_msgs: vec![],
        },
    ]);

    let parsed = parse_masterchain(&mc).unwrap();
    assert_eq!(parsed.mc_seqno, 5);
    assert_eq!(parsed.block_count, 1);
    assert_eq!(parsed.transactions.len(), 2);
    assert_eq!(parsed.context.transactions.len(), 2);
    assert_eq!(parsed.context.blocks.len(), 1);
    // 1 in-msg + 1 out-msg + 1 in-msg.
    assert_eq!(parsed.context.messages.len(), 3);
    assert_eq!(parsed.context.account_updates.len(), 2);

    let root = parsed
        .transactions
        .iter()
        .find(|tx| tx.account == a)
        .unwrap();
    assert!(root.is_first);
    assert_eq!(root.in_msg_hash, *root_in.repr_hash());
    assert_eq!(root.out_msgs.len(), 1);
    assert_eq!(root.out_msgs[0].hash, *to_b.repr_hash());

    let child = parsed
        .transactions
        .iter()
        .find(|tx| tx.account == b)
        .unwrap();
    assert!(!child.is_first);
    assert_eq!(child.in_msg_hash, *to_b.repr_hash());

    // Within one account, lts strictly increase in extraction order.
    let mut by_account: std::collections::HashMap<_, u64> = Default::default();
    for tx in &parsed.transactions {
        if let Some(prev) = by_account.insert(tx.account.clone(), tx.lt) {
            assert!(tx.lt > prev);
        }
    }
}

/// S5: tiny queue caps stall admission but never lose work.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn saturated_queue_stalls_and_drains() {
    let source = Arc::new(StubBlockSource::new());
    let store = InMemoryStore::new();

    const SEQNOS: u32 = 5;
    const TXS_PER_BLOCK: usize = 200;
    for seqno in 1..=SEQNOS {
        source.put(block_with_txs(seqno, TXS_PER_BLOCK));
    }

    let mut config = test_config();
    config.scheduler.max_queue_txs = 100;

    let indexer = IndexerBuilder::new(config)
        .with_block_source(source)
        .with_executor(Arc::new(NoopExecutor))
        .with_store(Arc::new(store.clone()))
        .with_stream_cache(Arc::new(InMemoryStreamCache::new()))
        .build()
        .unwrap();
    let handle = indexer.handle();
    let running = tokio::spawn(indexer.run());

    wait_until(|| (1..=SEQNOS).all(|seqno| store.contains_seqno(seqno))).await;

    // Every transaction landed exactly once, keyed by (wc, account, lt).
    assert_eq!(
        store.transaction_count(),
        SEQNOS as usize * TXS_PER_BLOCK,
    );
    let mut keys = FastHashSet::default();
    for row in store.transaction_rows() {
        assert!(keys.insert((row.workchain, row.account_id, row.lt)));
    }

    handle.shutdown().await;
    running.abort();
}

/// S6: a failing batch is retried until the rows land, exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn insert_failure_is_retried() {
    let source = Arc::new(StubBlockSource::new());
    let store = InMemoryStore::new();
    store.fail_next_inserts(1);

    source.put(block_with_txs(1, 10));

    let indexer = IndexerBuilder::new(test_config())
        .with_block_source(source)
        .with_executor(Arc::new(NoopExecutor))
        .with_store(Arc::new(store.clone()))
        .with_stream_cache(Arc::new(InMemoryStreamCache::new()))
        .build()
        .unwrap();
    let handle = indexer.handle();
    let running = tokio::spawn(indexer.run());

    wait_until(|| store.contains_seqno(1)).await;
    assert_eq!(store.transaction_count(), 10);

    handle.shutdown().await;
    running.abort();
}

/// An empty block produces no traces and still completes.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_block_completes() {
    let source = Arc::new(StubBlockSource::new());
    let store = InMemoryStore::new();

    source.put(build_mc_state(1, &[]));

    let indexer = IndexerBuilder::new(test_config())
        .with_block_source(source)
        .with_executor(Arc::new(NoopExecutor))
        .with_store(Arc::new(store.clone()))
        .with_stream_cache(Arc::new(InMemoryStreamCache::new()))
        .build()
        .unwrap();
    let handle = indexer.handle();
    let running = tokio::spawn(indexer.run());

    wait_until(|| store.contains_seqno(1)).await;
    assert_eq!(store.transaction_count(), 0);

    handle.shutdown().await;
    running.abort();
}

/// Restart recovery: already-persisted seqnos are never re-processed.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replay_is_idempotent() {
    let source = Arc::new(StubBlockSource::new());
    let store = InMemoryStore::new();

    for seqno in 1..=3 {
        source.put(block_with_txs(seqno, 5));
    }

    for _ in 0..2 {
        let indexer = IndexerBuilder::new(test_config())
            .with_block_source(source.clone())
            .with_executor(Arc::new(NoopExecutor))
            .with_store(Arc::new(store.clone()))
            .with_stream_cache(Arc::new(InMemoryStreamCache::new()))
            .build()
            .unwrap();
        let handle = indexer.handle();
        let running = tokio::spawn(indexer.run());

        wait_until(|| (1..=3).all(|seqno| store.contains_seqno(seqno))).await;
        handle.shutdown().await;
        running.abort();
    }

    assert_eq!(store.transaction_count(), 15);
}
