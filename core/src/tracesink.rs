use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tl_proto::{TlRead, TlWrite};
use tycho_types::boc::Boc;
use tycho_types::cell::HashBytes;
use tycho_types::models::StdAddr;

use crate::emulator::TraceProcessor;
use crate::interfaces::DetectedInterface;
use crate::models::{Trace, TraceNode};

/// Channel the trace ids of committed traces are published to.
pub const NEW_TRACE_CHANNEL: &str = "new_trace";

/// A single write of a trace-result commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOp {
    HSet {
        key: String,
        field: String,
        value: Vec<u8>,
    },
    HDel {
        key: String,
        field: String,
    },
    ZAdd {
        key: String,
        member: String,
        score: u64,
    },
    ZRem {
        key: String,
        member: String,
    },
    Publish {
        channel: String,
        payload: String,
    },
}

/// The streaming cache consumed by the trace result sink.
///
/// `commit` applies the whole op batch atomically; this is the only write
/// path, so per-trace writes serialize on the cache's own transaction
/// primitive.
pub trait StreamCache: Send + Sync + 'static {
    fn hget<'a>(&'a self, key: &'a str, field: &'a str)
        -> BoxFuture<'a, Result<Option<Vec<u8>>>>;

    fn commit(&self, ops: Vec<CacheOp>) -> BoxFuture<'_, Result<()>>;
}

/// Wire form of a trace node stored in the cache hash.
#[derive(Debug, Clone, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0x1c8d91f3)]
pub struct PackedTraceNode {
    #[tl(with = "crate::tl::hash_bytes")]
    pub in_msg_hash: HashBytes,
    pub workchain: i32,
    #[tl(with = "crate::tl::hash_bytes")]
    pub account: HashBytes,
    pub lt: u64,
    pub emulated: bool,
    pub transaction_boc: Vec<u8>,
    #[tl(with = "crate::tl::hash_bytes_vec")]
    pub child_msg_hashes: Vec<HashBytes>,
}

impl PackedTraceNode {
    fn from_node(node: &TraceNode) -> Self {
        Self {
            in_msg_hash: node.node_id,
            workchain: node.account.workchain as i32,
            account: node.account.address,
            lt: node.lt,
            emulated: node.emulated,
            transaction_boc: Boc::encode(&node.transaction_root),
            child_msg_hashes: node.children.iter().map(|child| child.node_id).collect(),
        }
    }
}

/// Wire form of the per-address interface records.
#[derive(Debug, Clone, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed, id = 0x6fd02b81)]
pub struct PackedInterfaces {
    pub items: Vec<PackedInterface>,
}

#[derive(Debug, Clone, PartialEq, Eq, TlRead, TlWrite)]
#[tl(boxed)]
pub enum PackedInterface {
    #[tl(id = 0x3a9c5d10)]
    JettonMaster {
        address: Vec<u8>,
        total_supply: Vec<u8>,
        mintable: bool,
        admin_address: Vec<u8>,
        last_transaction_lt: u64,
    },
    #[tl(id = 0x3a9c5d11)]
    JettonWallet {
        address: Vec<u8>,
        balance: Vec<u8>,
        owner: Vec<u8>,
        jetton: Vec<u8>,
        last_transaction_lt: u64,
    },
    #[tl(id = 0x3a9c5d12)]
    NftCollection {
        address: Vec<u8>,
        next_item_index: Vec<u8>,
        owner_address: Vec<u8>,
        last_transaction_lt: u64,
    },
    #[tl(id = 0x3a9c5d13)]
    NftItem {
        address: Vec<u8>,
        index: Vec<u8>,
        collection_address: Vec<u8>,
        owner_address: Vec<u8>,
        last_transaction_lt: u64,
    },
}

impl PackedInterface {
    fn from_detected(detected: &DetectedInterface) -> Self {
        match detected {
            DetectedInterface::JettonMaster(data) => Self::JettonMaster {
                address: raw_addr(&data.address).into_bytes(),
                total_supply: data.total_supply.to_string().into_bytes(),
                mintable: data.mintable,
                admin_address: raw_opt_addr(data.admin_address.as_ref()).into_bytes(),
                last_transaction_lt: data.last_transaction_lt,
            },
            DetectedInterface::JettonWallet(data) => Self::JettonWallet {
                address: raw_addr(&data.address).into_bytes(),
                balance: data.balance.to_string().into_bytes(),
                owner: raw_addr(&data.owner).into_bytes(),
                jetton: raw_addr(&data.jetton).into_bytes(),
                last_transaction_lt: data.last_transaction_lt,
            },
            DetectedInterface::NftCollection(data) => Self::NftCollection {
                address: raw_addr(&data.address).into_bytes(),
                next_item_index: data.next_item_index.to_string().into_bytes(),
                owner_address: raw_opt_addr(data.owner_address.as_ref()).into_bytes(),
                last_transaction_lt: data.last_transaction_lt,
            },
            DetectedInterface::NftItem(data) => Self::NftItem {
                address: raw_addr(&data.address).into_bytes(),
                index: data.index.to_string().into_bytes(),
                collection_address: raw_opt_addr(data.collection_address.as_ref()).into_bytes(),
                owner_address: raw_opt_addr(data.owner_address.as_ref()).into_bytes(),
                last_transaction_lt: data.last_transaction_lt,
            },
        }
    }
}

/// Commits completed traces into the streaming cache.
///
/// Every commit is a single atomic transaction: superseded emulated
/// subtrees are removed, the flattened trace and the interface records are
/// written, and `new_trace` is published with the trace id.
pub struct TraceInserter {
    cache: Arc<dyn StreamCache>,
}

impl TraceInserter {
    pub fn new(cache: Arc<dyn StreamCache>) -> Self {
        Self { cache }
    }

    pub async fn insert(&self, trace: &Trace) -> Result<()> {
        let _histogram = tondex_util::metrics::HistogramGuard::begin("tondex_trace_insert_time");
        let trace_key = trace.id.to_string();

        // Flatten breadth-first.
        let mut flat = Vec::with_capacity(trace.transactions_count());
        let mut queue = VecDeque::from([&trace.root]);
        while let Some(node) = queue.pop_front() {
            queue.extend(node.children.iter());
            flat.push(node);
        }

        // A real transaction supersedes whatever was emulated under the
        // same in-msg before; collect that subtree for deletion.
        let mut tx_fields_to_delete = Vec::new();
        let mut addr_members_to_delete = Vec::new();
        for node in &flat {
            if !node.emulated {
                self.collect_subtree(
                    &trace_key,
                    node.node_id.to_string(),
                    &mut tx_fields_to_delete,
                    &mut addr_members_to_delete,
                )
                .await?;
            }
        }

        let mut ops = Vec::new();
        for field in tx_fields_to_delete {
            ops.push(CacheOp::HDel {
                key: trace_key.clone(),
                field,
            });
        }
        for (key, member) in addr_members_to_delete {
            ops.push(CacheOp::ZRem { key, member });
        }

        for node in &flat {
            let field = node.node_id.to_string();
            ops.push(CacheOp::HSet {
                key: trace_key.clone(),
                field: field.clone(),
                value: tl_proto::serialize(PackedTraceNode::from_node(node)),
            });
            ops.push(CacheOp::ZAdd {
                key: raw_addr(&node.account),
                member: format!("{trace_key}:{field}"),
                score: node.lt,
            });
        }

        for (address, interfaces) in &trace.interfaces {
            let packed = PackedInterfaces {
                items: interfaces.iter().map(PackedInterface::from_detected).collect(),
            };
            ops.push(CacheOp::HSet {
                key: trace_key.clone(),
                field: raw_addr(address),
                value: tl_proto::serialize(packed),
            });
        }

        ops.push(CacheOp::Publish {
            channel: NEW_TRACE_CHANNEL.to_owned(),
            payload: trace_key.clone(),
        });

        self.cache.commit(ops).await
    }

    /// Walks the previously stored subtree under `field` through the packed
    /// child links, collecting hash fields and per-address zset members.
    async fn collect_subtree(
        &self,
        trace_key: &str,
        field: String,
        tx_fields: &mut Vec<String>,
        addr_members: &mut Vec<(String, String)>,
    ) -> Result<()> {
        let mut stack = vec![field];
        while let Some(field) = stack.pop() {
            let Some(bytes) = self.cache.hget(trace_key, &field).await? else {
                continue;
            };
            let node = tl_proto::deserialize::<PackedTraceNode>(&bytes)
                .context("malformed packed trace node in cache")?;

            for child in &node.child_msg_hashes {
                stack.push(child.to_string());
            }

            addr_members.push((
                format!("{}:{}", node.workchain, node.account),
                format!("{trace_key}:{field}"),
            ));
            tx_fields.push(field);
        }
        Ok(())
    }
}

impl TraceProcessor for TraceInserter {
    fn process<'a>(&'a self, trace: &'a Trace) -> BoxFuture<'a, Result<()>> {
        self.insert(trace).boxed()
    }
}

fn raw_addr(address: &StdAddr) -> String {
    format!("{}:{}", address.workchain, address.address)
}

fn raw_opt_addr(address: Option<&StdAddr>) -> String {
    match address {
        Some(address) => raw_addr(address),
        None => String::new(),
    }
}

/// In-memory stream cache used by tests and the dev wiring.
#[derive(Default)]
pub struct InMemoryStreamCache {
    inner: Mutex<StreamCacheInner>,
}

#[derive(Default)]
struct StreamCacheInner {
    hashes: HashMap<String, HashMap<String, Vec<u8>>>,
    zsets: HashMap<String, BTreeMap<String, u64>>,
    published: Vec<(String, String)>,
}

impl InMemoryStreamCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hash_field(&self, key: &str, field: &str) -> Option<Vec<u8>> {
        self.inner.lock().hashes.get(key)?.get(field).cloned()
    }

    pub fn hash_len(&self, key: &str) -> usize {
        self.inner.lock().hashes.get(key).map_or(0, HashMap::len)
    }

    pub fn zset_score(&self, key: &str, member: &str) -> Option<u64> {
        self.inner.lock().zsets.get(key)?.get(member).copied()
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.inner.lock().published.clone()
    }
}

impl StreamCache for InMemoryStreamCache {
    fn hget<'a>(
        &'a self,
        key: &'a str,
        field: &'a str,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        async move { Ok(self.hash_field(key, field)) }.boxed()
    }

    fn commit(&self, ops: Vec<CacheOp>) -> BoxFuture<'_, Result<()>> {
        async move {
            let mut inner = self.inner.lock();
            for op in ops {
                match op {
                    CacheOp::HSet { key, field, value } => {
                        inner.hashes.entry(key).or_default().insert(field, value);
                    }
                    CacheOp::HDel { key, field } => {
                        if let Some(hash) = inner.hashes.get_mut(&key) {
                            hash.remove(&field);
                        }
                    }
                    CacheOp::ZAdd { key, member, score } => {
                        inner.zsets.entry(key).or_default().insert(member, score);
                    }
                    CacheOp::ZRem { key, member } => {
                        if let Some(zset) = inner.zsets.get_mut(&key) {
                            zset.remove(&member);
                        }
                    }
                    CacheOp::Publish { channel, payload } => {
                        inner.published.push((channel, payload));
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use tondex_util::FastHashMap;
    use tycho_types::cell::{Cell, CellFamily};

    use super::*;

    fn hash(byte: u8) -> HashBytes {
        HashBytes([byte; 32])
    }

    fn addr(byte: u8) -> StdAddr {
        StdAddr::new(0, hash(byte))
    }

    fn node(id: u8, account: u8, lt: u64, emulated: bool, children: Vec<TraceNode>) -> TraceNode {
        TraceNode {
            node_id: hash(id),
            transaction_root: Cell::empty_cell(),
            account: addr(account),
            lt,
            emulated,
            children,
        }
    }

    fn trace(id: u8, root: TraceNode) -> Trace {
        Trace {
            id: hash(id),
            root,
            emulated_accounts: Default::default(),
            interfaces: FastHashMap::default(),
        }
    }

    #[test]
    fn packed_node_roundtrip() {
        let node = node(1, 2, 77, true, vec![node(3, 4, 78, true, vec![])]);
        let packed = PackedTraceNode::from_node(&node);

        let bytes = tl_proto::serialize(&packed);
        let decoded = tl_proto::deserialize::<PackedTraceNode>(&bytes).unwrap();
        assert_eq!(packed, decoded);
        assert_eq!(decoded.child_msg_hashes, vec![hash(3)]);
        assert!(decoded.emulated);
    }

    #[tokio::test]
    async fn commits_trace_and_publishes() {
        let cache = Arc::new(InMemoryStreamCache::new());
        let inserter = TraceInserter::new(cache.clone());

        let trace = trace(1, node(1, 10, 100, false, vec![node(2, 11, 101, true, vec![])]));
        inserter.insert(&trace).await.unwrap();

        let trace_key = hash(1).to_string();
        assert_eq!(cache.hash_len(&trace_key), 2);
        assert_eq!(
            cache.zset_score(
                &format!("0:{}", hash(10)),
                &format!("{trace_key}:{}", hash(1)),
            ),
            Some(100),
        );
        assert_eq!(
            cache.published(),
            vec![(NEW_TRACE_CHANNEL.to_owned(), trace_key)],
        );
    }

    #[tokio::test]
    async fn real_transaction_supersedes_emulated_subtree() {
        let cache = Arc::new(InMemoryStreamCache::new());
        let inserter = TraceInserter::new(cache.clone());

        // First pass: node 2 was emulated, with an emulated child 3.
        let first = trace(
            1,
            node(1, 10, 100, false, vec![node(
                2,
                11,
                101,
                true,
                vec![node(3, 12, 102, true, vec![])],
            )]),
        );
        inserter.insert(&first).await.unwrap();

        let trace_key = hash(1).to_string();
        assert_eq!(cache.hash_len(&trace_key), 3);

        // Second pass: node 2 arrived on-chain without children; the stale
        // emulated child 3 must disappear.
        let second = trace(
            1,
            node(1, 10, 100, false, vec![node(2, 11, 101, false, vec![])]),
        );
        inserter.insert(&second).await.unwrap();

        assert_eq!(cache.hash_len(&trace_key), 2);
        assert!(cache.hash_field(&trace_key, &hash(3).to_string()).is_none());
        assert!(cache
            .zset_score(
                &format!("0:{}", hash(12)),
                &format!("{trace_key}:{}", hash(3)),
            )
            .is_none());

        let packed = cache
            .hash_field(&trace_key, &hash(2).to_string())
            .unwrap();
        let decoded = tl_proto::deserialize::<PackedTraceNode>(&packed).unwrap();
        assert!(!decoded.emulated);
    }
}
