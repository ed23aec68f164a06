use std::sync::Arc;

use anyhow::Context;
use futures_util::future::BoxFuture;
use tycho_types::cell::{Cell, HashBytes};
use tycho_types::models::{Block, BlockId, BlockchainConfig, LibDescr, ShardAccounts, ShardIdent};
use tycho_types::prelude::Dict;

use crate::{IndexerError, Result};

/// A single block together with the shard state it produced.
#[derive(Debug, Clone)]
pub struct ShardBlockData {
    pub block_id: BlockId,
    pub block: Block,
    pub root: Cell,
    /// Accounts dictionary of the post-block shard state.
    pub accounts: ShardAccounts,
}

/// The unit of work of the pipeline: a masterchain block with the shard
/// blocks it commits and the collected shard states.
///
/// `shard_blocks_diff` is the subset of `shard_blocks` that was not yet seen
/// at the previous seqno; only those contribute new transactions.
#[derive(Clone)]
pub struct MasterchainBlockDataState {
    inner: Arc<Inner>,
}

struct Inner {
    seqno: u32,
    gen_utime: u32,
    shard_blocks: Vec<ShardBlockData>,
    // Indices into `shard_blocks`.
    shard_blocks_diff: Vec<usize>,
    config: BlockchainConfig,
    libraries: Dict<HashBytes, LibDescr>,
}

impl MasterchainBlockDataState {
    /// Builds the unit of work, checking that the diff is a subset of the
    /// collected shard blocks and that no shard block repeats.
    pub fn new(
        shard_blocks: Vec<ShardBlockData>,
        shard_blocks_diff: Vec<BlockId>,
        config: BlockchainConfig,
        libraries: Dict<HashBytes, LibDescr>,
    ) -> Result<Self> {
        let mc = shard_blocks
            .iter()
            .find(|b| b.block_id.is_masterchain())
            .context("masterchain block is missing")?;
        let seqno = mc.block_id.seqno;
        let gen_utime = mc.block.load_info().map_err(IndexerError::malformed)?.gen_utime;

        let mut seen = std::collections::HashSet::new();
        for block in &shard_blocks {
            if !seen.insert(block.block_id) {
                return Err(IndexerError::Internal(anyhow::anyhow!(
                    "shard block {} appears twice for seqno {seqno}",
                    block.block_id,
                )));
            }
        }

        let mut diff = Vec::with_capacity(shard_blocks_diff.len());
        for block_id in shard_blocks_diff {
            let index = shard_blocks
                .iter()
                .position(|b| b.block_id == block_id)
                .with_context(|| {
                    format!("shard block diff entry {block_id} is not among shard blocks")
                })?;
            diff.push(index);
        }

        Ok(Self {
            inner: Arc::new(Inner {
                seqno,
                gen_utime,
                shard_blocks,
                shard_blocks_diff: diff,
                config,
                libraries,
            }),
        })
    }

    pub fn seqno(&self) -> u32 {
        self.inner.seqno
    }

    pub fn gen_utime(&self) -> u32 {
        self.inner.gen_utime
    }

    pub fn shard_blocks(&self) -> &[ShardBlockData] {
        &self.inner.shard_blocks
    }

    pub fn shard_blocks_diff(&self) -> impl Iterator<Item = &ShardBlockData> {
        self.inner
            .shard_blocks_diff
            .iter()
            .map(|&i| &self.inner.shard_blocks[i])
    }

    pub fn config(&self) -> &BlockchainConfig {
        &self.inner.config
    }

    pub fn libraries(&self) -> &Dict<HashBytes, LibDescr> {
        &self.inner.libraries
    }

    /// Looks up the post-state accounts dictionary of the shard owning the
    /// given account address.
    pub fn shard_accounts(&self, workchain: i32, account: &HashBytes) -> Option<&ShardAccounts> {
        self.inner
            .shard_blocks
            .iter()
            .find(|b| shard_contains(&b.block_id.shard, workchain, account))
            .map(|b| &b.accounts)
    }
}

fn shard_contains(shard: &ShardIdent, workchain: i32, account: &HashBytes) -> bool {
    shard.workchain() == workchain && shard.contains_account(account)
}

/// Source of raw masterchain blocks, consumed by the scheduler.
pub trait BlockSource: Send + Sync + 'static {
    /// Returns the latest seqno known to the source.
    fn get_last_known_seqno(&self) -> BoxFuture<'_, Result<u32>>;

    /// Fetches the block data state for the given masterchain seqno.
    fn fetch_masterchain(&self, seqno: u32) -> BoxFuture<'_, Result<MasterchainBlockDataState>>;
}
