use std::path::{Path, PathBuf};

use anyhow::Context;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tondex_core::provider::{BlockSource, MasterchainBlockDataState, ShardBlockData};
use tondex_core::{IndexerError, Result};
use tycho_types::boc::Boc;
use tycho_types::models::{Block, BlockId, ShardIdent, ShardStateUnsplit};

/// Reads exported masterchain blocks from a directory.
///
/// Layout: `<seqno>.boc` holds the block and `<seqno>.state.boc` the
/// post-block masterchain state it refers to.
pub struct FileBlockSource {
    root: PathBuf,
}

impl FileBlockSource {
    pub fn new(root: &Path) -> anyhow::Result<Self> {
        anyhow::ensure!(root.is_dir(), "{} is not a directory", root.display());
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn last_known_seqno(&self) -> Result<u32> {
        let entries = std::fs::read_dir(&self.root)
            .with_context(|| format!("failed to read {}", self.root.display()))
            .map_err(IndexerError::Transient)?;

        let mut last = None;
        for entry in entries {
            let entry = entry.map_err(|e| IndexerError::Transient(e.into()))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(seqno) = name.strip_suffix(".boc").and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            last = last.max(Some(seqno));
        }

        last.ok_or(IndexerError::NotFound("no exported blocks"))
    }

    fn load(&self, seqno: u32) -> Result<MasterchainBlockDataState> {
        let block_path = self.root.join(format!("{seqno}.boc"));
        let state_path = self.root.join(format!("{seqno}.state.boc"));
        if !block_path.exists() || !state_path.exists() {
            return Err(IndexerError::NotFound("block is not exported yet"));
        }

        let data = std::fs::read(&block_path).map_err(|e| IndexerError::Transient(e.into()))?;
        let root = Boc::decode(&data).map_err(|e| IndexerError::MalformedBlock(e.into()))?;
        let block = root
            .parse::<Block>()
            .map_err(|e| IndexerError::MalformedBlock(e.into()))?;

        let state_data =
            std::fs::read(&state_path).map_err(|e| IndexerError::Transient(e.into()))?;
        let state_root =
            Boc::decode(&state_data).map_err(|e| IndexerError::MalformedBlock(e.into()))?;
        let state = state_root
            .parse::<Box<ShardStateUnsplit>>()
            .map_err(|e| IndexerError::MalformedBlock(e.into()))?;

        let accounts = state
            .load_accounts()
            .map_err(|e| IndexerError::MalformedBlock(e.into()))?;
        let custom = state
            .load_custom()
            .map_err(|e| IndexerError::MalformedBlock(e.into()))?
            .ok_or(IndexerError::NotFound("state is not a masterchain state"))?;

        let block_id = BlockId {
            shard: ShardIdent::MASTERCHAIN,
            seqno,
            root_hash: *root.repr_hash(),
            file_hash: Boc::file_hash_blake(&data),
        };

        MasterchainBlockDataState::new(
            vec![ShardBlockData {
                block_id,
                block,
                root,
                accounts,
            }],
            vec![block_id],
            custom.config.clone(),
            state.libraries.clone(),
        )
    }
}

impl BlockSource for FileBlockSource {
    fn get_last_known_seqno(&self) -> BoxFuture<'_, Result<u32>> {
        async move { self.last_known_seqno() }.boxed()
    }

    fn fetch_masterchain(&self, seqno: u32) -> BoxFuture<'_, Result<MasterchainBlockDataState>> {
        async move { self.load(seqno) }.boxed()
    }
}
