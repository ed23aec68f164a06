use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::emulator::{BlockEmulator, BlockEmulatorConfig, TraceProcessor};
use crate::insert::{InsertManager, InsertManagerConfig};
use crate::interfaces::{
    DetectorSet, InterfaceManager, JettonMasterDetector, JettonWalletDetector,
    NftCollectionDetector, NftItemDetector,
};
use crate::provider::BlockSource;
use crate::scheduler::{IndexScheduler, IndexSchedulerConfig, IndexSchedulerHandle};
use crate::store::{AnalyticalStore, StoreCredentials};
use crate::tracesink::{StreamCache, TraceInserter};
use crate::vm::ContractExecutor;
use crate::Result;

/// Top-level configuration of the indexing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub scheduler: IndexSchedulerConfig,
    pub insert: InsertManagerConfig,
    pub emulator: BlockEmulatorConfig,
    pub store: StoreCredentials,
    /// URI of the streaming cache; threaded from the CLI, never ambient.
    pub stream_cache_uri: String,
    /// Whether completed traces go through the interface detection pass.
    pub detect_interfaces: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            scheduler: IndexSchedulerConfig::default(),
            insert: InsertManagerConfig::default(),
            emulator: BlockEmulatorConfig::default(),
            store: StoreCredentials::default(),
            stream_cache_uri: "tcp://127.0.0.1:6379".to_owned(),
            detect_interfaces: true,
        }
    }
}

/// Wires the scheduler, the insert manager, the trace emulator and the
/// detectors around the provided collaborators.
pub struct IndexerBuilder {
    config: IndexerConfig,
    block_source: Option<Arc<dyn BlockSource>>,
    executor: Option<Arc<dyn ContractExecutor>>,
    store: Option<Arc<dyn AnalyticalStore>>,
    stream_cache: Option<Arc<dyn StreamCache>>,
}

impl IndexerBuilder {
    pub fn new(config: IndexerConfig) -> Self {
        Self {
            config,
            block_source: None,
            executor: None,
            store: None,
            stream_cache: None,
        }
    }

    pub fn with_block_source(mut self, block_source: Arc<dyn BlockSource>) -> Self {
        self.block_source = Some(block_source);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn ContractExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn AnalyticalStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_stream_cache(mut self, stream_cache: Arc<dyn StreamCache>) -> Self {
        self.stream_cache = Some(stream_cache);
        self
    }

    pub fn build(self) -> Result<Indexer> {
        let block_source = self.block_source.context("block source is not set")?;
        let executor = self.executor.context("contract executor is not set")?;
        let store = self.store.context("analytical store is not set")?;
        let stream_cache = self.stream_cache.context("stream cache is not set")?;

        let (insert_handle, insert_manager) = InsertManager::new(self.config.insert, store);
        insert_manager.spawn();

        let detectors = if self.config.detect_interfaces {
            let (manager_handle, interface_manager) = InterfaceManager::new();
            interface_manager.spawn();

            let (jetton_master, jetton_master_actor) = JettonMasterDetector::new(
                manager_handle.clone(),
                insert_handle.clone(),
                executor.clone(),
            );
            jetton_master_actor.spawn();

            let (jetton_wallet, jetton_wallet_actor) = JettonWalletDetector::new(
                jetton_master.clone(),
                manager_handle.clone(),
                insert_handle.clone(),
                executor.clone(),
            );
            jetton_wallet_actor.spawn();

            let (nft_collection, nft_collection_actor) = NftCollectionDetector::new(
                manager_handle.clone(),
                insert_handle.clone(),
                executor.clone(),
            );
            nft_collection_actor.spawn();

            let (nft_item, nft_item_actor) = NftItemDetector::new(
                nft_collection.clone(),
                manager_handle,
                insert_handle.clone(),
                executor.clone(),
            );
            nft_item_actor.spawn();

            Some(DetectorSet {
                jetton_master,
                jetton_wallet,
                nft_collection,
                nft_item,
            })
        } else {
            None
        };

        let processor: Arc<dyn TraceProcessor> = Arc::new(TraceInserter::new(stream_cache));
        let (emulator_handle, emulator) =
            BlockEmulator::new(self.config.emulator, executor, processor, detectors);
        emulator.spawn();

        let (scheduler_handle, scheduler) = IndexScheduler::new(
            self.config.scheduler,
            block_source,
            insert_handle,
            emulator_handle,
        );

        Ok(Indexer {
            scheduler,
            handle: scheduler_handle,
        })
    }
}

/// The assembled pipeline; `run` drives it until shutdown.
pub struct Indexer {
    scheduler: IndexScheduler,
    handle: IndexSchedulerHandle,
}

impl Indexer {
    pub fn handle(&self) -> IndexSchedulerHandle {
        self.handle.clone()
    }

    pub async fn run(self) -> Result<()> {
        self.scheduler.run().await
    }
}
