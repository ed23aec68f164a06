#![allow(clippy::print_stdout, clippy::print_stderr, clippy::exit)] // it's a CLI tool

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tondex_core::pipeline::{IndexerBuilder, IndexerConfig};
use tondex_core::store::InMemoryStore;
use tondex_core::tracesink::InMemoryStreamCache;
use tondex_core::vm::NoopExecutor;
use tondex_util::cli::signal;

use crate::source::FileBlockSource;

mod source;

/// Emulate traces from exported masterchain blocks.
#[derive(Parser)]
#[clap(name = "tondex-trace-emulator")]
#[clap(version)]
struct App {
    /// Path to the exported block database.
    #[clap(short = 'D', long = "db")]
    db: PathBuf,

    /// Scheduler worker threads.
    #[clap(short, long, default_value_t = 7)]
    threads: usize,

    /// Streaming cache URI.
    #[clap(long, default_value = "tcp://127.0.0.1:6379")]
    redis: String,
}

fn main() -> ExitCode {
    if std::env::var("RUST_BACKTRACE").is_err() {
        // Enable backtraces on panics by default.
        std::env::set_var("RUST_BACKTRACE", "1");
    }
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        // Disable backtraces in libraries by default.
        std::env::set_var("RUST_LIB_BACKTRACE", "0");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let app = App::parse();
    match run(app) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

fn run(app: App) -> Result<()> {
    anyhow::ensure!(app.threads > 0, "--threads must be positive");

    let config = IndexerConfig {
        stream_cache_uri: app.redis,
        ..Default::default()
    };

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(app.threads)
        .enable_all()
        .build()
        .context("failed to build the runtime")?
        .block_on(async move {
            let block_source =
                Arc::new(FileBlockSource::new(&app.db).context("failed to open block database")?);

            // The analytical store and the streaming cache are wired with
            // the in-process implementations here; production deployments
            // plug their own drivers through `IndexerBuilder`.
            let indexer = IndexerBuilder::new(config)
                .with_block_source(block_source)
                .with_executor(Arc::new(NoopExecutor))
                .with_store(Arc::new(InMemoryStore::new()))
                .with_stream_cache(Arc::new(InMemoryStreamCache::new()))
                .build()?;

            let handle = indexer.handle();
            let stopped = signal::any_signal(signal::TERMINATION_SIGNALS);

            tokio::select! {
                res = indexer.run() => res.map_err(Into::into),
                signal = stopped => {
                    if let Ok(signal) = signal {
                        tracing::info!(?signal, "received termination signal, draining");
                        handle.shutdown().await;
                    }
                    Ok(())
                }
            }
        })
}
