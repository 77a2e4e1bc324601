/// TVL Snapshot Harvester
///
/// Fetches block timestamps from an EVM chain, runs a protocol's TVL adapter
/// over them and appends the result to a partitioned snapshot table.
mod cli;
mod config;
mod db;
mod error;
mod etl;
mod models;
mod pipeline;
mod rpc;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use cli::{Cli, PipelineMode};
use config::Config;
use db::{Database, FileProgressStore, ProgressStore};
use etl::{BlockRangeFetcher, FetchSettings, ParquetTableLoader, ShellAdapter};
use pipeline::{FetchOutcome, Orchestrator};
use rpc::EvmRpcClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    cli.validate()?;

    let mut config = Config::from_env().context("Invalid configuration. Please check your .env file")?;
    if let Some(rpc_url) = &cli.rpc_url {
        config.rpc_url = rpc_url.clone();
    }
    if let Some(secs) = cli.adapter_timeout {
        config.adapter_timeout = Duration::from_secs(secs);
    }
    config.validate().context("Invalid command-line override")?;

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.as_directive()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    println!("🚀 Starting TVL Snapshot Harvester ({:?} for '{}')...", cli.pipeline, cli.protocol);

    // Initialize RPC client
    let rpc_client =
        Arc::new(EvmRpcClient::new(config.rpc_url.clone(), config.rpc_timeout).context("Failed to create RPC client")?);
    tracing::info!("Using RPC endpoint {}", rpc_client.endpoint());

    // Progress cursor lives in Postgres when configured, else on disk
    let progress: Arc<dyn ProgressStore> = match &config.database_url {
        Some(database_url) => {
            println!("\n💾 Connecting to PostgreSQL database...");
            let database = Database::new(database_url).await?;
            database.test_connection().await?;
            database.migrate().await?;
            println!("✅ Database connected successfully!");
            Arc::new(database)
        }
        None => {
            let store = FileProgressStore::new(&config.progress_dir);
            println!("📁 Progress cursors stored in {}", store.dir().display());
            Arc::new(store)
        }
    };

    let fetcher = Arc::new(BlockRangeFetcher::new(rpc_client.clone(), FetchSettings::from_config(&config)));
    let adapter = Arc::new(ShellAdapter::new(config.adapter_command.clone(), config.adapter_timeout));
    let loader = Arc::new(ParquetTableLoader::default());

    let mut orchestrator = Orchestrator::new(&config, cli.protocol.clone(), progress, fetcher, adapter, loader);
    println!("🎯 Target table: {} at {}", orchestrator.target().qualified_name(), orchestrator.target().location.display());
    println!("📂 Adapter directory: {}", orchestrator.staging().workdir().display());

    let run = async {
        if cli.pipeline != PipelineMode::LoadTvlSnapshot {
            // Test RPC connection and display connection info
            let conn_info = rpc_client.get_connection_info().await.context("Failed to connect to chain RPC")?;
            println!("✅ Connected to: {}", conn_info.endpoint);
            println!("⛓️  Chain ID: {}", conn_info.chain_id);
            println!("📍 Latest block: {}", format_number(conn_info.head));
        }

        match cli.pipeline {
            PipelineMode::All => {
                orchestrator.run_all().await.context("Pipeline execution failed")?;
            }
            PipelineMode::FetchBlocks => match orchestrator.fetch_only().await.context("Fetching blocks failed")? {
                FetchOutcome::Staged { path, first_block, last_block } => println!(
                    "\n📦 Staged blocks {}..={} at {}",
                    format_number(first_block),
                    format_number(last_block),
                    path.display()
                ),
                FetchOutcome::Exhausted => println!("\n✅ No new blocks to fetch"),
            },
            PipelineMode::LoadTvlSnapshot => {
                let committed = orchestrator.load_only().await.context("Loading TVL snapshot failed")?;
                println!("\n💾 Appended {} rows in {} partitions", committed.rows, committed.partitions.len());
            }
        }

        anyhow::Ok(())
    };

    tokio::select! {
        result = run => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, abandoning the running cycle");
            anyhow::bail!("Interrupted by operator");
        }
    }

    println!("\n✨ Pipeline execution complete!");

    Ok(())
}

/// Format a number with thousand separators
fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut result = String::with_capacity(digits.len() + digits.len() / 3);

    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }

    result
}
