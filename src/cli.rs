/// CLI Module
///
/// Command-line interface configuration using clap.
use clap::{Parser, ValueEnum};

/// Which part of the harvesting cycle to run
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineMode {
    /// Fetch the next block batch and stage it for the adapter
    #[value(name = "fetch_blocks")]
    FetchBlocks,
    /// Load an existing adapter output into the snapshot table
    #[value(name = "load_tvl_snapshot")]
    LoadTvlSnapshot,
    /// Run full cycles until history is completely processed
    #[value(name = "all")]
    All,
}

/// TVL Snapshot Harvester
///
/// Fetch block timestamps, run a protocol's TVL adapter over them and append the
/// per-user snapshot to a partitioned table
#[derive(Parser, Debug)]
#[command(name = "tvl-snapshot-harvester")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// The pipeline to run
    #[arg(short = 'p', long, value_enum, value_name = "PIPELINE")]
    pub pipeline: PipelineMode,

    /// The name of the protocol (adapter directory under the staging dir)
    #[arg(long, value_name = "NAME")]
    pub protocol: String,

    /// RPC endpoint URL (overrides APP_RPC_URL env var)
    #[arg(short = 'r', long, value_name = "URL")]
    pub rpc_url: Option<String>,

    /// Adapter timeout in seconds (overrides APP_ADAPTER_TIMEOUT_SECS env var)
    #[arg(long, value_name = "SECONDS")]
    pub adapter_timeout: Option<u64>,
}

impl Cli {
    /// Validate CLI arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.protocol.is_empty() {
            anyhow::bail!("Protocol name must not be empty");
        }

        if let Some(bad) = self.protocol.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-')) {
            anyhow::bail!("Protocol name '{}' contains invalid character '{}'", self.protocol, bad);
        }

        if self.adapter_timeout == Some(0) {
            anyhow::bail!("Adapter timeout must be greater than 0");
        }

        Ok(())
    }
}
