/// Configuration Module
///
/// Environment-scoped settings, read once at startup from `APP_*` variables
/// (a `.env` file is loaded first by `main`) and validated before anything runs.
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{HarvestError, Result};

const ENV_PREFIX: &str = "APP_";

pub const DEFAULT_ADAPTER_COMMAND: &str = "npm install && tsc && npm run start";

/// Accepted values of `APP_LOG_LEVEL`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_directive(&self) -> &'static str {
        match self {
            Self::Critical | Self::Error => "error",
            Self::Warning => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

impl FromStr for LogLevel {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CRITICAL" => Ok(Self::Critical),
            "ERROR" => Ok(Self::Error),
            "WARNING" => Ok(Self::Warning),
            "INFO" => Ok(Self::Info),
            "DEBUG" => Ok(Self::Debug),
            other => Err(HarvestError::Config(format!(
                "APP_LOG_LEVEL must be one of CRITICAL, ERROR, WARNING, INFO, DEBUG (got '{}')",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub chain_name: String,
    pub rpc_url: String,
    pub log_level: LogLevel,
    /// Column the snapshot table is partitioned by (`timestamp` or `date`)
    pub partition_column: String,
    /// Root holding one working directory per protocol adapter
    pub staging_dir: PathBuf,
    pub storage_root: PathBuf,
    pub progress_dir: PathBuf,
    pub database_url: Option<String>,
    pub adapter_command: String,
    pub adapter_timeout: Duration,
    pub batch_size: usize,
    pub block_stride: u64,
    pub start_block: u64,
    pub confirmations: u64,
    pub max_retries: usize,
    pub retry_delay: Duration,
    pub rpc_timeout: Duration,
}

impl Config {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary key lookup. Keys are passed with their `APP_` prefix.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty());
        let required = |name: &str| {
            get(name).ok_or_else(|| HarvestError::Config(format!("{}{} is required", ENV_PREFIX, name)))
        };

        let log_level = get("LOG_LEVEL").map(|v| v.parse()).transpose()?.unwrap_or(LogLevel::Info);

        let partition_column = get("PARTITION_COLUMN").unwrap_or_else(|| "timestamp".to_string());
        if !matches!(partition_column.as_str(), "timestamp" | "date") {
            return Err(HarvestError::Config(format!(
                "APP_PARTITION_COLUMN must be 'timestamp' or 'date' (got '{}')",
                partition_column
            )));
        }

        let config = Self {
            chain_name: required("CHAIN_NAME")?,
            rpc_url: required("RPC_URL")?,
            log_level,
            partition_column,
            staging_dir: get("STAGING_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("./adapters")),
            storage_root: get("STORAGE_ROOT").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("./warehouse")),
            progress_dir: get("PROGRESS_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("./.progress")),
            database_url: get("DATABASE_URL").or_else(|| lookup("DATABASE_URL").filter(|v| !v.trim().is_empty())),
            adapter_command: get("ADAPTER_COMMAND").unwrap_or_else(|| DEFAULT_ADAPTER_COMMAND.to_string()),
            adapter_timeout: Duration::from_secs(parse_or(&get, "ADAPTER_TIMEOUT_SECS", 3600)?),
            batch_size: parse_or(&get, "BATCH_SIZE", 100)?,
            block_stride: parse_or(&get, "BLOCK_STRIDE", 1)?,
            start_block: parse_or(&get, "START_BLOCK", 0)?,
            confirmations: parse_or(&get, "CONFIRMATIONS", 0)?,
            max_retries: parse_or(&get, "MAX_RETRIES", 3)?,
            retry_delay: Duration::from_secs(parse_or(&get, "RETRY_DELAY_SECS", 2)?),
            rpc_timeout: Duration::from_secs(parse_or(&get, "RPC_TIMEOUT_SECS", 30)?),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(HarvestError::Config("APP_BATCH_SIZE must be greater than 0".into()));
        }
        if self.block_stride == 0 {
            return Err(HarvestError::Config("APP_BLOCK_STRIDE must be greater than 0".into()));
        }
        if self.adapter_timeout.is_zero() {
            return Err(HarvestError::Config("APP_ADAPTER_TIMEOUT_SECS must be greater than 0".into()));
        }
        if !(self.rpc_url.starts_with("http://") || self.rpc_url.starts_with("https://")) {
            return Err(HarvestError::Config(format!("APP_RPC_URL must be an http(s) URL (got '{}')", self.rpc_url)));
        }
        Ok(())
    }
}

fn parse_or<T, G>(get: &G, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| HarvestError::Config(format!("{}{}='{}' is invalid: {}", ENV_PREFIX, name, raw, e))),
        None => Ok(default),
    }
}
