/// Error Module
///
/// Failure taxonomy for one harvesting cycle. Each variant maps to a distinct
/// way a cycle can abort; none of them leaves the progress cursor advanced.
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HarvestError>;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Chain unavailable: {0}")]
    ChainUnavailable(String),

    #[error("Adapter failed: {0}")]
    AdapterFailure(#[from] AdapterFailure),

    #[error("Artifact error at {}: {message}", path.display())]
    ArtifactError { path: PathBuf, message: String },

    #[error("Storage commit failed: {0}")]
    StorageCommitFailure(String),

    #[error("Invalid block batch: {0}")]
    InvalidBatch(String),

    #[error("Failed to stage {}: {source}", path.display())]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Progress store error: {0}")]
    Progress(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum AdapterFailure {
    #[error("process exited with {} ({stderr_tail})", exit_label(*code))]
    NonZeroExit { code: Option<i32>, stderr_tail: String },

    #[error("process exceeded timeout of {0:?} and was killed")]
    TimedOut(std::time::Duration),

    #[error("could not run adapter in {}: {source}", workdir.display())]
    Spawn {
        workdir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn exit_label(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "a signal".to_string(),
    }
}

impl HarvestError {
    pub fn artifact(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ArtifactError { path: path.into(), message: message.into() }
    }

    /// Retrying without changing anything can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ChainUnavailable(_) | Self::AdapterFailure(_) | Self::StorageCommitFailure(_))
    }

    /// Retrying will repeat the failure until the adapter or its output is fixed.
    pub fn needs_operator(&self) -> bool {
        matches!(self, Self::ArtifactError { .. })
    }

    /// Short stable name for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChainUnavailable(_) => "chain_unavailable",
            Self::AdapterFailure(_) => "adapter_failure",
            Self::ArtifactError { .. } => "artifact_error",
            Self::StorageCommitFailure(_) => "storage_commit_failure",
            Self::InvalidBatch(_) => "invalid_batch",
            Self::Staging { .. } => "staging",
            Self::Progress(_) => "progress",
            Self::Config(_) => "config",
        }
    }
}

impl From<reqwest::Error> for HarvestError {
    fn from(e: reqwest::Error) -> Self {
        Self::ChainUnavailable(e.to_string())
    }
}

impl From<sqlx::Error> for HarvestError {
    fn from(e: sqlx::Error) -> Self {
        Self::Progress(e.to_string())
    }
}
