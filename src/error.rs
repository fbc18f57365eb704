use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, TrawlError>;

/// Errors surfaced by the collection engine.
///
/// Duplicate rejections are not errors; they are reported through
/// [`crate::Admission`] and counted in the session report.
#[derive(Debug, Error)]
pub enum TrawlError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("invalid segment file name `{name}`")]
    InvalidSegmentName { name: String },

    #[error("segment {path:?} corrupted at line {line}: {reason}")]
    SegmentCorruption {
        path: PathBuf,
        line: u64,
        reason: String,
    },

    /// Checkpoint write or flush failed. Fatal for the session.
    #[error("durability failure on {path:?}: {reason}")]
    Durability { path: PathBuf, reason: String },

    #[error("run directory {dir:?} already holds segments; resume it or pick a new run id")]
    RunAlreadyExists { dir: PathBuf },

    #[error("malformed candidate: {reason}")]
    MalformedCandidate { reason: String },

    #[error("segment sequence range exhausted for shard {shard}")]
    CapacityExceeded { shard: u32 },
}

impl TrawlError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedCandidate {
            reason: reason.into(),
        }
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub(crate) fn durability(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::Durability {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    /// Whether the error means progress may not have reached disk.
    #[must_use]
    pub fn is_durability(&self) -> bool {
        matches!(self, Self::Durability { .. })
    }
}
