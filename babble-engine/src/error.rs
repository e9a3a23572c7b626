//! Engine-wide error taxonomy.

use crate::storage::StorageError;

/// Errors surfaced by the engine's public operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Caller-supplied input is unusable (bad n-gram order, non-positive
    /// temperature, out-of-alphabet symbols). Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Storage read/write failure that survived per-batch retries.
    #[error("persistence failure")]
    Persistence(#[from] StorageError),

    /// Serialized checkpoint does not match the configured architecture.
    #[error("checkpoint corrupt: {0}")]
    CheckpointCorrupt(String),

    /// A training job produced no progress within the stall interval.
    #[error("timed out: {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
