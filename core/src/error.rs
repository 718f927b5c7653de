// Error types for the core library
// Uses thiserror for ergonomic error handling

use std::io;
use thiserror::Error;

/// Main error type for core library operations
#[derive(Error, Debug)]
pub enum CoreError {
    /// Asset, rule, job, role or config key does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed input, unknown enum value, bad rule document
    #[error("validation error: {0}")]
    Validation(String),

    /// Duplicate create or conflicting state transition
    #[error("conflict: {0}")]
    Conflict(String),

    /// Action refused by a guardrail; the caller may retry later
    #[error("deferred by guardrail: {0}")]
    Guarded(String),

    /// FFmpeg/FFprobe/nvidia-smi exited nonzero or could not be spawned
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Operation exceeded its deadline
    #[error("timeout")]
    Timeout,

    /// Operation was cancelled cooperatively
    #[error("cancelled")]
    Cancelled,

    /// Anything that should not happen in normal operation
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether a failed job carrying this error may be retried.
    /// Cancellation and validation problems never are.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            CoreError::Cancelled | CoreError::Validation(_) | CoreError::NotFound(_)
        )
    }
}

/// Convenience type alias for Results using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;
