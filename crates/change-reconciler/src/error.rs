//! Reconciliation error types.

use thiserror::Error;

/// Errors raised while validating change-feed payloads or snapshots.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Event lacks the record or id its kind requires
    #[error("Malformed {kind} event: {reason}")]
    MalformedEvent { kind: &'static str, reason: String },

    /// Snapshot JSON is not an array of records
    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using ReconcileError.
pub type ReconcileResult<T> = Result<T, ReconcileError>;
