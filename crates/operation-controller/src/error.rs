//! Operation error types.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// The operation was superseded, cancelled, or torn down.
    #[error("Operation on lane '{lane}' was cancelled")]
    Cancelled { lane: String },
}

pub type OperationResult<T> = Result<T, OperationError>;
