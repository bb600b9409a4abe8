//! Subscription error types.

use change_reconciler::ReconcileError;
use operation_controller::OperationError;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a change-feed transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// The server did not acknowledge the subscription in time
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The server refused the subscription
    #[error("Subscription rejected: {0}")]
    Rejected(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Errors surfaced to subscription consumers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Gave up after {attempts} reconnect attempts")]
    ExhaustedRetries { attempts: u32 },
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Json(err) => SyncError::Serialization(err.to_string()),
            other => SyncError::Transport(other.to_string()),
        }
    }
}

impl From<ReconcileError> for SyncError {
    fn from(err: ReconcileError) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<OperationError> for SyncError {
    fn from(_: OperationError) -> Self {
        SyncError::Cancelled
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
