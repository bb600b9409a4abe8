//! Engine error types.

use local_cache::CacheError;
use sync_config_and_utils::CoreError;
use thiserror::Error;

/// Errors raised while building or using a [`crate::SyncEngine`].
#[derive(Error, Debug)]
pub enum EngineError {
    /// Configuration or path error
    #[error(transparent)]
    Config(#[from] CoreError),

    /// Cache backend could not be opened
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// The engine has been shut down
    #[error("Sync engine is shut down")]
    ShutDown,
}

pub type EngineResult<T> = Result<T, EngineError>;
