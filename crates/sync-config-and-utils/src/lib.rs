//! Core configuration, paths, and logging for the realtime sync engine.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{Config, ReconnectConfig, DEFAULT_FEED_URL, DEFAULT_LOG_LEVEL};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, init_logging_for_service, parse_level, LogConfig};
pub use paths::Paths;
