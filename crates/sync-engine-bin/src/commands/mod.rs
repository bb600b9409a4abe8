//! CLI command implementations.

mod cache;
mod watch;

pub use cache::{cache_clear, cache_get, cache_list, open_cache};
pub use watch::watch;
