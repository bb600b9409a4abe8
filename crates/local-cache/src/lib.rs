//! Local cache for server-owned collections.
//!
//! Maps a resource key to its latest reconciled JSON value. The cache is a
//! soft, reconstructible view over server state: reads never fail (corrupt or
//! unreadable entries are treated as absent) and writes report a success flag
//! instead of an error, so callers can keep going in-memory only.
//!
//! Backends:
//! - [`MemoryBackend`]: process memory, used by tests and ephemeral consumers
//! - [`FileBackend`]: one JSON document per key in a directory

mod backend;
mod cache;
mod error;

pub use backend::{CacheBackend, FileBackend, MemoryBackend};
pub use cache::{CacheEntry, LocalCache, StorageUpdated};
pub use error::{CacheError, CacheResult};
