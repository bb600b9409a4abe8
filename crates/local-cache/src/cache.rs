//! The local cache facade.

use crate::{CacheBackend, CacheError, CacheResult, MemoryBackend};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// A persisted cache document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub last_written: DateTime<Utc>,
}

/// Broadcast after every successful write or removal.
///
/// `value` is `None` when the key was removed.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageUpdated {
    pub key: String,
    pub value: Option<Value>,
}

/// Durable key -> JSON cache.
///
/// Cheap to clone; clones share the backend and the update channel.
#[derive(Clone)]
pub struct LocalCache {
    backend: Arc<dyn CacheBackend>,
    updates: broadcast::Sender<StorageUpdated>,
}

impl LocalCache {
    /// Create a cache over the given backend.
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self { backend, updates }
    }

    /// Create a cache that lives only in process memory.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Subscribe to `storageUpdated` notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StorageUpdated> {
        self.updates.subscribe()
    }

    /// Read the full entry for a key.
    pub fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        match self.try_read_entry(key) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(key = %key, error = %err, "Cache read failed; treating entry as absent");
                None
            }
        }
    }

    /// Read the value for a key. Never fails.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.get_entry(key).map(|entry| entry.value)
    }

    /// Read the value for a key, or the caller's default.
    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).unwrap_or(default)
    }

    /// Read and decode the value for a key. A value of the wrong shape is
    /// treated as absent.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                warn!(key = %key, error = %err, "Cached value has unexpected shape; ignoring");
                None
            }
        }
    }

    /// Replace the value for a key.
    ///
    /// Returns `false` if the backend rejected the write; the previously
    /// stored value is left as it was.
    pub fn set(&self, key: &str, value: &Value) -> bool {
        let entry = CacheEntry {
            key: key.to_string(),
            value: value.clone(),
            last_written: Utc::now(),
        };

        match self.try_write_entry(&entry) {
            Ok(()) => {
                debug!(key = %key, "Cache entry written");
                let _ = self.updates.send(StorageUpdated {
                    key: entry.key,
                    value: Some(entry.value),
                });
                true
            }
            Err(err) => {
                warn!(key = %key, error = %err, "Cache write failed; keeping value in memory only");
                false
            }
        }
    }

    /// Serialize and store any value.
    pub fn set_as<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        match serde_json::to_value(value) {
            Ok(value) => self.set(key, &value),
            Err(err) => {
                warn!(key = %key, error = %err, "Cache value could not be serialized");
                false
            }
        }
    }

    /// Remove a key. Returns whether an entry was removed.
    pub fn remove(&self, key: &str) -> bool {
        match self.backend.delete(key) {
            Ok(removed) => {
                if removed {
                    let _ = self.updates.send(StorageUpdated {
                        key: key.to_string(),
                        value: None,
                    });
                }
                removed
            }
            Err(err) => {
                warn!(key = %key, error = %err, "Cache remove failed");
                false
            }
        }
    }

    /// All stored keys. Backend failures yield an empty list.
    pub fn keys(&self) -> Vec<String> {
        self.backend.keys().unwrap_or_else(|err| {
            warn!(error = %err, "Cache key listing failed");
            Vec::new()
        })
    }

    /// Remove every entry. Returns how many were removed.
    pub fn clear(&self) -> usize {
        self.keys().iter().filter(|key| self.remove(key)).count()
    }

    fn try_read_entry(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        let Some(document) = self.backend.read(key)? else {
            return Ok(None);
        };
        let entry: CacheEntry = serde_json::from_str(&document)?;
        if entry.key != key {
            return Err(CacheError::InvalidKey(format!(
                "stored entry belongs to {:?}",
                entry.key
            )));
        }
        Ok(Some(entry))
    }

    fn try_write_entry(&self, entry: &CacheEntry) -> CacheResult<()> {
        let document = serde_json::to_string(entry)?;
        self.backend.write(&entry.key, &document)
    }
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("subscribers", &self.updates.receiver_count())
            .finish()
    }
}
