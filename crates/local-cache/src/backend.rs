//! Storage backends for the local cache.

use crate::{CacheError, CacheResult};
use base64::Engine;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// URL-safe base64 keeps arbitrary keys filesystem-safe.
const KEY_ENCODING: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;

const ENTRY_EXTENSION: &str = "json";

/// Trait for raw string storage behind the cache.
pub trait CacheBackend: Send + Sync {
    /// Read the stored document for a key.
    fn read(&self, key: &str) -> CacheResult<Option<String>>;

    /// Replace the stored document for a key.
    fn write(&self, key: &str, document: &str) -> CacheResult<()>;

    /// Delete a key. Returns whether something was removed.
    fn delete(&self, key: &str) -> CacheResult<bool>;

    /// List all stored keys.
    fn keys(&self) -> CacheResult<Vec<String>> {
        Ok(Vec::new())
    }
}

/// In-memory backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for MemoryBackend {
    fn read(&self, key: &str) -> CacheResult<Option<String>> {
        let data = self.data.lock().expect("lock poisoned");
        Ok(data.get(key).cloned())
    }

    fn write(&self, key: &str, document: &str) -> CacheResult<()> {
        let mut data = self.data.lock().expect("lock poisoned");
        data.insert(key.to_string(), document.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut data = self.data.lock().expect("lock poisoned");
        Ok(data.remove(key).is_some())
    }

    fn keys(&self) -> CacheResult<Vec<String>> {
        let data = self.data.lock().expect("lock poisoned");
        let mut keys: Vec<String> = data.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// Directory-backed backend storing one JSON document per key.
///
/// Writes go to a temporary sibling file and are renamed into place, so a
/// crash mid-write leaves the previous document intact.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Open (and create if needed) a cache directory.
    pub fn open(dir: impl Into<PathBuf>) -> CacheResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> CacheResult<PathBuf> {
        if key.is_empty() {
            return Err(CacheError::InvalidKey("empty key".to_string()));
        }
        let encoded = KEY_ENCODING.encode(key.as_bytes());
        Ok(self.dir.join(format!("{encoded}.{ENTRY_EXTENSION}")))
    }

    fn decode_file_name(name: &str) -> Option<String> {
        let stem = name.strip_suffix(&format!(".{ENTRY_EXTENSION}"))?;
        let bytes = KEY_ENCODING.decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }
}

impl CacheBackend for FileBackend {
    fn read(&self, key: &str) -> CacheResult<Option<String>> {
        let path = self.entry_path(key)?;
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, key: &str, document: &str) -> CacheResult<()> {
        let path = self.entry_path(key)?;
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        std::fs::write(&tmp, document)?;
        if let Err(err) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> CacheResult<bool> {
        let path = self.entry_path(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn keys(&self) -> CacheResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(key) = entry.file_name().to_str().and_then(Self::decode_file_name) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}
