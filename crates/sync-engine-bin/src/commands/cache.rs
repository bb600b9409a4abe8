//! Cache inspection commands.

use local_cache::{FileBackend, LocalCache};
use std::sync::Arc;
use sync_config_and_utils::{Config, Paths};

/// Open the on-disk cache the engine writes to.
pub fn open_cache(config: &Config, paths: &Paths) -> Result<LocalCache, Box<dyn std::error::Error>> {
    let backend = FileBackend::open(config.cache_dir(paths))?;
    Ok(LocalCache::new(Arc::new(backend)))
}

/// List cached keys with their last write time.
pub fn cache_list(cache: &LocalCache) {
    let keys = cache.keys();
    if keys.is_empty() {
        println!("Cache is empty");
        return;
    }

    for key in keys {
        match cache.get_entry(&key) {
            Some(entry) => {
                let records = entry.value.as_array().map(Vec::len);
                let count = records
                    .map(|n| format!("{n} records"))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  {:<24} {:<12} {}",
                    key,
                    count,
                    entry.last_written.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
            None => println!("  {:<24} (unreadable)", key),
        }
    }
}

/// Print one cached value as pretty JSON.
pub fn cache_get(cache: &LocalCache, key: &str) -> Result<(), Box<dyn std::error::Error>> {
    match cache.get(key) {
        Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        None => println!("No cached value for '{}'", key),
    }
    Ok(())
}

pub fn cache_clear(cache: &LocalCache, key: Option<&str>) {
    match key {
        Some(key) => {
            if cache.remove(key) {
                println!("Removed '{}'", key);
            } else {
                println!("No cached value for '{}'", key);
            }
        }
        None => {
            let removed = cache.clear();
            println!("Removed {} cached entries", removed);
        }
    }
}
