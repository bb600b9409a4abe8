//! File system paths for the sync engine.

use crate::{CoreError, CoreResult};
use std::path::PathBuf;

const BASE_DIR_NAME: &str = ".realtime-sync";
const LOG_FILE_NAME: &str = "realtime-sync.jsonl";

/// Manages file system paths for the sync engine.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Base directory for runtime files (~/.realtime-sync)
    base_dir: PathBuf,
}

impl Paths {
    /// Create a new Paths instance rooted at `~/.realtime-sync`.
    pub fn new() -> CoreResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Path("Could not determine home directory".to_string()))?;

        Ok(Self {
            base_dir: home.join(BASE_DIR_NAME),
        })
    }

    /// Create a new Paths instance with a custom base directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get the base directory (~/.realtime-sync).
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Get the config file path (~/.realtime-sync/config.json).
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Get the persisted cache directory (~/.realtime-sync/cache).
    pub fn cache_dir(&self) -> PathBuf {
        self.base_dir.join("cache")
    }

    /// Get the logs directory (~/.realtime-sync/logs).
    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Get the JSONL log file path (~/.realtime-sync/logs/realtime-sync.jsonl).
    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join(LOG_FILE_NAME)
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> CoreResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(self.cache_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn paths_are_rooted_at_base_dir() {
        let base = PathBuf::from("/tmp/rs-test");
        let paths = Paths::with_base_dir(base.clone());

        assert_eq!(paths.base_dir(), &base);
        assert_eq!(paths.config_file(), base.join("config.json"));
        assert_eq!(paths.cache_dir(), base.join("cache"));
        assert_eq!(paths.log_file(), base.join("logs").join(LOG_FILE_NAME));
    }

    #[test]
    fn ensure_dirs_creates_tree() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().join("nested"));

        paths.ensure_dirs().unwrap();
        assert!(paths.cache_dir().is_dir());
        assert!(paths.logs_dir().is_dir());
    }
}
