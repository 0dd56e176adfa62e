//! Store configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// File name of the per-period shard database inside its directory.
pub const DEFAULT_SHARD_FILE: &str = "Deals.db";

/// File name of the always-open system database at the storage root.
pub const SYSTEM_DB_FILE: &str = "System.db";

/// Configuration for a [`crate::store::DealStore`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    /// Storage root; one subdirectory per period.
    pub root: PathBuf,
    /// Shard database file name inside each period directory.
    pub shard_file_name: String,
    /// SQLite lock-wait timeout per connection, in milliseconds.
    pub busy_timeout_ms: u64,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StoreConfig {
            root: root.into(),
            shard_file_name: DEFAULT_SHARD_FILE.to_string(),
            busy_timeout_ms: 30_000,
        }
    }

    /// Load a persisted configuration, falling back to defaults when the
    /// file does not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(json) => serde_json::from_str(&json)
                .map_err(|e| StoreError::Validation(format!("invalid config file: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreConfig::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| StoreError::Validation(format!("config not serializable: {e}")))?;
        fs::write(path, json)?;
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::new("data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = StoreConfig::new("/tmp/data");
        assert_eq!(cfg.shard_file_name, "Deals.db");
        assert_eq!(cfg.busy_timeout_ms, 30_000);
    }

    #[test]
    fn survives_json_round_trip() {
        let cfg = StoreConfig::new("/data");
        let json = serde_json::to_string(&cfg).unwrap();
        let back: StoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(cfg, StoreConfig::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut cfg = StoreConfig::new("/srv/deals");
        cfg.busy_timeout_ms = 5_000;
        cfg.save(&path).unwrap();

        assert_eq!(StoreConfig::load(&path).unwrap(), cfg);
    }
}
