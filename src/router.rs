//! ShardRouter — thread-safe registry of open per-period shard databases.
//!
//! Each accounting period owns one directory under the storage root with a
//! single SQLite file inside. The router lazy-opens shards on first use,
//! pools the open handles in a `RwLock<HashMap>`, and hands out
//! `Arc<ShardHandle>` values that callers thread through every subsequent
//! operation. There is deliberately no "current shard" pointer: under
//! concurrent requests targeting different periods a shared mutable pointer
//! races, so the handle is always explicit.
//!
//! Discovery is a directory scan: a period exists iff its directory contains
//! a shard database file, regardless of what any metadata table records.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use rusqlite::Connection;
use tracing::debug;

use crate::config::{StoreConfig, SYSTEM_DB_FILE};
use crate::error::{Result, StoreError};
use crate::schema;

/// Characters that cannot appear in a period name (filesystem-hostile).
const INVALID_NAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// An open per-period shard database.
///
/// The embedded engine serializes writers internally (WAL, single-writer);
/// the `Mutex` only guards the connection object itself. Handles are shared
/// via `Arc` and stay live as long as any caller holds one, even after the
/// router drops its registry entry.
#[derive(Debug)]
pub struct ShardHandle {
    period: String,
    dir: PathBuf,
    conn: Mutex<Connection>,
}

impl ShardHandle {
    /// Period name this shard belongs to.
    pub fn period(&self) -> &str {
        &self.period
    }

    /// The period's storage directory (attachments live here too).
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }
}

/// The always-open system database (partner master list, version info).
pub struct SystemDb {
    conn: Mutex<Connection>,
}

impl SystemDb {
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }
}

/// Registry of open shards plus the system database.
pub struct ShardRouter {
    shards: RwLock<HashMap<String, Arc<ShardHandle>>>,
    system: SystemDb,
    config: StoreConfig,
}

impl ShardRouter {
    /// Open the storage root: create it if missing, open the system
    /// database and apply its schema.
    pub fn open(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.root).map_err(|e| StoreError::Connection {
            period: "<root>".to_string(),
            reason: format!("failed to create storage root: {e}"),
        })?;

        let system_path = config.root.join(SYSTEM_DB_FILE);
        let conn = open_tuned(&system_path, config.busy_timeout_ms).map_err(|e| {
            StoreError::Connection {
                period: "<system>".to_string(),
                reason: e.to_string(),
            }
        })?;
        schema::apply_system_schema(&conn)?;

        Ok(ShardRouter {
            shards: RwLock::new(HashMap::new()),
            system: SystemDb {
                conn: Mutex::new(conn),
            },
            config,
        })
    }

    /// Get the open handle for `period`, opening the shard if absent.
    ///
    /// On first open: creates the period directory and database file,
    /// applies connection tuning (WAL, lock-wait timeout) and the shard
    /// schema. Idempotent — repeated calls return the same live handle with
    /// no repeated side effects.
    pub fn connect(&self, period: &str) -> Result<Arc<ShardHandle>> {
        validate_period_name(period)?;

        if let Some(handle) = self.shards.read().unwrap().get(period) {
            return Ok(Arc::clone(handle));
        }

        let mut shards = self.shards.write().unwrap();
        // Double-check: another thread may have opened it while we waited.
        if let Some(handle) = shards.get(period) {
            return Ok(Arc::clone(handle));
        }

        let handle = self.open_shard(period, true)?;
        shards.insert(period.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Like [`connect`](Self::connect) but never creates anything on disk:
    /// the shard database file must already exist. Used by pure lookups
    /// (dedup scans, usage checks) that must not conjure empty periods.
    pub fn connect_existing(&self, period: &str) -> Result<Arc<ShardHandle>> {
        validate_period_name(period)?;

        if let Some(handle) = self.shards.read().unwrap().get(period) {
            return Ok(Arc::clone(handle));
        }

        let mut shards = self.shards.write().unwrap();
        if let Some(handle) = shards.get(period) {
            return Ok(Arc::clone(handle));
        }

        if !self.shard_db_path(period).exists() {
            return Err(StoreError::PeriodNotFound(period.to_string()));
        }

        let handle = self.open_shard(period, false)?;
        shards.insert(period.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Release the pooled handle for `period`. No-op when not open. The
    /// underlying connection closes when the last outstanding `Arc` drops.
    pub fn close(&self, period: &str) {
        self.shards.write().unwrap().remove(period);
    }

    /// Release all pooled handles.
    pub fn close_all(&self) {
        self.shards.write().unwrap().clear();
    }

    /// Enumerate periods by scanning the storage root for directories that
    /// contain a shard database file. This scan is authoritative for
    /// existence; metadata tables are not consulted.
    pub fn list_known(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.config.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut periods = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if entry.path().join(&self.config.shard_file_name).is_file() {
                periods.push(name.to_string());
            }
        }
        periods.sort();
        Ok(periods)
    }

    /// True if a shard database file exists for `period`.
    pub fn period_exists(&self, period: &str) -> bool {
        self.shard_db_path(period).is_file()
    }

    pub fn system(&self) -> &SystemDb {
        &self.system
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Directory for a period's shard and attachments.
    pub fn period_dir(&self, period: &str) -> PathBuf {
        self.config.root.join(period)
    }

    fn shard_db_path(&self, period: &str) -> PathBuf {
        self.period_dir(period).join(&self.config.shard_file_name)
    }

    fn open_shard(&self, period: &str, create: bool) -> Result<Arc<ShardHandle>> {
        let dir = self.period_dir(period);
        if create {
            fs::create_dir_all(&dir).map_err(|e| StoreError::Connection {
                period: period.to_string(),
                reason: format!("failed to create period directory: {e}"),
            })?;
        }

        let db_path = dir.join(&self.config.shard_file_name);
        debug!(period, path = %db_path.display(), "opening shard");

        let conn = open_tuned(&db_path, self.config.busy_timeout_ms).map_err(|e| {
            StoreError::Connection {
                period: period.to_string(),
                reason: e.to_string(),
            }
        })?;

        // Schema failure aborts the open; the shard is not registered.
        schema::apply_shard_schema(&conn).map_err(|e| StoreError::Connection {
            period: period.to_string(),
            reason: format!("schema setup failed: {e}"),
        })?;

        Ok(Arc::new(ShardHandle {
            period: period.to_string(),
            dir,
            conn: Mutex::new(conn),
        }))
    }
}

fn open_tuned(path: &Path, busy_timeout_ms: u64) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
    Ok(conn)
}

/// Validate a period name against filesystem-hostile characters.
pub fn validate_period_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StoreError::Validation(
            "period name is required".to_string(),
        ));
    }
    if let Some(c) = name.chars().find(|c| INVALID_NAME_CHARS.contains(c)) {
        return Err(StoreError::Validation(format!(
            "period name cannot contain special character: {c}"
        )));
    }
    Ok(())
}
