//! Storage Module
//!
//! One embedded sled database backs every durable concern of the pipeline.
//! Each backend owns one or more named trees:
//!
//! - `metrics`, `derivative_metrics`: metric catalog
//! - `fast_cache`: packed recent samples per metric
//! - `samples`: historical samples keyed by metric and timestamp
//! - `cloudbursts`, `cloudburst_unique`, `cloudbursts_by_start`: persisted
//!   cloudburst records and their indexes
//! - `fp_matches`, `layer_matches`, `anomalies`: correlation sources
//! - `ledger_kv`, `ledger_processed`: deduplication ledger

pub mod cloudbursts;
pub mod lockfile;

pub use cloudbursts::{CloudburstStore, SledCloudburstStore};
pub use lockfile::ProcessLock;

use std::path::Path;
use std::sync::Arc;

/// Tree names, kept in one place so backends sharing a database never collide.
pub mod trees {
    pub const METRICS: &str = "metrics";
    pub const DERIVATIVE_METRICS: &str = "derivative_metrics";
    pub const FAST_CACHE: &str = "fast_cache";
    pub const SAMPLES: &str = "samples";
    pub const CLOUDBURSTS: &str = "cloudbursts";
    pub const CLOUDBURST_UNIQUE: &str = "cloudburst_unique";
    pub const CLOUDBURSTS_BY_START: &str = "cloudbursts_by_start";
    pub const FP_MATCHES: &str = "fp_matches";
    pub const LAYER_MATCHES: &str = "layer_matches";
    pub const ANOMALIES: &str = "anomalies";
    pub const LEDGER_KV: &str = "ledger_kv";
    pub const LEDGER_PROCESSED: &str = "ledger_processed";
}

/// Database file name inside the data directory.
pub const DB_FILE_NAME: &str = "cloudburst.db";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("cloudburst already recorded for metric {metric_id} at {timestamp} (id {existing_id})")]
    Duplicate {
        metric_id: u64,
        timestamp: i64,
        existing_id: u64,
    },
}

impl From<sled::Error> for StorageError {
    fn from(e: sled::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

// ============================================================================
// Database
// ============================================================================

/// Shared handle to the sled database.
#[derive(Clone)]
pub struct Database {
    db: Arc<sled::Db>,
}

impl Database {
    /// Open (or create) `<data_dir>/cloudburst.db`.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, StorageError> {
        let path = data_dir.as_ref().join(DB_FILE_NAME);
        let db = sled::open(&path)?;
        tracing::info!(path = %path.display(), "Opened cloudburst database");
        Ok(Self { db: Arc::new(db) })
    }

    /// In-memory database removed on drop. Used by tests and dry runs.
    pub fn open_temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn tree(&self, name: &str) -> Result<sled::Tree, StorageError> {
        Ok(self.db.open_tree(name)?)
    }

    /// Monotonic id, never zero (zero means "none" in records).
    pub fn next_id(&self) -> Result<u64, StorageError> {
        Ok(self.db.generate_id()? + 1)
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

// ============================================================================
// Key helpers
// ============================================================================

/// `metric_id || timestamp`, big-endian so range scans come back ordered.
pub fn metric_ts_key(metric_id: u64, timestamp: i64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&metric_id.to_be_bytes());
    key[8..].copy_from_slice(&timestamp.to_be_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_id_is_never_zero() {
        let db = Database::open_temporary().unwrap();
        let a = db.next_id().unwrap();
        let b = db.next_id().unwrap();
        assert!(a > 0);
        assert!(b > a);
    }

    #[test]
    fn test_metric_ts_key_orders_by_timestamp() {
        let a = metric_ts_key(7, 100);
        let b = metric_ts_key(7, 1_000);
        let c = metric_ts_key(8, 50);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(&b[8..], &1_000_i64.to_be_bytes());
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.tree(trees::METRICS).unwrap().insert("a", "b").unwrap();
        db.flush().unwrap();
        assert!(dir.path().join(DB_FILE_NAME).exists());
    }
}
