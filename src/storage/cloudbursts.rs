//! Cloudburst Store
//!
//! Append-only table of persisted cloudbursts. Records are never updated or
//! deleted by the pipeline. A `(metric_id, timestamp)` uniqueness index is
//! claimed with compare-and-swap before a record is written, so two workers
//! racing on the same event cannot both insert it. A `(start, id)` index
//! lets recent-period queries read only the tail of the table.

use std::sync::Arc;

use super::{metric_ts_key, trees, Database, StorageError};
use crate::ledger::KnownPeriodIndex;
use crate::types::CloudburstRecord;

/// Durable cloudburst table.
pub trait CloudburstStore: Send + Sync {
    /// Insert a record, returning its assigned id. The `id` field of the
    /// argument is ignored.
    fn insert(&self, record: CloudburstRecord) -> Result<u64, StorageError>;

    /// Periods whose start is at or after `since`, grouped by metric.
    fn query_recent(&self, since: i64) -> Result<KnownPeriodIndex, StorageError>;

    fn get(&self, id: u64) -> Result<Option<CloudburstRecord>, StorageError>;

    /// All records for one metric, oldest first.
    fn for_metric(&self, metric_id: u64) -> Result<Vec<CloudburstRecord>, StorageError>;

    fn count(&self) -> Result<usize, StorageError>;

    fn backend_name(&self) -> &'static str;
}

/// sled-backed store.
pub struct SledCloudburstStore {
    db: Database,
    records: sled::Tree,
    unique: sled::Tree,
    by_start: sled::Tree,
}

/// `start || id`, big-endian so a range from `since` walks records by start.
fn start_key(start: i64, id: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&start.max(0).to_be_bytes());
    key[8..].copy_from_slice(&id.to_be_bytes());
    key
}

impl SledCloudburstStore {
    /// Open the store, rebuilding the start index for databases written
    /// without one.
    pub fn new(db: &Database) -> Result<Self, StorageError> {
        let store = Self {
            db: db.clone(),
            records: db.tree(trees::CLOUDBURSTS)?,
            unique: db.tree(trees::CLOUDBURST_UNIQUE)?,
            by_start: db.tree(trees::CLOUDBURSTS_BY_START)?,
        };
        if store.by_start.is_empty() && !store.records.is_empty() {
            let mut rebuilt = 0;
            for item in store.records.iter() {
                let (_, value) = item?;
                let record = Self::decode(&value)?;
                store
                    .by_start
                    .insert(start_key(record.timestamp, record.id), Vec::<u8>::new())?;
                rebuilt += 1;
            }
            tracing::info!(records = rebuilt, "Rebuilt cloudburst start index");
        }
        Ok(store)
    }

    pub fn shared(db: &Database) -> Result<Arc<dyn CloudburstStore>, StorageError> {
        Ok(Arc::new(Self::new(db)?))
    }

    fn decode(bytes: &[u8]) -> Result<CloudburstRecord, StorageError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl CloudburstStore for SledCloudburstStore {
    fn insert(&self, mut record: CloudburstRecord) -> Result<u64, StorageError> {
        let id = self.db.next_id()?;
        let unique_key = metric_ts_key(record.metric_id, record.timestamp);

        let claim = self.unique.compare_and_swap(
            unique_key,
            None as Option<&[u8]>,
            Some(id.to_be_bytes().to_vec()),
        )?;
        if let Err(conflict) = claim {
            let existing_id = conflict
                .current
                .and_then(|v| <[u8; 8]>::try_from(v.as_ref()).ok())
                .map_or(0, u64::from_be_bytes);
            return Err(StorageError::Duplicate {
                metric_id: record.metric_id,
                timestamp: record.timestamp,
                existing_id,
            });
        }

        record.id = id;
        let written = serde_json::to_vec(&record)
            .map_err(StorageError::from)
            .and_then(|value| {
                self.records.insert(id.to_be_bytes(), value)?;
                self.by_start.insert(start_key(record.timestamp, id), Vec::<u8>::new())?;
                Ok(())
            });
        if let Err(e) = written {
            // Release the claim so a later cycle can retry.
            self.records.remove(id.to_be_bytes())?;
            self.unique.remove(unique_key)?;
            return Err(e);
        }

        tracing::debug!(
            id,
            metric_id = record.metric_id,
            start = record.timestamp,
            end = record.end,
            "Cloudburst inserted"
        );
        Ok(id)
    }

    fn query_recent(&self, since: i64) -> Result<KnownPeriodIndex, StorageError> {
        let mut index = KnownPeriodIndex::default();
        for item in self.by_start.range(start_key(since, 0)..) {
            let (key, _) = item?;
            let Some(id) = key
                .get(8..16)
                .and_then(|b| <[u8; 8]>::try_from(b).ok())
                .map(u64::from_be_bytes)
            else {
                continue;
            };
            if let Some(record) = self.get(id)? {
                index.insert(record.metric_id, record.timestamp, record.end, record.id);
            }
        }
        Ok(index)
    }

    fn get(&self, id: u64) -> Result<Option<CloudburstRecord>, StorageError> {
        self.records
            .get(id.to_be_bytes())?
            .map(|v| Self::decode(&v))
            .transpose()
    }

    fn for_metric(&self, metric_id: u64) -> Result<Vec<CloudburstRecord>, StorageError> {
        let mut out = Vec::new();
        for item in self.unique.scan_prefix(metric_id.to_be_bytes()) {
            let (_, id_bytes) = item?;
            let Ok(bytes) = <[u8; 8]>::try_from(id_bytes.as_ref()) else {
                continue;
            };
            if let Some(record) = self.get(u64::from_be_bytes(bytes))? {
                out.push(record);
            }
        }
        Ok(out)
    }

    fn count(&self) -> Result<usize, StorageError> {
        Ok(self.records.len())
    }

    fn backend_name(&self) -> &'static str {
        "sled"
    }
}
