//! sled-backed match and anomaly tables.
//!
//! Keys are `metric_id || timestamp || id` (big-endian), so a window lookup
//! is one ordered range scan and several entries may share a timestamp.

use sled::Tree;

use super::{AnomalyHit, AnomalyLedger, MatchKind, MatchTable, PatternMatch};
use crate::storage::{metric_ts_key, trees, Database, StorageError};

fn entry_key(metric_id: u64, timestamp: i64, id: u64) -> Vec<u8> {
    let mut key = metric_ts_key(metric_id, timestamp).to_vec();
    key.extend_from_slice(&id.to_be_bytes());
    key
}

/// First value in `[start, end]` for the metric, if any.
fn first_in_window(
    tree: &Tree,
    metric_id: u64,
    start: i64,
    end: i64,
) -> Result<Option<sled::IVec>, StorageError> {
    if end < start {
        return Ok(None);
    }
    let lo = metric_ts_key(metric_id, start);
    let hi = metric_ts_key(metric_id, end.saturating_add(1));
    match tree.range(lo..hi).next() {
        Some(item) => Ok(Some(item?.1)),
        None => Ok(None),
    }
}

#[derive(Clone)]
pub struct SledMatchTable {
    tree: Tree,
    kind: MatchKind,
}

impl SledMatchTable {
    pub fn new(db: &Database, kind: MatchKind) -> Result<Self, StorageError> {
        let name = match kind {
            MatchKind::FeatureProfile => trees::FP_MATCHES,
            MatchKind::Layer => trees::LAYER_MATCHES,
        };
        Ok(Self {
            tree: db.tree(name)?,
            kind,
        })
    }

    /// Store a match. Layer matches without a layer are stored as-is.
    pub fn record(&self, metric_id: u64, m: PatternMatch) -> Result<(), StorageError> {
        self.tree.insert(
            entry_key(metric_id, m.timestamp, m.match_id),
            serde_json::to_vec(&m)?,
        )?;
        Ok(())
    }
}

impl MatchTable for SledMatchTable {
    fn kind(&self) -> MatchKind {
        self.kind
    }

    fn find_in_window(
        &self,
        metric_id: u64,
        start: i64,
        end: i64,
    ) -> Result<Option<PatternMatch>, StorageError> {
        first_in_window(&self.tree, metric_id, start, end)?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(StorageError::from))
            .transpose()
    }
}

#[derive(Clone)]
pub struct SledAnomalyTable {
    tree: Tree,
}

impl SledAnomalyTable {
    pub fn new(db: &Database) -> Result<Self, StorageError> {
        Ok(Self {
            tree: db.tree(trees::ANOMALIES)?,
        })
    }

    pub fn record(&self, metric_id: u64, anomaly_id: u64, timestamp: i64) -> Result<(), StorageError> {
        let hit = AnomalyHit {
            anomaly_id,
            timestamp,
        };
        self.tree
            .insert(entry_key(metric_id, timestamp, anomaly_id), serde_json::to_vec(&hit)?)?;
        Ok(())
    }
}

impl AnomalyLedger for SledAnomalyTable {
    fn find_in_window(
        &self,
        metric_id: u64,
        start: i64,
        end: i64,
    ) -> Result<Option<AnomalyHit>, StorageError> {
        first_in_window(&self.tree, metric_id, start, end)?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(StorageError::from))
            .transpose()
    }
}
