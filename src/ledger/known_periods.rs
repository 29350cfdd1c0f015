//! In-memory view of recently recorded cloudbursts.
//!
//! Rebuilt from the Cloudburst Store at the start of every worker run and
//! updated as the worker inserts records, so later metrics in the same run see
//! earlier inserts without another store query.

use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownPeriod {
    pub end: i64,
    pub id: u64,
}

/// metric_id → {start → (end, id)}
#[derive(Debug, Clone, Default)]
pub struct KnownPeriodIndex {
    by_metric: HashMap<u64, BTreeMap<i64, KnownPeriod>>,
}

impl KnownPeriodIndex {
    pub fn insert(&mut self, metric_id: u64, start: i64, end: i64, id: u64) {
        self.by_metric
            .entry(metric_id)
            .or_default()
            .insert(start, KnownPeriod { end, id });
    }

    /// Id of a known period whose `[start, end]` contains `timestamp`.
    pub fn covering(&self, metric_id: u64, timestamp: i64) -> Option<u64> {
        self.by_metric
            .get(&metric_id)?
            .range(..=timestamp)
            .rev()
            .find(|(_, p)| timestamp <= p.end)
            .map(|(_, p)| p.id)
    }
}
