//! Deduplication Ledger
//!
//! Fast key-value bookkeeping shared by all workers through the sled database:
//!
//! - processed markers: which (metric, timestamp) pairs were already judged
//! - per-metric exclusion markers so two workers never scan the same metric
//! - per-cycle progress (processed set, worker stats, stragglers)
//! - the continuation map of metrics deferred by an exhausted budget
//! - the orchestrator heartbeat
//!
//! Every value carries its own expiry; expired entries read as absent. Reads
//! and scans remove the expired entries they meet, and the orchestrator runs
//! `purge_expired` once per cycle for keys nobody reads again.

mod known_periods;

pub use known_periods::{KnownPeriod, KnownPeriodIndex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::storage::{trees, Database, StorageError};
use crate::types::{ProcessedMarker, WorkerStats};

const HEARTBEAT_KEY: &str = "heartbeat.cloudburst";

#[derive(Debug, Serialize, Deserialize)]
struct Entry<T> {
    expires_at: i64,
    value: T,
}

impl<T> Entry<T> {
    const fn is_live(&self, now: i64) -> bool {
        self.expires_at > now
    }
}

/// sled-backed ledger.
#[derive(Clone)]
pub struct DedupLedger {
    kv: sled::Tree,
    processed: sled::Tree,
}

impl DedupLedger {
    pub fn new(db: &Database) -> Result<Self, StorageError> {
        Ok(Self {
            kv: db.tree(trees::LEDGER_KV)?,
            processed: db.tree(trees::LEDGER_PROCESSED)?,
        })
    }

    // ========================================================================
    // TTL key-value primitives
    // ========================================================================

    pub fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: i64,
        now: i64,
    ) -> Result<(), StorageError> {
        let entry = Entry {
            expires_at: now + ttl_secs,
            value,
        };
        self.kv.insert(key, serde_json::to_vec(&entry)?)?;
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str, now: i64) -> Result<Option<T>, StorageError> {
        let Some(bytes) = self.kv.get(key)? else {
            return Ok(None);
        };
        let entry: Entry<T> = serde_json::from_slice(&bytes)?;
        if entry.is_live(now) {
            Ok(Some(entry.value))
        } else {
            self.kv.remove(key)?;
            Ok(None)
        }
    }

    /// Live entries under `prefix`, with the prefix stripped from the key.
    /// Expired entries met on the way are removed.
    fn scan<T: DeserializeOwned>(
        &self,
        prefix: &str,
        now: i64,
    ) -> Result<Vec<(String, T)>, StorageError> {
        let mut out = Vec::new();
        for item in self.kv.scan_prefix(prefix) {
            let (key, bytes) = item?;
            let entry: Entry<T> = serde_json::from_slice(&bytes)?;
            if !entry.is_live(now) {
                self.kv.remove(&key)?;
                continue;
            }
            let key = String::from_utf8_lossy(&key);
            if let Some(rest) = key.strip_prefix(prefix) {
                out.push((rest.to_string(), entry.value));
            }
        }
        Ok(out)
    }

    /// Drop expired key-value entries. Returns the number removed.
    pub fn purge_expired(&self, now: i64) -> Result<usize, StorageError> {
        let mut removed = 0;
        for item in self.kv.iter() {
            let (key, bytes) = item?;
            let expired = serde_json::from_slice::<Entry<serde_json::Value>>(&bytes)
                .map_or(true, |e| !e.is_live(now));
            if expired {
                self.kv.remove(key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ========================================================================
    // Per-metric exclusion
    // ========================================================================

    /// Claim the metric for this worker. `false` when another live claim exists.
    pub fn try_lock(&self, metric: &str, ttl_secs: i64, now: i64) -> Result<bool, StorageError> {
        let key = format!("lock.{metric}");
        let current = self.kv.get(&key)?;
        if let Some(ref bytes) = current {
            let entry: Entry<i64> = serde_json::from_slice(bytes)?;
            if entry.is_live(now) {
                return Ok(false);
            }
        }
        let claim = serde_json::to_vec(&Entry {
            expires_at: now + ttl_secs,
            value: now,
        })?;
        Ok(self.kv.compare_and_swap(&key, current, Some(claim))?.is_ok())
    }

    pub fn unlock(&self, metric: &str) -> Result<(), StorageError> {
        self.kv.remove(format!("lock.{metric}"))?;
        Ok(())
    }

    // ========================================================================
    // Processed markers
    // ========================================================================

    fn marker_key(metric: &str, timestamp: i64) -> String {
        format!("{metric}.{timestamp}")
    }

    pub fn mark_processed(
        &self,
        metric: &str,
        timestamp: i64,
        marker: ProcessedMarker,
        ttl_secs: i64,
    ) -> Result<(), StorageError> {
        let entry = Entry {
            expires_at: marker.processed_at + ttl_secs,
            value: marker,
        };
        self.processed
            .insert(Self::marker_key(metric, timestamp), serde_json::to_vec(&entry)?)?;
        Ok(())
    }

    pub fn processed_marker(
        &self,
        metric: &str,
        timestamp: i64,
        now: i64,
    ) -> Result<Option<ProcessedMarker>, StorageError> {
        let Some(bytes) = self.processed.get(Self::marker_key(metric, timestamp))? else {
            return Ok(None);
        };
        let entry: Entry<ProcessedMarker> = serde_json::from_slice(&bytes)?;
        Ok(entry.is_live(now).then_some(entry.value))
    }

    pub fn is_processed(&self, metric: &str, timestamp: i64, now: i64) -> Result<bool, StorageError> {
        Ok(self.processed_marker(metric, timestamp, now)?.is_some())
    }

    /// Remove markers for timestamps before `cutoff` (and any expired ones).
    pub fn prune_processed_before(&self, cutoff: i64, now: i64) -> Result<usize, StorageError> {
        let mut removed = 0;
        for item in self.processed.iter() {
            let (key, bytes) = item?;
            let key_str = String::from_utf8_lossy(&key);
            let too_old = key_str
                .rsplit_once('.')
                .and_then(|(_, ts)| ts.parse::<i64>().ok())
                .map_or(true, |ts| ts < cutoff);
            let expired = serde_json::from_slice::<Entry<ProcessedMarker>>(&bytes)
                .map_or(true, |e| !e.is_live(now));
            if too_old || expired {
                self.processed.remove(&key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ========================================================================
    // Cycle progress
    // ========================================================================

    pub fn add_cycle_processed(
        &self,
        reference: i64,
        metric: &str,
        ttl_secs: i64,
        now: i64,
    ) -> Result<(), StorageError> {
        self.set(&format!("cycle.{reference}.processed.{metric}"), &true, ttl_secs, now)
    }

    pub fn cycle_processed(&self, reference: i64, now: i64) -> Result<HashSet<String>, StorageError> {
        Ok(self
            .scan::<bool>(&format!("cycle.{reference}.processed."), now)?
            .into_iter()
            .map(|(metric, _)| metric)
            .collect())
    }

    pub fn publish_worker_stats(
        &self,
        reference: i64,
        worker: usize,
        stats: &WorkerStats,
        ttl_secs: i64,
        now: i64,
    ) -> Result<(), StorageError> {
        self.set(&format!("cycle.{reference}.info.{worker}"), stats, ttl_secs, now)
    }

    /// Stats published for a cycle, ordered by worker number.
    pub fn worker_stats(
        &self,
        reference: i64,
        now: i64,
    ) -> Result<Vec<(usize, WorkerStats)>, StorageError> {
        let mut out: Vec<(usize, WorkerStats)> = self
            .scan::<WorkerStats>(&format!("cycle.{reference}.info."), now)?
            .into_iter()
            .filter_map(|(worker, stats)| worker.parse().ok().map(|w| (w, stats)))
            .collect();
        out.sort_by_key(|(w, _)| *w);
        Ok(out)
    }

    pub fn record_not_processed(
        &self,
        reference: i64,
        metrics: &[String],
        ttl_secs: i64,
        now: i64,
    ) -> Result<(), StorageError> {
        for metric in metrics {
            self.set(&format!("cycle.{reference}.not_processed.{metric}"), &true, ttl_secs, now)?;
        }
        Ok(())
    }

    // ========================================================================
    // Heartbeat
    // ========================================================================

    pub fn heartbeat(&self, now: i64, ttl_secs: i64) -> Result<(), StorageError> {
        self.set(HEARTBEAT_KEY, &now, ttl_secs, now)
    }

    // ========================================================================
    // Continuation
    // ========================================================================

    /// Queue a metric for the front of the next cycle. An existing entry keeps
    /// its original deferral time.
    pub fn defer(
        &self,
        metric: &str,
        deferred_at: i64,
        ttl_secs: i64,
        now: i64,
    ) -> Result<(), StorageError> {
        let key = format!("continue.{metric}");
        if self.get::<i64>(&key, now)?.is_some() {
            return Ok(());
        }
        self.set(&key, &deferred_at, ttl_secs, now)
    }

    /// Deferred metrics, oldest first.
    pub fn continuation(&self, now: i64) -> Result<Vec<(String, i64)>, StorageError> {
        let mut entries = self.scan::<i64>("continue.", now)?;
        entries.sort_by(|(a_name, a_ts), (b_name, b_ts)| a_ts.cmp(b_ts).then_with(|| a_name.cmp(b_name)));
        Ok(entries)
    }

    pub fn clear_continuation(&self, metric: &str) -> Result<(), StorageError> {
        self.kv.remove(format!("continue.{metric}"))?;
        Ok(())
    }
}
