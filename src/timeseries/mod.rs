//! Time-Series Fetcher
//!
//! Sources and transforms for the series the detector sees:
//!
//! - `FastCache`: recent samples (short window), MessagePack-packed
//! - `HistoricalStore`: long history, optionally median-summarized
//!   (`SledHistoryStore` locally, `GraphiteStore` over HTTP)
//! - transforms: non-negative derivative for counters, edge truncation,
//!   resolution alignment, staleness check

pub mod cache;
pub mod codec;
pub mod graphite;
pub mod history;

pub use cache::{FastCache, SledFastCache};
pub use graphite::GraphiteStore;
pub use history::{HistoricalStore, SledHistoryStore};

use statrs::statistics::{Data, Median};
use std::collections::HashSet;

use crate::storage::StorageError;
use crate::types::Sample;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("historical store request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("historical store returned HTTP {0}")]
    Status(u16),
}

impl From<sled::Error> for FetchError {
    fn from(e: sled::Error) -> Self {
        Self::Storage(e.into())
    }
}

// ============================================================================
// Transforms
// ============================================================================

/// Whether a counter metric should be differentiated. Exempted metrics never
/// are, even when the catalog lists them as counters.
pub fn needs_derivative(is_counter: bool, base_name: &str, exemptions: &HashSet<String>) -> bool {
    is_counter && !exemptions.contains(base_name)
}

/// Rate of change of a monotonic counter. The first sample has no
/// predecessor and is dropped; negative steps (counter resets) are dropped.
pub fn non_negative_derivative(series: &[Sample]) -> Vec<Sample> {
    series
        .windows(2)
        .filter_map(|pair| {
            let delta = pair[1].value - pair[0].value;
            (delta >= 0.0).then(|| Sample::new(pair[1].timestamp, delta))
        })
        .collect()
}

/// Drop the first sample and the final two. The newest points of a cache
/// entry or summary bucket are usually partial and would read as a cliff.
pub fn truncate_edges(series: &[Sample]) -> Vec<Sample> {
    if series.len() <= 3 {
        return Vec::new();
    }
    series[1..series.len() - 2].to_vec()
}

/// Floor every timestamp to a multiple of `resolution`. When two samples land
/// on the same slot the later one wins.
pub fn align_to_resolution(series: &[Sample], resolution: i64) -> Vec<Sample> {
    if resolution <= 0 {
        return series.to_vec();
    }
    let mut out: Vec<Sample> = Vec::with_capacity(series.len());
    for s in series {
        let ts = s.timestamp.div_euclid(resolution) * resolution;
        match out.last_mut() {
            Some(last) if last.timestamp == ts => last.value = s.value,
            _ => out.push(Sample::new(ts, s.value)),
        }
    }
    out
}

/// Median of each `bucket`-second slot, stamped with the slot start.
pub fn summarize_median(series: &[Sample], bucket: i64) -> Vec<Sample> {
    if bucket <= 0 {
        return series.to_vec();
    }
    let mut out = Vec::new();
    let mut slot: Option<i64> = None;
    let mut values: Vec<f64> = Vec::new();
    for s in series {
        let start = s.timestamp.div_euclid(bucket) * bucket;
        if slot != Some(start) {
            if let Some(prev) = slot {
                out.push(Sample::new(prev, Data::new(std::mem::take(&mut values)).median()));
            }
            slot = Some(start);
        }
        values.push(s.value);
    }
    if let Some(prev) = slot {
        out.push(Sample::new(prev, Data::new(values).median()));
    }
    out
}

/// Newest sample older than two cycles.
pub fn is_stale(series: &[Sample], now: i64, run_every: i64) -> bool {
    series
        .last()
        .map_or(true, |s| s.timestamp < now - 2 * run_every)
}
