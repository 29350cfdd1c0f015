//! Metric identity and time-series samples.

use serde::{Deserialize, Serialize};

/// A metric as seen by one detection cycle.
///
/// Built from the catalog at the start of a metric's processing and
/// immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    pub id: u64,
    pub base_name: String,
    /// Native sampling interval (seconds).
    pub resolution: i64,
}

/// One (timestamp, value) pair. Timestamps are unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: i64,
    pub value: f64,
}

impl Sample {
    pub const fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

impl From<(i64, f64)> for Sample {
    fn from((timestamp, value): (i64, f64)) -> Self {
        Self { timestamp, value }
    }
}

/// A point the change-point detector flagged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawAnomaly {
    pub timestamp: i64,
    pub value: f64,
}

impl From<Sample> for RawAnomaly {
    fn from(s: Sample) -> Self {
        Self {
            timestamp: s.timestamp,
            value: s.value,
        }
    }
}
