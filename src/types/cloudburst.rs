//! Cloudburst periods and their persisted records.

use serde::{Deserialize, Serialize};

/// Span and resolution of the series a detection pass ran over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionWindow {
    pub from: i64,
    pub until: i64,
    /// Step of the analysed series (seconds); the summarization bucket when
    /// the long window was down-sampled.
    pub resolution: i64,
}

impl DetectionWindow {
    pub const fn full_duration(&self) -> i64 {
        self.until - self.from
    }
}

/// A contiguous run of anomalous timestamps.
///
/// Invariants: `end >= start`, `duration == end - start`, `resolution > 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudburstPeriod {
    pub start: i64,
    pub end: i64,
    pub duration: i64,
    pub resolution: i64,
    pub full_duration: i64,
    pub from: i64,
    pub until: i64,
}

impl CloudburstPeriod {
    pub fn new(start: i64, end: i64, window: &DetectionWindow) -> Self {
        let end = end.max(start);
        Self {
            start,
            end,
            duration: end - start,
            resolution: window.resolution,
            full_duration: window.full_duration(),
            from: window.from,
            until: window.until,
        }
    }

    /// Whether `other` describes the same event: its start lies within
    /// `[start - resolution, end + resolution]`.
    pub const fn touches(&self, other: &Self) -> bool {
        other.start >= self.start - self.resolution && other.start <= self.end + self.resolution
    }

    /// Extend this period to cover `other`, keeping the later end.
    pub fn absorb(&mut self, other: &Self) {
        self.start = self.start.min(other.start);
        if other.end > self.end {
            self.end = other.end;
            self.from = other.from;
            self.until = other.until;
            self.full_duration = other.full_duration;
        }
        self.duration = self.end - self.start;
    }
}

/// Identifiers of whatever else was recorded during a period. Zero means
/// nothing was found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlations {
    pub match_id: u64,
    pub fp_id: u64,
    pub layer_id: u64,
    pub anomaly_id: u64,
}

/// Persisted cloudburst. Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudburstRecord {
    /// Assigned by the store on insert.
    pub id: u64,
    pub metric_id: u64,
    /// Period start.
    pub timestamp: i64,
    pub end: i64,
    pub duration: i64,
    pub from_timestamp: i64,
    pub resolution: i64,
    pub full_duration: i64,
    pub match_id: u64,
    pub fp_id: u64,
    pub layer_id: u64,
    pub anomaly_id: u64,
    pub added_at: i64,
}

impl CloudburstRecord {
    pub const fn from_period(
        metric_id: u64,
        period: &CloudburstPeriod,
        correlations: Correlations,
        added_at: i64,
    ) -> Self {
        Self {
            id: 0,
            metric_id,
            timestamp: period.start,
            end: period.end,
            duration: period.duration,
            from_timestamp: period.from,
            resolution: period.resolution,
            full_duration: period.full_duration,
            match_id: correlations.match_id,
            fp_id: correlations.fp_id,
            layer_id: correlations.layer_id,
            anomaly_id: correlations.anomaly_id,
            added_at,
        }
    }
}

/// Ledger value for a judged (metric, timestamp) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedMarker {
    /// Record the timestamp contributed to; `None` when it was judged a
    /// duplicate of an event whose id is not known.
    pub cloudburst_id: Option<u64>,
    pub processed_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> DetectionWindow {
        DetectionWindow {
            from: 0,
            until: 1_000,
            resolution: 10,
        }
    }

    #[test]
    fn test_period_invariants() {
        let p = CloudburstPeriod::new(100, 120, &window());
        assert_eq!(p.duration, 20);
        assert_eq!(p.full_duration, 1_000);

        let clamped = CloudburstPeriod::new(100, 90, &window());
        assert_eq!(clamped.end, 100);
        assert_eq!(clamped.duration, 0);
    }

    #[test]
    fn test_touches_is_inclusive() {
        let p = CloudburstPeriod::new(100, 130, &window());
        assert!(p.touches(&CloudburstPeriod::new(140, 150, &window())));
        assert!(p.touches(&CloudburstPeriod::new(90, 95, &window())));
        assert!(!p.touches(&CloudburstPeriod::new(141, 150, &window())));
        assert!(!p.touches(&CloudburstPeriod::new(89, 95, &window())));
    }

    #[test]
    fn test_record_from_period() {
        let p = CloudburstPeriod::new(100, 160, &window());
        let c = Correlations {
            anomaly_id: 7,
            ..Correlations::default()
        };
        let r = CloudburstRecord::from_period(3, &p, c, 5_000);
        assert_eq!(r.timestamp, 100);
        assert_eq!(r.end, 160);
        assert_eq!(r.duration, 60);
        assert_eq!(r.from_timestamp, 0);
        assert_eq!(r.anomaly_id, 7);
        assert_eq!(r.match_id, 0);
    }
}
