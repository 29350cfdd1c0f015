//! Per-worker counters and the per-metric state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Counters a worker publishes at the end of its run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub analysed: u64,
    pub not_analysed: u64,
    pub no_data: u64,
    pub too_short: u64,
    pub too_old: u64,
    pub candidates: u64,
    pub confirmed: u64,
    pub persisted: u64,
    pub duplicates: u64,
    pub deferred: u64,
}

impl WorkerStats {
    pub fn merge(&mut self, other: &Self) {
        self.processed += other.processed;
        self.analysed += other.analysed;
        self.not_analysed += other.not_analysed;
        self.no_data += other.no_data;
        self.too_short += other.too_short;
        self.too_old += other.too_old;
        self.candidates += other.candidates;
        self.confirmed += other.confirmed;
        self.persisted += other.persisted;
        self.duplicates += other.duplicates;
        self.deferred += other.deferred;
    }

    /// Count a skip under its reason.
    pub fn record_skip(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::NoData | SkipReason::NoResolution | SkipReason::FetchFailed => {
                self.no_data += 1;
            }
            SkipReason::TooShort => self.too_short += 1,
            SkipReason::TooOld => self.too_old += 1,
            SkipReason::NotAnalysed => self.not_analysed += 1,
            SkipReason::BudgetExceeded => self.deferred += 1,
            SkipReason::Locked | SkipReason::StoreFailed => {}
        }
    }
}

impl fmt::Display for WorkerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed={} analysed={} not_analysed={} no_data={} too_short={} too_old={} \
             candidates={} confirmed={} persisted={} duplicates={} deferred={}",
            self.processed,
            self.analysed,
            self.not_analysed,
            self.no_data,
            self.too_short,
            self.too_old,
            self.candidates,
            self.confirmed,
            self.persisted,
            self.duplicates,
            self.deferred
        )
    }
}

/// Why a metric left the pipeline without being judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SkipReason {
    /// Another worker holds the metric's exclusion marker.
    Locked,
    NoData,
    /// Catalog has no id or resolution for the metric.
    NoResolution,
    /// Cache or store lookup failed; retried next cycle.
    FetchFailed,
    TooShort,
    TooOld,
    /// Detector returned no verdict or ran out of time.
    NotAnalysed,
    /// Cycle deadline reached; metric queued for continuation.
    BudgetExceeded,
    /// Record insert failed; no markers written, retried next cycle.
    StoreFailed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Locked => "locked",
            Self::NoData => "no_data",
            Self::NoResolution => "no_resolution",
            Self::FetchFailed => "fetch_failed",
            Self::TooShort => "too_short",
            Self::TooOld => "too_old",
            Self::NotAnalysed => "not_analysed",
            Self::BudgetExceeded => "budget_exceeded",
            Self::StoreFailed => "store_failed",
        };
        f.write_str(s)
    }
}

/// Where a metric is in one cycle.
///
/// `Unseen → ShortCandidate → {LongConfirmed | Dropped} → {Duplicate | Persisted}`,
/// with `Quiet` for metrics analysed without a candidate and `Skipped` for
/// everything that never got a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricState {
    Unseen,
    ShortCandidate,
    LongConfirmed,
    Quiet,
    Dropped,
    Duplicate,
    /// At least one record was inserted; carries the first id.
    Persisted(u64),
    Skipped(SkipReason),
}

impl MetricState {
    /// Whether moving to `next` is a legal forward transition.
    pub const fn can_advance_to(&self, next: &Self) -> bool {
        match (self, next) {
            (Self::Unseen, Self::ShortCandidate | Self::Quiet | Self::Skipped(_)) => true,
            (
                Self::ShortCandidate,
                Self::LongConfirmed | Self::Dropped | Self::Skipped(_),
            ) => true,
            (
                Self::LongConfirmed,
                Self::Duplicate | Self::Persisted(_) | Self::Skipped(_),
            ) => true,
            _ => false,
        }
    }
}

impl fmt::Display for MetricState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unseen => f.write_str("unseen"),
            Self::ShortCandidate => f.write_str("short_candidate"),
            Self::LongConfirmed => f.write_str("long_confirmed"),
            Self::Quiet => f.write_str("quiet"),
            Self::Dropped => f.write_str("dropped"),
            Self::Duplicate => f.write_str("duplicate"),
            Self::Persisted(id) => write!(f, "persisted({id})"),
            Self::Skipped(reason) => write!(f, "skipped({reason})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_adds_counters() {
        let mut a = WorkerStats {
            processed: 3,
            analysed: 2,
            ..WorkerStats::default()
        };
        let b = WorkerStats {
            processed: 4,
            too_old: 1,
            ..WorkerStats::default()
        };
        a.merge(&b);
        assert_eq!(a.processed, 7);
        assert_eq!(a.analysed, 2);
        assert_eq!(a.too_old, 1);
    }

    #[test]
    fn test_skip_reasons_map_to_counters() {
        let mut s = WorkerStats::default();
        s.record_skip(SkipReason::NoData);
        s.record_skip(SkipReason::NoResolution);
        s.record_skip(SkipReason::TooShort);
        s.record_skip(SkipReason::BudgetExceeded);
        s.record_skip(SkipReason::Locked);
        assert_eq!(s.no_data, 2);
        assert_eq!(s.too_short, 1);
        assert_eq!(s.deferred, 1);
    }

    #[test]
    fn test_state_machine_is_forward_only() {
        use MetricState::*;
        assert!(Unseen.can_advance_to(&ShortCandidate));
        assert!(ShortCandidate.can_advance_to(&LongConfirmed));
        assert!(LongConfirmed.can_advance_to(&Persisted(1)));
        assert!(!LongConfirmed.can_advance_to(&ShortCandidate));
        assert!(!Persisted(1).can_advance_to(&Duplicate));
        assert!(!Dropped.can_advance_to(&Quiet));
    }
}
