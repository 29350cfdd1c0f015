//! Period Consolidation
//!
//! Turns the anomalous timestamps of one metric into contiguous
//! `CloudburstPeriod`s, then merges periods that describe the same event.

use crate::types::{CloudburstPeriod, DetectionWindow};

/// Group timestamps into runs where each step equals the window resolution.
///
/// A run of one timestamp gets `end = start + resolution` so that a single
/// point still has a non-zero span. Input order and duplicates don't matter.
pub fn consolidate(timestamps: &[i64], window: &DetectionWindow) -> Vec<CloudburstPeriod> {
    let mut ts = timestamps.to_vec();
    ts.sort_unstable();
    ts.dedup();

    let res = window.resolution;
    let mut periods = Vec::new();
    let mut iter = ts.into_iter();
    let Some(first) = iter.next() else {
        return periods;
    };

    let (mut start, mut end) = (first, first);
    for t in iter {
        if t == end + res {
            end = t;
            continue;
        }
        periods.push(close_run(start, end, window));
        start = t;
        end = t;
    }
    periods.push(close_run(start, end, window));
    periods
}

fn close_run(start: i64, end: i64, window: &DetectionWindow) -> CloudburstPeriod {
    let end = if end == start { start + window.resolution } else { end };
    CloudburstPeriod::new(start, end, window)
}

/// Merge periods whose starts fall within one resolution of a previous
/// period. The merged period keeps the earliest start and the latest end.
pub fn merge_periods(mut periods: Vec<CloudburstPeriod>) -> Vec<CloudburstPeriod> {
    periods.sort_by_key(|p| (p.start, p.end));
    let mut merged: Vec<CloudburstPeriod> = Vec::with_capacity(periods.len());
    for p in periods {
        match merged.last_mut() {
            Some(cur) if cur.touches(&p) => cur.absorb(&p),
            _ => merged.push(p),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(resolution: i64) -> DetectionWindow {
        DetectionWindow {
            from: 0,
            until: 10_000,
            resolution,
        }
    }

    fn spans(periods: &[CloudburstPeriod]) -> Vec<(i64, i64)> {
        periods.iter().map(|p| (p.start, p.end)).collect()
    }

    #[test]
    fn test_consolidate_splits_on_gaps() {
        let periods = consolidate(&[100, 110, 120, 140, 150], &window(10));
        assert_eq!(spans(&periods), vec![(100, 120), (140, 150)]);
        assert_eq!(periods[0].duration, 20);
    }

    #[test]
    fn test_singleton_run_spans_one_step() {
        let periods = consolidate(&[300], &window(60));
        assert_eq!(spans(&periods), vec![(300, 360)]);
        assert_eq!(periods[0].duration, 60);
    }

    #[test]
    fn test_consolidate_ignores_order_and_duplicates() {
        let periods = consolidate(&[120, 100, 110, 110], &window(10));
        assert_eq!(spans(&periods), vec![(100, 120)]);
        assert!(consolidate(&[], &window(10)).is_empty());
    }

    #[test]
    fn test_merge_overlapping_and_adjacent() {
        let w = window(10);
        let merged = merge_periods(vec![
            CloudburstPeriod::new(125, 160, &w),
            CloudburstPeriod::new(100, 130, &w),
        ]);
        assert_eq!(spans(&merged), vec![(100, 160)]);
        assert_eq!(merged[0].duration, 60);

        let adjacent = merge_periods(vec![
            CloudburstPeriod::new(100, 120, &w),
            CloudburstPeriod::new(130, 150, &w),
        ]);
        assert_eq!(spans(&adjacent), vec![(100, 150)]);
    }

    #[test]
    fn test_merge_keeps_distant_periods() {
        let w = window(10);
        let merged = merge_periods(vec![
            CloudburstPeriod::new(200, 210, &w),
            CloudburstPeriod::new(100, 110, &w),
        ]);
        assert_eq!(spans(&merged), vec![(100, 110), (200, 210)]);
    }
}
