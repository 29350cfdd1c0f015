//! Consolidation, deduplication and persistence of confirmed candidates.

use std::collections::BTreeMap;
use tracing::{error, info, warn};

use super::long_period::ConfirmedCandidate;
use super::{Backends, CycleContext, WorkerState};
use crate::consolidation::{consolidate, merge_periods};
use crate::ledger::KnownPeriodIndex;
use crate::storage::StorageError;
use crate::types::{CloudburstPeriod, CloudburstRecord, MetricState, ProcessedMarker, SkipReason};

/// What became of one period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeriodFate {
    Inserted(u64),
    /// Already recorded; the id is known when the record is.
    Duplicate(Option<u64>),
    Failed,
}

/// Persist every confirmed candidate, returning the records inserted.
///
/// `known` is updated with each insert so later metrics of the same run see
/// it. A failed insert leaves `known` untouched and writes no markers.
pub fn run(
    backends: &Backends,
    ctx: &CycleContext,
    confirmed: Vec<ConfirmedCandidate>,
    known: &mut KnownPeriodIndex,
    state: &mut WorkerState,
) -> Vec<CloudburstRecord> {
    let mut records = Vec::new();

    for (i, candidate) in confirmed.iter().enumerate() {
        if ctx.deadline.expired() {
            for c in &confirmed[i..] {
                state.skip(&c.short.metric.base_name, SkipReason::BudgetExceeded);
            }
            warn!(remaining = confirmed.len() - i, "Persist budget exhausted");
            break;
        }
        persist_metric(backends, ctx, candidate, known, state, &mut records);
    }

    records
}

fn persist_metric(
    backends: &Backends,
    ctx: &CycleContext,
    candidate: &ConfirmedCandidate,
    known: &mut KnownPeriodIndex,
    state: &mut WorkerState,
    records: &mut Vec<CloudburstRecord>,
) {
    let name = candidate.short.metric.base_name.as_str();
    let metric_id = candidate.short.metric.id;

    let timestamps: Vec<i64> = candidate.anomalies.iter().map(|a| a.timestamp).collect();
    let periods = merge_periods(consolidate(&timestamps, &candidate.window));

    let mut fates: Vec<(CloudburstPeriod, PeriodFate)> = Vec::with_capacity(periods.len());
    let mut out_of_time = false;
    for period in periods {
        if ctx.deadline.expired() {
            out_of_time = true;
            break;
        }
        // Every timestamp already passed the long-lookback freshness filter,
        // so no period can start before `now - long.check_last()`.
        let fate = if let Some(id) = known.covering(metric_id, period.start) {
            PeriodFate::Duplicate(Some(id))
        } else {
            insert_period(backends, metric_id, name, &period, known, records)
        };
        match fate {
            PeriodFate::Inserted(_) => state.stats.persisted += 1,
            PeriodFate::Duplicate(_) => state.stats.duplicates += 1,
            PeriodFate::Failed => {}
        }
        fates.push((period, fate));
    }

    write_markers(backends, ctx, candidate, &fates, out_of_time);
    if out_of_time {
        state.skip(name, SkipReason::BudgetExceeded);
        return;
    }

    let first_inserted = fates.iter().find_map(|(_, f)| match f {
        PeriodFate::Inserted(id) => Some(*id),
        _ => None,
    });
    let next = if let Some(id) = first_inserted {
        MetricState::Persisted(id)
    } else if fates.iter().any(|(_, f)| matches!(f, PeriodFate::Duplicate(_))) {
        MetricState::Duplicate
    } else {
        state.skip(name, SkipReason::StoreFailed);
        return;
    };
    state.advance(name, next);
}

fn insert_period(
    backends: &Backends,
    metric_id: u64,
    name: &str,
    period: &CloudburstPeriod,
    known: &mut KnownPeriodIndex,
    records: &mut Vec<CloudburstRecord>,
) -> PeriodFate {
    let correlations = backends.correlations.resolve(metric_id, period);
    let mut record = CloudburstRecord::from_period(
        metric_id,
        period,
        correlations,
        chrono::Utc::now().timestamp(),
    );

    match backends.store.insert(record.clone()) {
        Ok(id) => {
            record.id = id;
            known.insert(metric_id, period.start, period.end, id);
            info!(
                metric = name,
                id,
                start = period.start,
                end = period.end,
                duration = period.duration,
                anomaly_id = record.anomaly_id,
                match_id = record.match_id,
                "☁️ Cloudburst recorded"
            );
            records.push(record);
            PeriodFate::Inserted(id)
        }
        Err(StorageError::Duplicate { existing_id, .. }) => {
            info!(metric = name, existing_id, start = period.start, "Cloudburst already recorded");
            PeriodFate::Duplicate(Some(existing_id))
        }
        Err(e) => {
            error!(metric = name, start = period.start, error = %e, "Failed to persist cloudburst");
            PeriodFate::Failed
        }
    }
}

/// Register every contributing timestamp, tagged with the record of the
/// period that covers it. Timestamps outside every period take the first
/// record's id, unless the metric was only partly settled (an insert failed
/// or time ran out): then only timestamps covered by a settled period are
/// marked, so the rest are retried.
fn write_markers(
    backends: &Backends,
    ctx: &CycleContext,
    candidate: &ConfirmedCandidate,
    fates: &[(CloudburstPeriod, PeriodFate)],
    interrupted: bool,
) {
    let partial = interrupted || fates.iter().any(|(_, f)| *f == PeriodFate::Failed);
    let settled: BTreeMap<i64, (i64, Option<u64>)> = fates
        .iter()
        .filter_map(|(p, f)| match f {
            PeriodFate::Inserted(id) => Some((p.start, (p.end, Some(*id)))),
            PeriodFate::Duplicate(id) => Some((p.start, (p.end, *id))),
            PeriodFate::Failed => None,
        })
        .collect();
    if settled.is_empty() {
        return;
    }
    let fallback = settled.values().find_map(|(_, id)| *id);

    let ttl = ctx.cfg.long_period.full_duration_secs;
    let name = candidate.short.metric.base_name.as_str();
    for ts in candidate.contributing_timestamps() {
        let covering = settled
            .range(..=ts)
            .next_back()
            .filter(|(_, (end, _))| ts <= *end)
            .map(|(_, (_, id))| *id);
        let cloudburst_id = match covering {
            Some(id) => id,
            None if partial => continue,
            None => fallback,
        };
        let marker = ProcessedMarker {
            cloudburst_id,
            processed_at: ctx.now,
        };
        if let Err(e) = backends.ledger.mark_processed(name, ts, marker, ttl) {
            warn!(metric = name, timestamp = ts, error = %e, "Failed to write processed marker");
        }
    }
}
