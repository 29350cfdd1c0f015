//! Long-period validation
//!
//! Re-runs detection for each short-period candidate against a days-long
//! history. Candidates whose anomalies also stand out against the long
//! baseline are confirmed; the rest are dropped.

use tracing::{debug, info, warn};

use super::short_period::{fresh_anomalies, ShortCandidate};
use super::{Backends, CycleContext, WorkerState};
use crate::detector::{run_bounded, AlgorithmParams, DetectionStage};
use crate::timeseries;
use crate::types::{DetectionWindow, MetricState, ProcessedMarker, RawAnomaly, Sample, SkipReason};

/// A candidate confirmed by the long window.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedCandidate {
    pub short: ShortCandidate,
    /// Window of the long pass; bounds every period built from it.
    pub window: DetectionWindow,
    pub anomalies: Vec<RawAnomaly>,
}

impl ConfirmedCandidate {
    /// Every anomalous timestamp from both stages, sorted and unique.
    pub fn contributing_timestamps(&self) -> Vec<i64> {
        let mut ts: Vec<i64> = self
            .short
            .anomalies
            .iter()
            .chain(&self.anomalies)
            .map(|a| a.timestamp)
            .collect();
        ts.sort_unstable();
        ts.dedup();
        ts
    }
}

pub async fn run(
    backends: &Backends,
    ctx: &CycleContext,
    candidates: Vec<ShortCandidate>,
    state: &mut WorkerState,
) -> Vec<ConfirmedCandidate> {
    let long = &ctx.cfg.long_period;
    let from = ctx.now - long.full_duration_secs;
    let until = ctx.now;
    let summarize = long.summarize();
    let batch_size = long.batch_size.max(1);

    let mut confirmed = Vec::new();
    let mut pending = candidates.into_iter().peekable();

    while pending.peek().is_some() {
        if ctx.deadline.expired() {
            let rest: Vec<ShortCandidate> = pending.collect();
            warn!(remaining = rest.len(), "Long-period budget exhausted, deferring candidates");
            for c in rest {
                state.skip(&c.metric.base_name, SkipReason::BudgetExceeded);
            }
            break;
        }

        let batch: Vec<ShortCandidate> = pending.by_ref().take(batch_size).collect();
        let names: Vec<String> = batch.iter().map(|c| c.metric.base_name.clone()).collect();
        let mut fetched = match backends.history.get_many(&names, from, until, summarize).await {
            Ok(f) => f,
            Err(e) => {
                warn!(
                    backend = backends.history.backend_name(),
                    candidates = batch.len(),
                    error = %e,
                    "Long history fetch failed"
                );
                for c in &batch {
                    state.skip(&c.metric.base_name, SkipReason::FetchFailed);
                }
                continue;
            }
        };

        for (i, candidate) in batch.iter().enumerate() {
            if ctx.deadline.expired() {
                for c in &batch[i..] {
                    state.skip(&c.metric.base_name, SkipReason::BudgetExceeded);
                }
                break;
            }
            let series = fetched.remove(&candidate.metric.base_name).unwrap_or_default();
            if let Some(c) = validate(backends, ctx, candidate, series, from, until, state).await {
                confirmed.push(c);
            }
        }
    }

    if !confirmed.is_empty() {
        info!(confirmed = confirmed.len(), "Long-period validation confirmed candidates");
    }
    confirmed
}

async fn validate(
    backends: &Backends,
    ctx: &CycleContext,
    candidate: &ShortCandidate,
    series: Vec<Sample>,
    from: i64,
    until: i64,
    state: &mut WorkerState,
) -> Option<ConfirmedCandidate> {
    let name = candidate.metric.base_name.as_str();
    let resolution = ctx.cfg.long_period.summarize().unwrap_or(candidate.metric.resolution);

    let series = if candidate.derivative {
        timeseries::non_negative_derivative(&series)
    } else {
        series
    };
    let series = timeseries::align_to_resolution(&timeseries::truncate_edges(&series), resolution);
    if series.len() < 3 {
        state.skip(name, SkipReason::TooShort);
        return None;
    }

    let params = AlgorithmParams::for_stage(DetectionStage::LongPeriod, resolution, &ctx.cfg);
    let check_last = params.check_last;
    let outcome = run_bounded(backends.detector.clone(), series, params).await;
    if !outcome.is_analysed() {
        state.skip(name, SkipReason::NotAnalysed);
        return None;
    }

    let anomalies = fresh_anomalies(backends, name, outcome.anomalies, ctx.now, check_last);
    if anomalies.is_empty() {
        debug!(metric = name, "Not confirmed by long window");
        state.advance(name, MetricState::Dropped);
        mark_dropped(backends, ctx, candidate);
        return None;
    }

    state.stats.confirmed += 1;
    state.advance(name, MetricState::LongConfirmed);
    Some(ConfirmedCandidate {
        short: candidate.clone(),
        window: DetectionWindow {
            from,
            until,
            resolution,
        },
        anomalies,
    })
}

/// The candidate's short-window timestamps were judged not anomalous against
/// the long baseline; remember that so they are not re-raised.
fn mark_dropped(backends: &Backends, ctx: &CycleContext, candidate: &ShortCandidate) {
    let marker = ProcessedMarker {
        cloudburst_id: None,
        processed_at: ctx.now,
    };
    let ttl = ctx.cfg.long_period.full_duration_secs;
    for a in &candidate.anomalies {
        if let Err(e) = backends
            .ledger
            .mark_processed(&candidate.metric.base_name, a.timestamp, marker, ttl)
        {
            warn!(metric = %candidate.metric.base_name, error = %e, "Failed to write processed marker");
            return;
        }
    }
}
