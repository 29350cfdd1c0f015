//! Short-period detection
//!
//! Scans each metric of the partition over its recent samples and keeps the
//! ones whose recent anomalies have not been judged before.

use tracing::{debug, warn};

use super::{Backends, CycleContext, WorkerState};
use crate::detector::{run_bounded, AlgorithmParams, DetectionStage};
use crate::timeseries::{self, FetchError};
use crate::types::{DetectionWindow, Metric, MetricState, RawAnomaly, SkipReason};

/// A metric whose short-window scan found fresh anomalies.
#[derive(Debug, Clone, PartialEq)]
pub struct ShortCandidate {
    pub metric: Metric,
    /// Whether the derivative transform was applied (and must be again).
    pub derivative: bool,
    pub window: DetectionWindow,
    pub anomalies: Vec<RawAnomaly>,
}

enum Verdict {
    Candidate(ShortCandidate),
    Quiet,
    Skipped(SkipReason),
}

/// Keep anomalies inside `[now - check_last, now]` that the ledger has not
/// seen. A ledger read failure keeps the anomaly.
pub(crate) fn fresh_anomalies(
    backends: &Backends,
    base_name: &str,
    anomalies: Vec<RawAnomaly>,
    now: i64,
    check_last: i64,
) -> Vec<RawAnomaly> {
    anomalies
        .into_iter()
        .filter(|a| a.timestamp >= now - check_last && a.timestamp <= now)
        .filter(|a| match backends.ledger.is_processed(base_name, a.timestamp, now) {
            Ok(seen) => !seen,
            Err(e) => {
                warn!(metric = base_name, error = %e, "Processed-marker lookup failed");
                true
            }
        })
        .collect()
}

/// Run the short stage over `partition`. Metrics not reached before the
/// deadline are skipped as `BudgetExceeded` and land in `state.deferred`.
pub async fn run(
    backends: &Backends,
    ctx: &CycleContext,
    partition: &[String],
    state: &mut WorkerState,
) -> Vec<ShortCandidate> {
    let mut candidates = Vec::new();
    let lock_ttl = ctx.cfg.orchestrator.run_every_secs;

    for (i, base_name) in partition.iter().enumerate() {
        if ctx.deadline.expired() {
            warn!(
                remaining = partition.len() - i,
                "Short-period budget exhausted, deferring remaining metrics"
            );
            for rest in &partition[i..] {
                state.skip(rest, SkipReason::BudgetExceeded);
            }
            break;
        }

        match backends.ledger.try_lock(base_name, lock_ttl, ctx.now) {
            Ok(true) => {}
            Ok(false) => {
                debug!(metric = %base_name, "Held by another worker");
                state.skip(base_name, SkipReason::Locked);
                mark_cycle_processed(backends, ctx, base_name);
                continue;
            }
            Err(e) => {
                warn!(metric = %base_name, error = %e, "Exclusion marker failed");
                state.skip(base_name, SkipReason::FetchFailed);
                mark_cycle_processed(backends, ctx, base_name);
                continue;
            }
        }

        let verdict = match scan_metric(backends, ctx, base_name).await {
            Ok(v) => v,
            Err(e) => {
                warn!(metric = %base_name, error = %e, "Short-period fetch failed");
                Verdict::Skipped(SkipReason::FetchFailed)
            }
        };

        if let Err(e) = backends.ledger.unlock(base_name) {
            warn!(metric = %base_name, error = %e, "Failed to release exclusion marker");
        }

        match verdict {
            Verdict::Skipped(SkipReason::BudgetExceeded) => {
                state.skip(base_name, SkipReason::BudgetExceeded);
                continue;
            }
            Verdict::Candidate(candidate) => {
                state.stats.processed += 1;
                state.stats.analysed += 1;
                state.stats.candidates += 1;
                state.advance(base_name, MetricState::ShortCandidate);
                debug!(
                    metric = %base_name,
                    anomalies = candidate.anomalies.len(),
                    "Short-period candidate"
                );
                candidates.push(candidate);
            }
            Verdict::Quiet => {
                state.stats.processed += 1;
                state.stats.analysed += 1;
                state.advance(base_name, MetricState::Quiet);
            }
            Verdict::Skipped(reason) => {
                state.stats.processed += 1;
                state.skip(base_name, reason);
            }
        }

        mark_cycle_processed(backends, ctx, base_name);
        if let Err(e) = backends.ledger.clear_continuation(base_name) {
            warn!(metric = %base_name, error = %e, "Failed to clear continuation entry");
        }
    }

    candidates
}

fn mark_cycle_processed(backends: &Backends, ctx: &CycleContext, base_name: &str) {
    let ttl = ctx.cfg.ledger.cycle_progress_ttl_secs;
    if let Err(e) = backends
        .ledger
        .add_cycle_processed(ctx.reference, base_name, ttl, ctx.now)
    {
        warn!(metric = %base_name, error = %e, "Failed to record cycle progress");
    }
}

async fn scan_metric(
    backends: &Backends,
    ctx: &CycleContext,
    base_name: &str,
) -> Result<Verdict, FetchError> {
    let cfg = &ctx.cfg;

    let (Some(metric_id), Some(resolution)) = (
        backends.catalog.resolve(base_name)?,
        backends.catalog.resolution(base_name)?,
    ) else {
        return Ok(Verdict::Skipped(SkipReason::NoResolution));
    };

    let Some(mut series) = backends.cache.get_recent(base_name)? else {
        return Ok(Verdict::Skipped(SkipReason::NoData));
    };

    let derivative = timeseries::needs_derivative(
        backends.catalog.is_derivative(base_name)?,
        base_name,
        &ctx.exemptions,
    );
    if derivative {
        series = timeseries::non_negative_derivative(&series);
    }

    if series.len() < cfg.short_period.min_samples {
        return Ok(Verdict::Skipped(SkipReason::TooShort));
    }
    if timeseries::is_stale(&series, ctx.now, cfg.orchestrator.run_every_secs) {
        return Ok(Verdict::Skipped(SkipReason::TooOld));
    }

    let series = timeseries::align_to_resolution(&timeseries::truncate_edges(&series), resolution);
    let (Some(first), Some(last)) = (series.first(), series.last()) else {
        return Ok(Verdict::Skipped(SkipReason::TooShort));
    };
    let window = DetectionWindow {
        from: first.timestamp,
        until: last.timestamp,
        resolution,
    };

    if ctx.deadline.expired() {
        return Ok(Verdict::Skipped(SkipReason::BudgetExceeded));
    }
    let params = AlgorithmParams::for_stage(DetectionStage::ShortPeriod, resolution, cfg);
    let check_last = params.check_last;
    let outcome = run_bounded(backends.detector.clone(), series, params).await;

    match outcome.result {
        None => Ok(Verdict::Skipped(SkipReason::NotAnalysed)),
        Some(false) => Ok(Verdict::Quiet),
        Some(true) => {
            let anomalies =
                fresh_anomalies(backends, base_name, outcome.anomalies, ctx.now, check_last);
            if anomalies.is_empty() {
                return Ok(Verdict::Quiet);
            }
            Ok(Verdict::Candidate(ShortCandidate {
                metric: Metric {
                    id: metric_id,
                    base_name: base_name.to_string(),
                    resolution,
                },
                derivative,
                window,
                anomalies,
            }))
        }
    }
}
