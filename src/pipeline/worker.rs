//! One worker's run over its partition.

use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{error, info, warn};

use super::{long_period, persist, short_period, Backends, CycleContext, WorkerState};
use crate::ledger::KnownPeriodIndex;
use crate::types::{CloudburstRecord, MetricState, WorkerStats};

/// What a worker hands back to the orchestrator. The durable copy of `stats`
/// is in the ledger; this one is for callers that join the task.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub worker: usize,
    pub stats: WorkerStats,
    pub states: BTreeMap<String, MetricState>,
    pub records: Vec<CloudburstRecord>,
    pub deferred: Vec<String>,
    pub elapsed: Duration,
}

pub struct Worker {
    id: usize,
    backends: Backends,
    ctx: CycleContext,
}

impl Worker {
    pub fn new(id: usize, backends: Backends, ctx: CycleContext) -> Self {
        Self { id, backends, ctx }
    }

    pub async fn run(self, partition: Vec<String>) -> WorkerReport {
        let Self { id, backends, ctx } = self;
        let cfg = &ctx.cfg;
        info!(
            "[Worker {}] Starting: {} metrics, {}s budget",
            id,
            partition.len(),
            ctx.deadline.remaining().as_secs()
        );

        let lookback_start = ctx.now - cfg.long_period.check_last();
        match backends.ledger.prune_processed_before(lookback_start, ctx.now) {
            Ok(0) => {}
            Ok(n) => info!("[Worker {}] Pruned {} processed markers", id, n),
            Err(e) => warn!("[Worker {}] Marker pruning failed: {}", id, e),
        }

        let mut known = match backends
            .store
            .query_recent(ctx.now - cfg.long_period.full_duration_secs)
        {
            Ok(index) => index,
            Err(e) => {
                error!("[Worker {}] Known cloudbursts unavailable: {}", id, e);
                KnownPeriodIndex::default()
            }
        };

        let mut state = WorkerState::default();
        let candidates = short_period::run(&backends, &ctx, &partition, &mut state).await;
        let confirmed = long_period::run(&backends, &ctx, candidates, &mut state).await;
        let records = persist::run(&backends, &ctx, confirmed, &mut known, &mut state);

        for metric in &state.deferred {
            if let Err(e) = backends.ledger.defer(
                metric,
                ctx.now,
                cfg.ledger.continuation_ttl_secs,
                ctx.now,
            ) {
                warn!("[Worker {}] Failed to queue {} for continuation: {}", id, metric, e);
            }
        }

        if let Err(e) = backends.ledger.publish_worker_stats(
            ctx.reference,
            id,
            &state.stats,
            cfg.ledger.cycle_progress_ttl_secs,
            ctx.now,
        ) {
            warn!("[Worker {}] Failed to publish stats: {}", id, e);
        }

        let elapsed = ctx.deadline.elapsed();
        info!(
            "[Worker {}] Done in {:.2}s: {}",
            id,
            elapsed.as_secs_f64(),
            state.stats
        );

        WorkerReport {
            worker: id,
            stats: state.stats,
            states: state.states,
            records,
            deferred: state.deferred,
            elapsed,
        }
    }
}
