//! Worker Orchestrator
//!
//! Once per `run_every` seconds:
//!
//! 1. purge expired ledger entries, then build the metric universe
//!    (continuation entries first, oldest first, then the catalog)
//! 2. split it into `ceil(total / workers)`-sized contiguous partitions
//! 3. run one worker task per partition with a soft deadline, aborting any
//!    still running at `run_every - kill_margin`
//! 4. aggregate the stats the workers published, log stragglers and queue
//!    them for the next cycle
//! 5. sleep out the interval, refreshing the heartbeat

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::CloudburstConfig;
use crate::pipeline::{Backends, CycleContext, Worker, WorkerReport};
use crate::types::WorkerStats;

/// Contiguous partitions of at most `ceil(len / workers)` metrics. Never more
/// partitions than metrics, and none at all for an empty universe.
pub fn partition(metrics: &[String], workers: usize) -> Vec<Vec<String>> {
    if metrics.is_empty() {
        return Vec::new();
    }
    let size = metrics.len().div_ceil(workers.max(1));
    metrics.chunks(size).map(<[String]>::to_vec).collect()
}

/// Outcome of one cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub reference: i64,
    pub universe: usize,
    /// Totals of the stats workers published to the ledger.
    pub stats: WorkerStats,
    /// Metrics never recorded as processed this cycle.
    pub stragglers: Vec<String>,
    /// Workers aborted at the hard deadline.
    pub killed: usize,
    pub reports: Vec<WorkerReport>,
}

pub struct Orchestrator {
    cfg: Arc<CloudburstConfig>,
    backends: Backends,
}

impl Orchestrator {
    pub fn new(cfg: Arc<CloudburstConfig>, backends: Backends) -> Self {
        Self { cfg, backends }
    }

    /// Deferred metrics first (oldest deferral first), then the catalog.
    pub fn metric_universe(&self, now: i64) -> Result<Vec<String>> {
        let deferred = self
            .backends
            .ledger
            .continuation(now)
            .context("reading continuation map")?;
        let catalog = self
            .backends
            .catalog
            .all_metrics()
            .context("listing catalog metrics")?;

        let mut seen = HashSet::with_capacity(catalog.len());
        Ok(deferred
            .into_iter()
            .map(|(name, _)| name)
            .chain(catalog)
            .filter(|name| seen.insert(name.clone()))
            .collect())
    }

    /// Worker soft deadline: the hard budget less one more kill margin, so a
    /// well-behaved worker winds down before it would be aborted.
    fn soft_budget(&self) -> Duration {
        let o = &self.cfg.orchestrator;
        let secs = (o.run_every_secs - 2 * o.kill_margin_secs).max(1);
        Duration::from_secs(u64::try_from(secs).unwrap_or(1))
    }

    fn hard_budget(&self) -> Duration {
        let secs = self.cfg.cycle_budget_secs().max(1);
        Duration::from_secs(u64::try_from(secs).unwrap_or(1))
    }

    pub async fn run_cycle(&self, now: i64) -> Result<CycleSummary> {
        self.run_cycle_with_budget(now, self.soft_budget(), self.hard_budget())
            .await
    }

    /// One cycle with explicit worker (soft) and kill (hard) budgets.
    pub async fn run_cycle_with_budget(
        &self,
        now: i64,
        soft: Duration,
        hard: Duration,
    ) -> Result<CycleSummary> {
        let started = Instant::now();
        match self.backends.ledger.purge_expired(now) {
            Ok(0) => {}
            Ok(n) => info!("[Orchestrator] Purged {} expired ledger entries", n),
            Err(e) => warn!("[Orchestrator] Ledger purge failed: {}", e),
        }
        let universe = self.metric_universe(now)?;
        let ctx = CycleContext::new(self.cfg.clone(), now, soft);
        let reference = ctx.reference;
        let partitions = partition(&universe, self.cfg.orchestrator.workers);

        info!(
            "[Orchestrator] Cycle {}: {} metrics across {} workers",
            reference,
            universe.len(),
            partitions.len()
        );

        let mut workers: JoinSet<WorkerReport> = JoinSet::new();
        for (i, part) in partitions.into_iter().enumerate() {
            let worker = Worker::new(i + 1, self.backends.clone(), ctx.clone());
            workers.spawn(worker.run(part));
        }

        let mut reports = Vec::new();
        let joined = tokio::time::timeout(hard, async {
            while let Some(result) = workers.join_next().await {
                match result {
                    Ok(report) => reports.push(report),
                    Err(e) => error!("[Orchestrator] Worker task failed: {}", e),
                }
            }
        })
        .await;

        let mut killed = 0;
        if joined.is_err() {
            killed = workers.len();
            warn!(
                "[Orchestrator] {} workers still running after {}s, terminating",
                killed,
                hard.as_secs()
            );
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }
        reports.sort_by_key(|r| r.worker);

        let ledger = &self.backends.ledger;
        let mut stats = WorkerStats::default();
        for (worker, s) in ledger.worker_stats(reference, now)? {
            info!("[Orchestrator] Worker {}: {}", worker, s);
            stats.merge(&s);
        }

        let processed = ledger.cycle_processed(reference, now)?;
        let stragglers: Vec<String> = universe
            .iter()
            .filter(|m| !processed.contains(*m))
            .cloned()
            .collect();
        if !stragglers.is_empty() {
            warn!(
                "[Orchestrator] {} of {} metrics not processed this cycle",
                stragglers.len(),
                universe.len()
            );
            ledger.record_not_processed(
                reference,
                &stragglers,
                self.cfg.ledger.not_processed_ttl_secs,
                now,
            )?;
            for metric in &stragglers {
                ledger.defer(metric, now, self.cfg.ledger.continuation_ttl_secs, now)?;
            }
        }

        info!(
            "[Orchestrator] Cycle {} finished in {:.2}s: {}",
            reference,
            started.elapsed().as_secs_f64(),
            stats
        );

        Ok(CycleSummary {
            reference,
            universe: universe.len(),
            stats,
            stragglers,
            killed,
            reports,
        })
    }

    fn heartbeat(&self) {
        let now = chrono::Utc::now().timestamp();
        if let Err(e) = self
            .backends
            .ledger
            .heartbeat(now, self.cfg.orchestrator.heartbeat_ttl_secs)
        {
            warn!("[Orchestrator] Heartbeat failed: {}", e);
        }
    }

    /// Run cycles until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let interval = Duration::from_secs(
            u64::try_from(self.cfg.orchestrator.run_every_secs).unwrap_or(1),
        );
        let beat = Duration::from_secs(
            u64::try_from(self.cfg.orchestrator.heartbeat_ttl_secs / 2)
                .unwrap_or(1)
                .max(1),
        );

        loop {
            let started = Instant::now();
            self.heartbeat();

            if self.cfg.families.cloudburst_enabled {
                let now = chrono::Utc::now().timestamp();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = self.run_cycle(now) => {
                        if let Err(e) = result {
                            error!("[Orchestrator] Cycle failed: {:#}", e);
                        }
                    }
                }
            } else {
                info!("[Orchestrator] Cloudburst detection disabled, heartbeat only");
            }

            let mut remaining = interval.saturating_sub(started.elapsed());
            while !remaining.is_zero() {
                let step = remaining.min(beat);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("[Orchestrator] Shutdown requested");
                        return Ok(());
                    }
                    _ = tokio::time::sleep(step) => {}
                }
                self.heartbeat();
                remaining = interval.saturating_sub(started.elapsed());
            }

            if cancel.is_cancelled() {
                break;
            }
        }

        info!("[Orchestrator] Shutdown requested");
        Ok(())
    }
}

/// Per-state counts across the reports, for the one-shot summary.
pub fn state_counts(reports: &[WorkerReport]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for state in reports.iter().flat_map(|r| r.states.values()) {
        let key = match state {
            crate::types::MetricState::Persisted(_) => "persisted".to_string(),
            other => other.to_string(),
        };
        *counts.entry(key).or_insert(0) += 1;
    }
    counts
}
