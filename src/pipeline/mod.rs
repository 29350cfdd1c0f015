//! Detection Pipeline
//!
//! One worker run over a metric partition:
//!
//! ```text
//! partition ──► short_period ──► long_period ──► persist
//!                (candidates)     (confirmed)     (records + markers)
//! ```
//!
//! Each stage takes the previous stage's output by value and returns its
//! own; there is no state shared between stages beyond the per-run
//! `WorkerState`. Every loop checks the cycle `Deadline` at its iteration
//! boundary and hands unfinished metrics back for continuation.

pub mod deadline;
pub mod long_period;
pub mod persist;
pub mod short_period;
pub mod worker;

pub use deadline::Deadline;
pub use long_period::ConfirmedCandidate;
pub use short_period::ShortCandidate;
pub use worker::{Worker, WorkerReport};

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::catalog::{MetricCatalog, SledCatalog};
use crate::config::CloudburstConfig;
use crate::correlation::{CorrelationResolver, MatchKind, SledAnomalyTable, SledMatchTable};
use crate::detector::{ChangePointDetector, M66};
use crate::ledger::DedupLedger;
use crate::storage::{CloudburstStore, Database, SledCloudburstStore};
use crate::timeseries::{FastCache, GraphiteStore, HistoricalStore, SledFastCache, SledHistoryStore};
use crate::types::{MetricState, WorkerStats};

// ============================================================================
// Backends
// ============================================================================

/// Handles to every external collaborator. Cheap to clone; each worker gets
/// its own copy.
#[derive(Clone)]
pub struct Backends {
    pub catalog: Arc<dyn MetricCatalog>,
    pub cache: Arc<dyn FastCache>,
    pub history: Arc<dyn HistoricalStore>,
    pub detector: Arc<dyn ChangePointDetector>,
    pub ledger: Arc<DedupLedger>,
    pub store: Arc<dyn CloudburstStore>,
    pub correlations: Arc<CorrelationResolver>,
}

impl Backends {
    /// Everything sled-backed, except the historical store which is Graphite
    /// when `storage.graphite_url` is set. Detector is m66.
    pub fn from_database(db: &Database, cfg: &CloudburstConfig) -> Result<Self> {
        let history: Arc<dyn HistoricalStore> = match &cfg.storage.graphite_url {
            Some(url) => {
                let timeout = Duration::from_secs(cfg.storage.graphite_timeout_secs);
                info!(url = %url, "Historical store: graphite");
                Arc::new(GraphiteStore::new(url, timeout).context("building graphite client")?)
            }
            None => SledHistoryStore::shared(db).context("opening sample history")?
                as Arc<dyn HistoricalStore>,
        };

        let matches: Vec<Arc<dyn crate::correlation::MatchTable>> = vec![
            Arc::new(SledMatchTable::new(db, MatchKind::FeatureProfile)?),
            Arc::new(SledMatchTable::new(db, MatchKind::Layer)?),
        ];
        let anomalies = Arc::new(SledAnomalyTable::new(db)?);

        Ok(Self {
            catalog: SledCatalog::shared(db).context("opening metric catalog")?,
            cache: SledFastCache::shared(db).context("opening fast cache")?,
            history,
            detector: Arc::new(M66),
            ledger: Arc::new(DedupLedger::new(db).context("opening ledger")?),
            store: SledCloudburstStore::shared(db).context("opening cloudburst store")?,
            correlations: Arc::new(CorrelationResolver::new(matches, anomalies)),
        })
    }

    pub fn with_detector(mut self, detector: Arc<dyn ChangePointDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistoricalStore>) -> Self {
        self.history = history;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn CloudburstStore>) -> Self {
        self.store = store;
        self
    }
}

// ============================================================================
// Cycle context
// ============================================================================

/// Per-cycle inputs every stage reads. Created by the orchestrator, one
/// clone per worker, discarded with the cycle.
#[derive(Clone)]
pub struct CycleContext {
    pub cfg: Arc<CloudburstConfig>,
    /// Cycle start (unix seconds). All lookback windows are relative to it.
    pub now: i64,
    /// `now` floored to the cycle interval; keys the progress bookkeeping.
    pub reference: i64,
    pub deadline: Deadline,
    /// Counters exempt from the derivative transform.
    pub exemptions: Arc<HashSet<String>>,
}

impl CycleContext {
    pub fn new(cfg: Arc<CloudburstConfig>, now: i64, budget: Duration) -> Self {
        let run_every = cfg.orchestrator.run_every_secs.max(1);
        let exemptions = cfg
            .derivative
            .non_derivative_monotonic_metrics
            .iter()
            .cloned()
            .collect();
        Self {
            reference: now.div_euclid(run_every) * run_every,
            now,
            deadline: Deadline::new(budget),
            exemptions: Arc::new(exemptions),
            cfg,
        }
    }
}

// ============================================================================
// Worker state
// ============================================================================

/// Counters and per-metric states accumulated across the stages of one run.
#[derive(Debug, Default)]
pub struct WorkerState {
    pub stats: WorkerStats,
    pub states: BTreeMap<String, MetricState>,
    /// Metrics handed back for the next cycle, in the order they were given up.
    pub deferred: Vec<String>,
}

impl WorkerState {
    /// Move a metric forward. Illegal transitions are ignored and logged.
    pub fn advance(&mut self, metric: &str, next: MetricState) {
        let current = self
            .states
            .get(metric)
            .copied()
            .unwrap_or(MetricState::Unseen);
        if current.can_advance_to(&next) {
            self.states.insert(metric.to_string(), next);
        } else {
            tracing::debug!(metric, from = %current, to = %next, "Ignored state transition");
        }
    }

    pub fn skip(&mut self, metric: &str, reason: crate::types::SkipReason) {
        self.stats.record_skip(reason);
        self.advance(metric, MetricState::Skipped(reason));
        if reason == crate::types::SkipReason::BudgetExceeded {
            self.deferred.push(metric.to_string());
        }
    }
}
