//! Pipeline Integration Tests
//!
//! Full cycles through the orchestrator against a temporary sled database.
//! The m66 detector is swapped for deterministic doubles so every assertion
//! is about pipeline behaviour: candidate selection, confirmation,
//! consolidation, de-duplication, correlation and the cycle budget.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cloudburst::catalog::SledCatalog;
use cloudburst::config::CloudburstConfig;
use cloudburst::correlation::SledAnomalyTable;
use cloudburst::detector::{AlgorithmParams, ChangePointDetector, DetectionOutcome, DetectorError};
use cloudburst::ledger::KnownPeriodIndex;
use cloudburst::orchestrator::{CycleSummary, Orchestrator};
use cloudburst::pipeline::Backends;
use cloudburst::storage::{trees, CloudburstStore, Database, SledCloudburstStore, StorageError};
use cloudburst::timeseries::{SledFastCache, SledHistoryStore};
use cloudburst::types::{
    CloudburstPeriod, CloudburstRecord, Correlations, DetectionWindow, MetricState, RawAnomaly,
    Sample, SkipReason,
};

/// Cycle start used throughout; a multiple of both 60 and 900.
const NOW: i64 = 1_699_999_200;
const RES: i64 = 60;
/// Start of the injected spike.
const SPIKE: i64 = NOW - 7_200;
const CACHE_SPAN: i64 = 4 * 3_600;
const HISTORY_SPAN: i64 = 7 * 86_400;

// ============================================================================
// Detector doubles
// ============================================================================

/// Flags every point above a fixed level.
struct Threshold(f64);

impl ChangePointDetector for Threshold {
    fn detect(
        &self,
        series: &[Sample],
        _params: &AlgorithmParams,
    ) -> Result<DetectionOutcome, DetectorError> {
        let anomalies: Vec<RawAnomaly> = series
            .iter()
            .filter(|s| s.value > self.0)
            .copied()
            .map(RawAnomaly::from)
            .collect();
        Ok(DetectionOutcome {
            result: Some(!anomalies.is_empty()),
            anomaly_score: Some(if anomalies.is_empty() { 0.0 } else { 1.0 }),
            anomalies,
        })
    }

    fn name(&self) -> &'static str {
        "threshold"
    }
}

/// `Threshold` in the short stage only; the long stage never confirms.
struct ShortOnly {
    level: f64,
    long_window: usize,
}

impl ChangePointDetector for ShortOnly {
    fn detect(
        &self,
        series: &[Sample],
        params: &AlgorithmParams,
    ) -> Result<DetectionOutcome, DetectorError> {
        if params.window == self.long_window {
            return Ok(DetectionOutcome {
                result: Some(false),
                anomaly_score: Some(0.0),
                anomalies: Vec::new(),
            });
        }
        Threshold(self.level).detect(series, params)
    }

    fn name(&self) -> &'static str {
        "short-only"
    }
}

/// Quiet verdict after a fixed delay.
struct Slow(Duration);

impl ChangePointDetector for Slow {
    fn detect(&self, _: &[Sample], _: &AlgorithmParams) -> Result<DetectionOutcome, DetectorError> {
        std::thread::sleep(self.0);
        Ok(DetectionOutcome {
            result: Some(false),
            anomaly_score: Some(0.0),
            anomalies: Vec::new(),
        })
    }

    fn name(&self) -> &'static str {
        "slow"
    }
}

/// Store whose inserts always fail.
struct BrokenStore;

impl CloudburstStore for BrokenStore {
    fn insert(&self, _record: CloudburstRecord) -> Result<u64, StorageError> {
        Err(StorageError::Storage("disk full".to_string()))
    }

    fn query_recent(&self, _since: i64) -> Result<KnownPeriodIndex, StorageError> {
        Ok(KnownPeriodIndex::default())
    }

    fn get(&self, _id: u64) -> Result<Option<CloudburstRecord>, StorageError> {
        Ok(None)
    }

    fn for_metric(&self, _metric_id: u64) -> Result<Vec<CloudburstRecord>, StorageError> {
        Ok(Vec::new())
    }

    fn count(&self) -> Result<usize, StorageError> {
        Ok(0)
    }

    fn backend_name(&self) -> &'static str {
        "broken"
    }
}

/// Sled store whose recent-period index always comes back empty, so every
/// duplicate is caught by the store's own uniqueness check.
struct StaleIndexStore(SledCloudburstStore);

impl CloudburstStore for StaleIndexStore {
    fn insert(&self, record: CloudburstRecord) -> Result<u64, StorageError> {
        self.0.insert(record)
    }

    fn query_recent(&self, _since: i64) -> Result<KnownPeriodIndex, StorageError> {
        Ok(KnownPeriodIndex::default())
    }

    fn get(&self, id: u64) -> Result<Option<CloudburstRecord>, StorageError> {
        self.0.get(id)
    }

    fn for_metric(&self, metric_id: u64) -> Result<Vec<CloudburstRecord>, StorageError> {
        self.0.for_metric(metric_id)
    }

    fn count(&self) -> Result<usize, StorageError> {
        self.0.count()
    }

    fn backend_name(&self) -> &'static str {
        "stale-index"
    }
}

// ============================================================================
// Fixture
// ============================================================================

struct Fixture {
    db: Database,
    cfg: Arc<CloudburstConfig>,
    catalog: SledCatalog,
    cache: SledFastCache,
    history: SledHistoryStore,
}

impl Fixture {
    fn new() -> Self {
        Self::with_config(CloudburstConfig::default())
    }

    fn with_config(cfg: CloudburstConfig) -> Self {
        let db = Database::open_temporary().unwrap();
        Self {
            catalog: SledCatalog::new(&db).unwrap(),
            cache: SledFastCache::new(&db).unwrap(),
            history: SledHistoryStore::new(&db).unwrap(),
            cfg: Arc::new(cfg),
            db,
        }
    }

    /// Register `name` and write its cache (last 4h) and history (7d) up to
    /// `until`, valued by `value`.
    fn seed(&self, name: &str, until: i64, value: impl Fn(i64) -> f64) -> u64 {
        let id = self.catalog.register(name, Some(RES)).unwrap();
        let samples: Vec<Sample> = (until - HISTORY_SPAN..=until)
            .step_by(RES as usize)
            .map(|ts| Sample::new(ts, value(ts)))
            .collect();
        let recent: Vec<Sample> = samples
            .iter()
            .copied()
            .filter(|s| s.timestamp >= until - CACHE_SPAN)
            .collect();
        self.cache.put(name, &recent).unwrap();
        self.history.record(name, &samples).unwrap();
        id
    }

    /// Register `name` with a cache entry only.
    fn seed_cache_only(&self, name: &str, value: f64) {
        self.catalog.register(name, Some(RES)).unwrap();
        let recent: Vec<Sample> = (NOW - CACHE_SPAN..=NOW)
            .step_by(RES as usize)
            .map(|ts| Sample::new(ts, value))
            .collect();
        self.cache.put(name, &recent).unwrap();
    }

    fn backends(&self, detector: Arc<dyn ChangePointDetector>) -> Backends {
        Backends::from_database(&self.db, &self.cfg)
            .unwrap()
            .with_detector(detector)
    }

    fn orchestrator(&self, backends: Backends) -> Orchestrator {
        Orchestrator::new(self.cfg.clone(), backends)
    }
}

/// Flat at 10 with three 500s starting at `SPIKE`.
fn spiky(ts: i64) -> f64 {
    if (SPIKE..=SPIKE + 2 * RES).contains(&ts) {
        500.0
    } else {
        10.0
    }
}

fn flat(_: i64) -> f64 {
    10.0
}

fn state_of(summary: &CycleSummary, name: &str) -> MetricState {
    summary
        .reports
        .iter()
        .find_map(|r| r.states.get(name).copied())
        .unwrap_or(MetricState::Unseen)
}

/// A record for `metric_id` spanning `[start, end]`, as an earlier cycle
/// would have stored it.
fn earlier_record(metric_id: u64, start: i64, end: i64) -> CloudburstRecord {
    let window = DetectionWindow {
        from: NOW - HISTORY_SPAN,
        until: NOW - 900,
        resolution: RES,
    };
    CloudburstRecord::from_period(
        metric_id,
        &CloudburstPeriod::new(start, end, &window),
        Correlations::default(),
        NOW - 900,
    )
}

const SPIKE_TS: [i64; 3] = [SPIKE, SPIKE + RES, SPIKE + 2 * RES];

// ============================================================================
// End to end
// ============================================================================

#[tokio::test]
async fn sustained_spike_becomes_one_cloudburst() {
    let fx = Fixture::new();
    let id = fx.seed("app.requests.count", NOW, spiky);
    fx.seed("app.latency.p99", NOW, flat);
    let backends = fx.backends(Arc::new(Threshold(100.0)));

    let summary = fx.orchestrator(backends.clone()).run_cycle(NOW).await.unwrap();
    assert_eq!(summary.universe, 2);
    assert_eq!(summary.killed, 0);
    assert!(summary.stragglers.is_empty());

    let records = backends.store.for_metric(id).unwrap();
    assert_eq!(records.len(), 1);
    let r = &records[0];
    assert_eq!(r.timestamp, SPIKE);
    assert_eq!(r.end, SPIKE + 2 * RES);
    assert_eq!(r.duration, 2 * RES);
    assert_eq!(r.resolution, RES);
    assert_eq!(r.metric_id, id);
    assert_ne!(r.id, 0);

    // Every contributing timestamp points at the record.
    for ts in [SPIKE, SPIKE + RES, SPIKE + 2 * RES] {
        let marker = backends
            .ledger
            .processed_marker("app.requests.count", ts, NOW)
            .unwrap()
            .unwrap();
        assert_eq!(marker.cloudburst_id, Some(r.id));
    }
    assert_eq!(backends.store.count().unwrap(), 1);
}

#[tokio::test]
async fn second_cycle_over_same_data_adds_nothing() {
    let fx = Fixture::new();
    let id = fx.seed("app.requests.count", NOW, spiky);
    let backends = fx.backends(Arc::new(Threshold(100.0)));
    let orchestrator = fx.orchestrator(backends.clone());

    orchestrator.run_cycle(NOW).await.unwrap();
    let first = backends.store.for_metric(id).unwrap();
    assert_eq!(first.len(), 1);

    orchestrator.run_cycle(NOW + 900).await.unwrap();
    let second = backends.store.for_metric(id).unwrap();
    assert_eq!(second, first);
}

#[tokio::test]
async fn records_only_accumulate() {
    let fx = Fixture::new();
    let id = fx.seed("app.requests.count", NOW, spiky);
    let backends = fx.backends(Arc::new(Threshold(100.0)));
    let orchestrator = fx.orchestrator(backends.clone());

    orchestrator.run_cycle(NOW).await.unwrap();
    let first = backends.store.for_metric(id).unwrap();
    assert_eq!(first.len(), 1);

    // A second, separate spike shows up 30 minutes later.
    let later = NOW + 1_800;
    let second_spike = NOW + 1_200;
    fx.seed("app.requests.count", later, |ts| {
        if (second_spike..=second_spike + RES).contains(&ts) {
            800.0
        } else {
            spiky(ts)
        }
    });
    orchestrator.run_cycle(later).await.unwrap();

    let after = backends.store.for_metric(id).unwrap();
    assert_eq!(after.len(), 2);
    assert!(after.contains(&first[0]));
    let new = after.iter().find(|r| r.id != first[0].id).unwrap();
    assert_eq!(new.timestamp, second_spike);
    assert_eq!(new.end, second_spike + RES);
}

// ============================================================================
// Long-period rejection and de-duplication
// ============================================================================

#[tokio::test]
async fn unconfirmed_candidate_is_dropped_and_not_raised_again() {
    let fx = Fixture::new();
    fx.seed("app.requests.count", NOW, spiky);
    let short_only = ShortOnly {
        level: 100.0,
        long_window: fx.cfg.long_period.effective_window(),
    };
    let backends = fx.backends(Arc::new(short_only));

    let summary = fx.orchestrator(backends.clone()).run_cycle(NOW).await.unwrap();
    assert_eq!(state_of(&summary, "app.requests.count"), MetricState::Dropped);
    assert_eq!(summary.stats.candidates, 1);
    assert_eq!(summary.stats.confirmed, 0);
    assert_eq!(backends.store.count().unwrap(), 0);
    for ts in SPIKE_TS {
        let marker = backends
            .ledger
            .processed_marker("app.requests.count", ts, NOW)
            .unwrap()
            .unwrap();
        assert_eq!(marker.cloudburst_id, None);
    }

    // A detector that would confirm now sees nothing new in the short window.
    let confirming = fx.backends(Arc::new(Threshold(100.0)));
    let summary = fx
        .orchestrator(confirming.clone())
        .run_cycle(NOW + 900)
        .await
        .unwrap();
    assert_eq!(state_of(&summary, "app.requests.count"), MetricState::Quiet);
    assert_eq!(confirming.store.count().unwrap(), 0);
}

#[tokio::test]
async fn period_inside_known_record_is_a_duplicate() {
    let fx = Fixture::new();
    let id = fx.seed("app.requests.count", NOW, spiky);
    let backends = fx.backends(Arc::new(Threshold(100.0)));
    let existing = backends
        .store
        .insert(earlier_record(id, SPIKE - RES, SPIKE + RES))
        .unwrap();

    let summary = fx.orchestrator(backends.clone()).run_cycle(NOW).await.unwrap();

    assert_eq!(backends.store.count().unwrap(), 1);
    assert_eq!(state_of(&summary, "app.requests.count"), MetricState::Duplicate);
    assert_eq!(summary.stats.duplicates, 1);
    assert_eq!(summary.stats.persisted, 0);
    for ts in SPIKE_TS {
        let marker = backends
            .ledger
            .processed_marker("app.requests.count", ts, NOW)
            .unwrap()
            .unwrap();
        assert_eq!(marker.cloudburst_id, Some(existing));
    }
}

#[tokio::test]
async fn store_uniqueness_catches_duplicates_the_index_missed() {
    let fx = Fixture::new();
    let id = fx.seed("app.requests.count", NOW, spiky);
    let store = Arc::new(StaleIndexStore(SledCloudburstStore::new(&fx.db).unwrap()));
    let existing = store.insert(earlier_record(id, SPIKE, SPIKE + RES)).unwrap();
    let backends = fx
        .backends(Arc::new(Threshold(100.0)))
        .with_store(store.clone());

    let summary = fx.orchestrator(backends.clone()).run_cycle(NOW).await.unwrap();

    assert_eq!(store.count().unwrap(), 1);
    assert_eq!(store.for_metric(id).unwrap()[0].id, existing);
    assert_eq!(state_of(&summary, "app.requests.count"), MetricState::Duplicate);
    for ts in SPIKE_TS {
        let marker = backends
            .ledger
            .processed_marker("app.requests.count", ts, NOW)
            .unwrap()
            .unwrap();
        assert_eq!(marker.cloudburst_id, Some(existing));
    }
}

// ============================================================================
// Exclusion
// ============================================================================

#[tokio::test]
async fn metric_held_elsewhere_is_skipped_but_counted_as_processed() {
    let fx = Fixture::new();
    fx.seed("app.requests.count", NOW, spiky);
    let backends = fx.backends(Arc::new(Threshold(100.0)));
    let run_every = fx.cfg.orchestrator.run_every_secs;
    assert!(backends
        .ledger
        .try_lock("app.requests.count", run_every, NOW)
        .unwrap());

    let summary = fx.orchestrator(backends.clone()).run_cycle(NOW).await.unwrap();

    assert_eq!(
        state_of(&summary, "app.requests.count"),
        MetricState::Skipped(SkipReason::Locked)
    );
    assert_eq!(backends.store.count().unwrap(), 0);
    assert!(summary.stragglers.is_empty());
    assert!(backends
        .ledger
        .cycle_processed(summary.reference, NOW)
        .unwrap()
        .contains("app.requests.count"));
    // The other holder's claim is left alone.
    assert!(!backends
        .ledger
        .try_lock("app.requests.count", run_every, NOW)
        .unwrap());
}

// ============================================================================
// Derivative gating
// ============================================================================

#[tokio::test]
async fn counters_are_differentiated_unless_exempt() {
    let mut cfg = CloudburstConfig::default();
    cfg.derivative.non_derivative_monotonic_metrics = vec!["app.uptime.total".to_string()];
    let fx = Fixture::with_config(cfg);

    let counter = |ts: i64| 1_000.0 + 10.0 * ((ts - (NOW - HISTORY_SPAN)) / RES) as f64;
    let bytes = fx.seed("app.bytes.total", NOW, counter);
    let uptime = fx.seed("app.uptime.total", NOW, counter);
    fx.catalog.mark_derivative("app.bytes.total").unwrap();
    fx.catalog.mark_derivative("app.uptime.total").unwrap();

    let backends = fx.backends(Arc::new(Threshold(100.0)));
    let summary = fx.orchestrator(backends.clone()).run_cycle(NOW).await.unwrap();

    // Rate of 10 per step never crosses the threshold.
    assert!(backends.store.for_metric(bytes).unwrap().is_empty());
    // The exempt counter is analysed raw, so its level does.
    assert_eq!(backends.store.for_metric(uptime).unwrap().len(), 1);

    let states: Vec<_> = summary
        .reports
        .iter()
        .flat_map(|r| r.states.iter())
        .filter(|(name, _)| name.as_str() == "app.bytes.total")
        .map(|(_, s)| *s)
        .collect();
    assert_eq!(states, vec![MetricState::Quiet]);
}

// ============================================================================
// Correlation
// ============================================================================

#[tokio::test]
async fn anomaly_one_resolution_before_start_is_attached() {
    let fx = Fixture::new();
    let inside = fx.seed("app.requests.count", NOW, spiky);
    let outside = fx.seed("app.errors.count", NOW, spiky);

    let anomalies = SledAnomalyTable::new(&fx.db).unwrap();
    anomalies.record(inside, 77, SPIKE - RES).unwrap();
    anomalies.record(outside, 88, SPIKE - 2 * RES).unwrap();

    let backends = fx.backends(Arc::new(Threshold(100.0)));
    fx.orchestrator(backends.clone()).run_cycle(NOW).await.unwrap();

    let attached = backends.store.for_metric(inside).unwrap();
    assert_eq!(attached.len(), 1);
    assert_eq!(attached[0].anomaly_id, 77);

    let detached = backends.store.for_metric(outside).unwrap();
    assert_eq!(detached.len(), 1);
    assert_eq!(detached[0].anomaly_id, 0);
}

// ============================================================================
// Persistence failure
// ============================================================================

#[tokio::test]
async fn failed_insert_leaves_no_markers_and_retries() {
    let fx = Fixture::new();
    let id = fx.seed("app.requests.count", NOW, spiky);

    let broken = fx
        .backends(Arc::new(Threshold(100.0)))
        .with_store(Arc::new(BrokenStore));
    let summary = fx.orchestrator(broken.clone()).run_cycle(NOW).await.unwrap();
    assert_eq!(summary.stats.persisted, 0);
    for ts in [SPIKE, SPIKE + RES, SPIKE + 2 * RES] {
        assert!(!broken
            .ledger
            .is_processed("app.requests.count", ts, NOW)
            .unwrap());
    }

    let healthy = fx.backends(Arc::new(Threshold(100.0)));
    fx.orchestrator(healthy.clone())
        .run_cycle(NOW + 900)
        .await
        .unwrap();
    let records = healthy.store.for_metric(id).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].timestamp, SPIKE);
}

// ============================================================================
// Budget and partitioning
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cycle_respects_soft_deadline_and_defers_the_rest() {
    let fx = Fixture::new();
    let names: Vec<String> = (0..20).map(|i| format!("app.slow.{i:02}")).collect();
    for name in &names {
        fx.seed_cache_only(name, 10.0);
    }
    let backends = fx.backends(Arc::new(Slow(Duration::from_millis(300))));
    let orchestrator = fx.orchestrator(backends.clone());

    let soft = Duration::from_secs(1);
    let started = Instant::now();
    let summary = orchestrator
        .run_cycle_with_budget(NOW, soft, Duration::from_secs(5))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(
        elapsed < soft + Duration::from_secs(1),
        "cycle overran its budget: {elapsed:?}"
    );
    assert_eq!(summary.killed, 0);
    assert!(!summary.stragglers.is_empty());

    let processed = backends
        .ledger
        .cycle_processed(summary.reference, NOW)
        .unwrap();
    let deferred: HashSet<String> = backends
        .ledger
        .continuation(NOW)
        .unwrap()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    let covered: HashSet<String> = processed.union(&deferred).cloned().collect();
    assert_eq!(covered, names.iter().cloned().collect::<HashSet<_>>());

    // Deferred metrics lead the next universe.
    let universe = orchestrator.metric_universe(NOW + 900).unwrap();
    assert_eq!(universe.len(), names.len());
    assert!(deferred.contains(&universe[0]));
}

#[tokio::test]
async fn every_metric_lands_in_exactly_one_worker() {
    let fx = Fixture::new();
    let names: Vec<String> = (0..5).map(|i| format!("app.flat.{i}")).collect();
    for name in &names {
        fx.seed_cache_only(name, 10.0);
    }
    let backends = fx.backends(Arc::new(Threshold(100.0)));
    let summary = fx.orchestrator(backends).run_cycle(NOW).await.unwrap();

    assert_eq!(summary.reports.len(), 2);
    let mut seen: Vec<String> = summary
        .reports
        .iter()
        .flat_map(|r| r.states.keys().cloned())
        .collect();
    seen.sort();
    assert_eq!(seen, names);
    assert!(summary
        .reports
        .iter()
        .flat_map(|r| r.states.values())
        .all(|s| *s == MetricState::Quiet));
    assert_eq!(summary.stats.processed, 5);
    assert_eq!(summary.stats.analysed, 5);
}

// ============================================================================
// Ledger housekeeping
// ============================================================================

#[tokio::test]
async fn ledger_stays_bounded_across_many_cycles() {
    let fx = Fixture::new();
    for i in 0..10 {
        fx.seed_cache_only(&format!("app.quiet.{i}"), 10.0);
    }
    let backends = fx.backends(Arc::new(Threshold(100.0)));
    let orchestrator = fx.orchestrator(backends);
    let kv = fx.db.tree(trees::LEDGER_KV).unwrap();

    let mut sizes = Vec::new();
    for cycle in 0..20 {
        orchestrator.run_cycle(NOW + cycle * 900).await.unwrap();
        sizes.push(kv.len());
    }

    // One progress entry per metric plus one stats entry per worker; the
    // previous cycle's entries are purged before the next cycle writes.
    assert_eq!(sizes[0], 12);
    assert!(
        sizes.iter().all(|&n| n <= sizes[0]),
        "ledger grew across cycles: {sizes:?}"
    );
}
