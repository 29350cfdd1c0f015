//! System-wide default constants.
//!
//! Every tunable in `CloudburstConfig` falls back to one of these values.
//! Grouped by pipeline stage.

// ============================================================================
// Orchestrator
// ============================================================================

/// Number of parallel workers started per cycle.
pub const WORKER_COUNT: usize = 2;

/// Cycle interval (seconds). 900 = 15 minutes.
pub const RUN_EVERY_SECS: i64 = 900;

/// Workers still running `run_every - margin` seconds into a cycle are killed.
pub const KILL_MARGIN_SECS: i64 = 10;

/// Orchestrator heartbeat time-to-live (seconds).
pub const HEARTBEAT_TTL_SECS: i64 = 120;

// ============================================================================
// Short-Period Detection
// ============================================================================

/// Active lookback for short-period anomalies (seconds). 14 400 = 4 hours.
pub const SHORT_CHECK_LAST_SECS: i64 = 14_400;

/// Detector window for metrics at or below 60 s resolution.
pub const SHORT_WINDOW: usize = 5;

/// Extra lookback added when resolution exceeds 60 s (seconds).
pub const SHORT_COARSE_EXTRA_SECS: i64 = 1_800;

/// Extra lookback added when resolution exceeds 600 s (seconds).
pub const SHORT_VERY_COARSE_EXTRA_SECS: i64 = 3_600;

/// Minimum samples required before a series is worth analysing.
pub const MIN_SAMPLES: usize = 3;

/// Minimum sparsity (percent of expected points present) for short windows.
pub const SHORT_MINIMUM_SPARSITY: f64 = 75.0;

// ============================================================================
// Long-Period Validation
// ============================================================================

/// Long window span (seconds). 604 800 = 7 days.
pub const LONG_FULL_DURATION_SECS: i64 = 604_800;

/// Active lookback for long-period anomalies (seconds). 21 600 = 6 hours.
pub const LONG_CHECK_LAST_SECS: i64 = 21_600;

/// Active lookback in high-resolution mode (seconds). 14 400 = 4 hours.
pub const LONG_HIGH_RES_CHECK_LAST_SECS: i64 = 14_400;

/// Detector window over the summarized long series.
pub const LONG_WINDOW: usize = 4;

/// Detector window in high-resolution mode.
pub const LONG_HIGH_RES_WINDOW: usize = 10;

/// Summarization bucket (seconds). 900 = 15 minutes.
pub const LONG_SUMMARIZE_SECS: i64 = 900;

/// Candidates fetched per historical-store request.
pub const LONG_BATCH_SIZE: usize = 50;

// ============================================================================
// Detector
// ============================================================================

/// Rolling-median passes applied before the n-sigma test.
pub const NTH_MEDIAN: usize = 6;

/// Standard deviations a point must exceed to trigger.
pub const SIGMA: f64 = 6.0;

/// Per-call execution budget (milliseconds).
pub const MAX_EXECUTION_MS: u64 = 500;

// ============================================================================
// Ledger
// ============================================================================

/// Retention of the per-cycle processed set and worker info (seconds).
pub const CYCLE_PROGRESS_TTL_SECS: i64 = 600;

/// Retention of the per-cycle straggler set (seconds).
pub const NOT_PROCESSED_TTL_SECS: i64 = 3_600;

/// Retention of continuation entries (seconds). 86 400 = 1 day.
pub const CONTINUATION_TTL_SECS: i64 = 86_400;

// ============================================================================
// Storage
// ============================================================================

/// Default data directory.
pub const DATA_DIR: &str = "./data";

/// Historical store HTTP timeout (seconds).
pub const GRAPHITE_TIMEOUT_SECS: u64 = 30;
