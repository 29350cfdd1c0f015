//! Cloudburst Configuration - every pipeline tunable as a TOML value
//!
//! Each section implements `Default` with the production constants from
//! `defaults.rs`, so a missing file or a missing key behaves exactly like the
//! built-in pipeline.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::defaults;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error ({}): {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("config parse error ({}): {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("config validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
}

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one cloudburst deployment.
///
/// Load with `CloudburstConfig::load()` which searches:
/// 1. `$CLOUDBURST_CONFIG` env var
/// 2. `./cloudburst.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudburstConfig {
    /// Cycle scheduling and worker fan-out
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// First-stage detection over the fast cache
    #[serde(default)]
    pub short_period: ShortPeriodConfig,

    /// Second-stage validation over the historical store
    #[serde(default)]
    pub long_period: LongPeriodConfig,

    /// Detector parameters shared by both stages
    #[serde(default)]
    pub algorithm: AlgorithmConfig,

    /// Retention of ledger bookkeeping keys
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Counter metrics that must never be differentiated
    #[serde(default)]
    pub derivative: DerivativeConfig,

    /// Database location and remote historical store
    #[serde(default)]
    pub storage: StorageConfig,

    /// Enable flags for detection families
    #[serde(default)]
    pub families: FamiliesConfig,
}

impl CloudburstConfig {
    /// Load configuration using the standard search order, then apply
    /// environment overrides. Never fails: a broken file falls back to the
    /// next source with a warning.
    pub fn load() -> Self {
        let mut config = Self::load_from_search_path();
        config.apply_env_overrides();
        config
    }

    fn load_from_search_path() -> Self {
        // 1. Env var
        if let Ok(path) = std::env::var("CLOUDBURST_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded config from CLOUDBURST_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from CLOUDBURST_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "CLOUDBURST_CONFIG points to non-existent file, falling back");
            }
        }

        // 2. ./cloudburst.toml
        let local = PathBuf::from("cloudburst.toml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded config from ./cloudburst.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./cloudburst.toml, using defaults");
                }
            }
        }

        // 3. Defaults
        info!("No cloudburst.toml found, using built-in defaults");
        Self::default()
    }

    /// Load and validate a specific TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parse and validate TOML text. Unknown keys are reported as warnings.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }
        let config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply `CLOUDBURST_*` environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) {
        if let Some(workers) = env_parse::<usize>("CLOUDBURST_WORKERS") {
            self.orchestrator.workers = workers;
        }
        if let Some(run_every) = env_parse::<i64>("CLOUDBURST_RUN_EVERY_SECS") {
            self.orchestrator.run_every_secs = run_every;
        }
        if let Ok(dir) = std::env::var("CLOUDBURST_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("CLOUDBURST_GRAPHITE_URL") {
            self.storage.graphite_url = (!url.is_empty()).then_some(url);
        }
    }

    /// Check internal consistency.
    ///
    /// Rules:
    /// - at least one worker, positive windows and lookbacks
    /// - the kill margin leaves a positive cycle budget
    /// - the long window covers the long lookback
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();
        let o = &self.orchestrator;
        let s = &self.short_period;
        let l = &self.long_period;
        let a = &self.algorithm;

        if o.workers == 0 {
            errors.push("orchestrator.workers must be at least 1".to_string());
        }
        if o.run_every_secs <= 0 {
            errors.push(format!("orchestrator.run_every_secs ({}) must be > 0", o.run_every_secs));
        }
        if o.kill_margin_secs < 0 || o.kill_margin_secs >= o.run_every_secs {
            errors.push(format!(
                "orchestrator.kill_margin_secs ({}) must be in [0, run_every_secs ({}))",
                o.kill_margin_secs, o.run_every_secs
            ));
        }
        if s.check_last_secs <= 0 {
            errors.push("short_period.check_last_secs must be > 0".to_string());
        }
        if s.window < 2 {
            errors.push(format!("short_period.window ({}) must be >= 2", s.window));
        }
        if s.min_samples < 3 {
            errors.push(format!("short_period.min_samples ({}) must be >= 3", s.min_samples));
        }
        if !(0.0..=100.0).contains(&s.minimum_sparsity) {
            errors.push("short_period.minimum_sparsity must be a percentage".to_string());
        }
        if l.window < 2 || l.high_res_window < 2 {
            errors.push("long_period windows must be >= 2".to_string());
        }
        if l.check_last_secs <= 0 || l.high_res_check_last_secs <= 0 {
            errors.push("long_period lookbacks must be > 0".to_string());
        }
        if l.full_duration_secs < l.check_last() {
            errors.push(format!(
                "long_period.full_duration_secs ({}) must cover the long lookback ({})",
                l.full_duration_secs,
                l.check_last()
            ));
        }
        if l.summarize_secs <= 0 {
            errors.push("long_period.summarize_secs must be > 0".to_string());
        }
        if l.batch_size == 0 {
            errors.push("long_period.batch_size must be at least 1".to_string());
        }
        if a.nth_median == 0 {
            errors.push("algorithm.nth_median must be at least 1".to_string());
        }
        if a.sigma <= 0.0 {
            errors.push(format!("algorithm.sigma ({}) must be > 0", a.sigma));
        }
        if a.max_execution_ms == 0 {
            errors.push("algorithm.max_execution_ms must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Seconds a cycle may run before workers are killed.
    pub const fn cycle_budget_secs(&self) -> i64 {
        self.orchestrator.run_every_secs - self.orchestrator.kill_margin_secs
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

// ============================================================================
// Orchestrator Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Parallel workers per cycle.
    pub workers: usize,
    /// Cycle interval in seconds.
    pub run_every_secs: i64,
    /// Seconds before the end of the cycle at which workers are killed.
    pub kill_margin_secs: i64,
    /// Liveness key expiry.
    pub heartbeat_ttl_secs: i64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: defaults::WORKER_COUNT,
            run_every_secs: defaults::RUN_EVERY_SECS,
            kill_margin_secs: defaults::KILL_MARGIN_SECS,
            heartbeat_ttl_secs: defaults::HEARTBEAT_TTL_SECS,
        }
    }
}

// ============================================================================
// Short-Period Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShortPeriodConfig {
    /// Base lookback for candidate anomalies (seconds).
    pub check_last_secs: i64,
    /// Detector window at native resolutions up to 60 s.
    pub window: usize,
    /// Lookback extension for resolutions above 60 s.
    pub coarse_extra_secs: i64,
    /// Lookback extension for resolutions above 600 s.
    pub very_coarse_extra_secs: i64,
    /// Fewer samples than this and the metric is skipped as too short.
    pub min_samples: usize,
    /// Percent of expected samples that must be present.
    pub minimum_sparsity: f64,
}

impl Default for ShortPeriodConfig {
    fn default() -> Self {
        Self {
            check_last_secs: defaults::SHORT_CHECK_LAST_SECS,
            window: defaults::SHORT_WINDOW,
            coarse_extra_secs: defaults::SHORT_COARSE_EXTRA_SECS,
            very_coarse_extra_secs: defaults::SHORT_VERY_COARSE_EXTRA_SECS,
            min_samples: defaults::MIN_SAMPLES,
            minimum_sparsity: defaults::SHORT_MINIMUM_SPARSITY,
        }
    }
}

// ============================================================================
// Long-Period Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LongPeriodConfig {
    /// Span of the long history window (seconds).
    pub full_duration_secs: i64,
    /// Active lookback over the summarized series (seconds).
    pub check_last_secs: i64,
    /// Detector window over the summarized series.
    pub window: usize,
    /// Skip summarization and analyse at native resolution.
    pub high_resolution: bool,
    /// Detector window in high-resolution mode.
    pub high_res_window: usize,
    /// Active lookback in high-resolution mode (seconds).
    pub high_res_check_last_secs: i64,
    /// Median summarization bucket (seconds).
    pub summarize_secs: i64,
    /// Candidates per historical-store request.
    pub batch_size: usize,
}

impl Default for LongPeriodConfig {
    fn default() -> Self {
        Self {
            full_duration_secs: defaults::LONG_FULL_DURATION_SECS,
            check_last_secs: defaults::LONG_CHECK_LAST_SECS,
            window: defaults::LONG_WINDOW,
            high_resolution: true,
            high_res_window: defaults::LONG_HIGH_RES_WINDOW,
            high_res_check_last_secs: defaults::LONG_HIGH_RES_CHECK_LAST_SECS,
            summarize_secs: defaults::LONG_SUMMARIZE_SECS,
            batch_size: defaults::LONG_BATCH_SIZE,
        }
    }
}

impl LongPeriodConfig {
    /// Lookback in effect for the configured mode.
    pub const fn check_last(&self) -> i64 {
        if self.high_resolution {
            self.high_res_check_last_secs
        } else {
            self.check_last_secs
        }
    }

    /// Detector window in effect for the configured mode.
    pub const fn effective_window(&self) -> usize {
        if self.high_resolution {
            self.high_res_window
        } else {
            self.window
        }
    }

    /// Summarization bucket, or `None` in high-resolution mode.
    pub const fn summarize(&self) -> Option<i64> {
        if self.high_resolution {
            None
        } else {
            Some(self.summarize_secs)
        }
    }
}

// ============================================================================
// Algorithm Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgorithmConfig {
    pub nth_median: usize,
    pub sigma: f64,
    /// Per-call budget; exceeding it counts the metric as not analysed.
    pub max_execution_ms: u64,
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            nth_median: defaults::NTH_MEDIAN,
            sigma: defaults::SIGMA,
            max_execution_ms: defaults::MAX_EXECUTION_MS,
        }
    }
}

// ============================================================================
// Ledger Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub cycle_progress_ttl_secs: i64,
    pub not_processed_ttl_secs: i64,
    pub continuation_ttl_secs: i64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            cycle_progress_ttl_secs: defaults::CYCLE_PROGRESS_TTL_SECS,
            not_processed_ttl_secs: defaults::NOT_PROCESSED_TTL_SECS,
            continuation_ttl_secs: defaults::CONTINUATION_TTL_SECS,
        }
    }
}

// ============================================================================
// Derivative Config
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DerivativeConfig {
    /// Monotonic metrics that are analysed as-is even when the catalog
    /// flags them as counters.
    pub non_derivative_monotonic_metrics: Vec<String>,
}

// ============================================================================
// Storage Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the sled database and the process lock.
    pub data_dir: PathBuf,
    /// Graphite render endpoint for the long window; the local sample tree
    /// is used when unset.
    pub graphite_url: Option<String>,
    pub graphite_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(defaults::DATA_DIR),
            graphite_url: None,
            graphite_timeout_secs: defaults::GRAPHITE_TIMEOUT_SECS,
        }
    }
}

// ============================================================================
// Families Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FamiliesConfig {
    /// Change-point (cloudburst) detection.
    pub cloudburst_enabled: bool,
}

impl Default for FamiliesConfig {
    fn default() -> Self {
        Self {
            cloudburst_enabled: true,
        }
    }
}
