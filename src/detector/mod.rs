//! Change-Point Detector
//!
//! The detector is a pure function over a series: given algorithm parameters
//! it returns a verdict, a score and the anomalous points. The pipeline calls
//! it identically in both stages; only the parameters differ, and they are
//! derived from the `DetectionStage` here.
//!
//! Calls run on the blocking pool under a wall-clock budget. A call that
//! overruns, fails or panics yields `DetectionOutcome::not_analysed()`.

pub mod m66;

pub use m66::M66;

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::CloudburstConfig;
use crate::types::{RawAnomaly, Sample};

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("numeric failure: {0}")]
    Numeric(String),
}

/// Which pass of the pipeline a detection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectionStage {
    ShortPeriod,
    LongPeriod,
}

impl std::fmt::Display for DetectionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShortPeriod => write!(f, "short_period"),
            Self::LongPeriod => write!(f, "long_period"),
        }
    }
}

/// Parameters handed to the detector.
#[derive(Debug, Clone, PartialEq)]
pub struct AlgorithmParams {
    pub window: usize,
    pub nth_median: usize,
    pub sigma: f64,
    /// Step of the analysed series (seconds).
    pub resolution: i64,
    /// Percent of expected points that must be present; 0 disables the check.
    pub minimum_sparsity: f64,
    pub determine_duration: bool,
    pub return_anomalies: bool,
    pub max_execution: Duration,
    /// Anomalies older than `now - check_last` are ignored by the caller.
    pub check_last: i64,
}

impl AlgorithmParams {
    /// Parameters for `stage` on a series stepped at `resolution` seconds.
    ///
    /// Short windows widen their lookback and shrink their window as the
    /// native resolution coarsens, so coarse metrics still see enough points.
    pub fn for_stage(stage: DetectionStage, resolution: i64, cfg: &CloudburstConfig) -> Self {
        let algo = &cfg.algorithm;
        let base = Self {
            window: 0,
            nth_median: algo.nth_median,
            sigma: algo.sigma,
            resolution,
            minimum_sparsity: 0.0,
            determine_duration: true,
            return_anomalies: true,
            max_execution: Duration::from_millis(algo.max_execution_ms),
            check_last: 0,
        };
        match stage {
            DetectionStage::ShortPeriod => {
                let short = &cfg.short_period;
                let (window, check_last) = if resolution > 600 {
                    (
                        short.window.saturating_sub(2).max(2),
                        short.check_last_secs + short.very_coarse_extra_secs,
                    )
                } else if resolution > 60 {
                    (
                        short.window.saturating_sub(1).max(2),
                        short.check_last_secs + short.coarse_extra_secs,
                    )
                } else {
                    (short.window, short.check_last_secs)
                };
                Self {
                    window,
                    check_last,
                    minimum_sparsity: short.minimum_sparsity,
                    ..base
                }
            }
            DetectionStage::LongPeriod => {
                let long = &cfg.long_period;
                Self {
                    window: long.effective_window(),
                    check_last: long.check_last(),
                    ..base
                }
            }
        }
    }
}

/// Detector output. `result == None` means "not analysed".
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionOutcome {
    pub result: Option<bool>,
    pub anomaly_score: Option<f64>,
    pub anomalies: Vec<RawAnomaly>,
}

impl DetectionOutcome {
    pub const fn not_analysed() -> Self {
        Self {
            result: None,
            anomaly_score: None,
            anomalies: Vec::new(),
        }
    }

    pub const fn is_analysed(&self) -> bool {
        self.result.is_some()
    }
}

/// A change-point algorithm.
pub trait ChangePointDetector: Send + Sync + 'static {
    fn detect(
        &self,
        series: &[Sample],
        params: &AlgorithmParams,
    ) -> Result<DetectionOutcome, DetectorError>;

    fn name(&self) -> &'static str;
}

/// Run `detector` on the blocking pool, bounded by `params.max_execution`.
///
/// The blocking thread cannot be interrupted; an overrunning call finishes in
/// the background and its result is discarded.
pub async fn run_bounded(
    detector: Arc<dyn ChangePointDetector>,
    series: Vec<Sample>,
    params: AlgorithmParams,
) -> DetectionOutcome {
    let budget = params.max_execution;
    let name = detector.name();
    let handle = tokio::task::spawn_blocking(move || detector.detect(&series, &params));

    match tokio::time::timeout(budget, handle).await {
        Ok(Ok(Ok(outcome))) => outcome,
        Ok(Ok(Err(e))) => {
            warn!(detector = name, error = %e, "Detector failed");
            DetectionOutcome::not_analysed()
        }
        Ok(Err(e)) => {
            warn!(detector = name, error = %e, "Detector task panicked");
            DetectionOutcome::not_analysed()
        }
        Err(_) => {
            warn!(
                detector = name,
                budget_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
                "Detector exceeded execution budget"
            );
            DetectionOutcome::not_analysed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sleepy(Duration);

    impl ChangePointDetector for Sleepy {
        fn detect(&self, _: &[Sample], _: &AlgorithmParams) -> Result<DetectionOutcome, DetectorError> {
            std::thread::sleep(self.0);
            Ok(DetectionOutcome {
                result: Some(false),
                anomaly_score: Some(0.0),
                anomalies: Vec::new(),
            })
        }

        fn name(&self) -> &'static str {
            "sleepy"
        }
    }

    struct Failing;

    impl ChangePointDetector for Failing {
        fn detect(&self, _: &[Sample], _: &AlgorithmParams) -> Result<DetectionOutcome, DetectorError> {
            Err(DetectorError::Numeric("nan".to_string()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn params(budget_ms: u64) -> AlgorithmParams {
        let mut p = AlgorithmParams::for_stage(
            DetectionStage::ShortPeriod,
            60,
            &CloudburstConfig::default(),
        );
        p.max_execution = Duration::from_millis(budget_ms);
        p
    }

    #[test]
    fn test_short_params_scale_with_resolution() {
        let cfg = CloudburstConfig::default();
        let fine = AlgorithmParams::for_stage(DetectionStage::ShortPeriod, 60, &cfg);
        assert_eq!((fine.window, fine.check_last), (5, 14_400));
        assert!((fine.minimum_sparsity - 75.0).abs() < f64::EPSILON);

        let coarse = AlgorithmParams::for_stage(DetectionStage::ShortPeriod, 300, &cfg);
        assert_eq!((coarse.window, coarse.check_last), (4, 16_200));

        let very_coarse = AlgorithmParams::for_stage(DetectionStage::ShortPeriod, 3_600, &cfg);
        assert_eq!((very_coarse.window, very_coarse.check_last), (3, 18_000));
    }

    #[test]
    fn test_long_params_follow_mode() {
        let mut cfg = CloudburstConfig::default();
        cfg.long_period.high_resolution = false;
        let p = AlgorithmParams::for_stage(DetectionStage::LongPeriod, 900, &cfg);
        assert_eq!((p.window, p.check_last, p.resolution), (4, 21_600, 900));
        assert!(p.minimum_sparsity.abs() < f64::EPSILON);
        assert_eq!(p.nth_median, 6);
    }

    #[tokio::test]
    async fn test_overrun_is_not_analysed() {
        let outcome = run_bounded(
            Arc::new(Sleepy(Duration::from_millis(300))),
            vec![Sample::new(0, 1.0)],
            params(20),
        )
        .await;
        assert!(!outcome.is_analysed());
        assert!(outcome.anomalies.is_empty());
    }

    #[tokio::test]
    async fn test_within_budget_passes_through() {
        let outcome = run_bounded(Arc::new(Sleepy(Duration::ZERO)), Vec::new(), params(500)).await;
        assert_eq!(outcome.result, Some(false));
    }

    #[tokio::test]
    async fn test_error_is_not_analysed() {
        let outcome = run_bounded(Arc::new(Failing), Vec::new(), params(500)).await;
        assert_eq!(outcome, DetectionOutcome::not_analysed());
    }
}
