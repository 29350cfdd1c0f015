//! m66 change-point detector
//!
//! Flags sustained level shifts:
//!
//! 1. min-max normalise the series
//! 2. apply a trailing rolling median `nth_median` times
//! 3. take the trailing rolling (population) standard deviation of the result
//! 4. a point triggers when its rolling deviation exceeds `sigma` times the
//!    standard deviation of the whole rolling-deviation series
//! 5. only runs of more than `window / 2` consecutive triggers count
//!
//! Windows that are not yet full (or contain an unfilled value from an
//! earlier pass) produce no value; unfilled deviations count as zero.

use statrs::statistics::{Data, Median, Statistics};

use super::{AlgorithmParams, ChangePointDetector, DetectionOutcome, DetectorError};
use crate::types::{RawAnomaly, Sample};

/// Fewer points than this and the detector declines to analyse.
pub const MIN_POINTS: usize = 10;

#[derive(Debug, Clone, Copy, Default)]
pub struct M66;

impl M66 {
    /// Percent of the expected points (given the resolution and span) that
    /// are present.
    fn sparsity(series: &[Sample], resolution: i64) -> f64 {
        let (Some(first), Some(last)) = (series.first(), series.last()) else {
            return 0.0;
        };
        if resolution <= 0 {
            return 100.0;
        }
        let expected = (last.timestamp - first.timestamp) / resolution + 1;
        if expected <= 0 {
            return 0.0;
        }
        series.len() as f64 * 100.0 / expected as f64
    }

    fn rolling_median(data: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
        (0..data.len())
            .map(|i| {
                if i + 1 < window {
                    return None;
                }
                let values: Option<Vec<f64>> = data[i + 1 - window..=i].iter().copied().collect();
                values.map(|v| Data::new(v).median())
            })
            .collect()
    }

    fn rolling_std(data: &[Option<f64>], window: usize) -> Vec<f64> {
        (0..data.len())
            .map(|i| {
                if i + 1 < window {
                    return 0.0;
                }
                let values: Option<Vec<f64>> = data[i + 1 - window..=i].iter().copied().collect();
                values.map_or(0.0, |v| {
                    let sd = v.iter().population_std_dev();
                    if sd.is_finite() {
                        sd
                    } else {
                        0.0
                    }
                })
            })
            .collect()
    }
}

impl ChangePointDetector for M66 {
    fn detect(
        &self,
        series: &[Sample],
        params: &AlgorithmParams,
    ) -> Result<DetectionOutcome, DetectorError> {
        if params.window < 2 {
            return Err(DetectorError::InvalidInput(format!(
                "window must be >= 2, got {}",
                params.window
            )));
        }

        let mut series = series.to_vec();
        series.sort_by_key(|s| s.timestamp);

        if params.minimum_sparsity > 0.0
            && params.determine_duration
            && Self::sparsity(&series, params.resolution) < params.minimum_sparsity
        {
            return Ok(DetectionOutcome::not_analysed());
        }

        let (min, max) = series
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
                (lo.min(s.value), hi.max(s.value))
            });
        if !series.is_empty() && (max - min).abs() < f64::EPSILON {
            return Ok(DetectionOutcome {
                result: Some(false),
                anomaly_score: Some(0.0),
                anomalies: Vec::new(),
            });
        }
        if series.len() < MIN_POINTS {
            return Ok(DetectionOutcome::not_analysed());
        }
        if !min.is_finite() || !max.is_finite() {
            return Err(DetectorError::Numeric("non-finite sample value".to_string()));
        }

        let mut smoothed: Vec<Option<f64>> = series
            .iter()
            .map(|s| Some((s.value - min) / (max - min)))
            .collect();
        for _ in 0..params.nth_median {
            smoothed = Self::rolling_median(&smoothed, params.window);
        }
        let deviations = Self::rolling_std(&smoothed, params.window);
        let threshold = deviations.iter().population_std_dev() * params.sigma;

        let persistence = params.window / 2;
        let mut anomalies = Vec::new();
        let mut run: Vec<usize> = Vec::new();
        for (i, d) in deviations.iter().enumerate() {
            if *d > threshold {
                run.push(i);
                continue;
            }
            if run.len() > persistence {
                anomalies.extend(run.iter().map(|&idx| RawAnomaly::from(series[idx])));
            }
            run.clear();
        }
        if run.len() > persistence {
            anomalies.extend(run.iter().map(|&idx| RawAnomaly::from(series[idx])));
        }

        let anomalous = !anomalies.is_empty();
        Ok(DetectionOutcome {
            result: Some(anomalous),
            anomaly_score: Some(if anomalous { 1.0 } else { 0.0 }),
            anomalies: if params.return_anomalies {
                anomalies
            } else {
                Vec::new()
            },
        })
    }

    fn name(&self) -> &'static str {
        "m66"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CloudburstConfig;
    use crate::detector::DetectionStage;

    fn params() -> AlgorithmParams {
        AlgorithmParams::for_stage(DetectionStage::ShortPeriod, 60, &CloudburstConfig::default())
    }

    fn series_with_shift(len: usize, shift_at: usize) -> Vec<Sample> {
        (0..len)
            .map(|i| {
                let value = if i >= shift_at { 500.0 } else { 10.0 };
                Sample::new(i as i64 * 60, value)
            })
            .collect()
    }

    #[test]
    fn test_flat_series_is_not_anomalous() {
        let flat: Vec<Sample> = (0..100).map(|i| Sample::new(i * 60, 10.0)).collect();
        let outcome = M66.detect(&flat, &params()).unwrap();
        assert_eq!(outcome.result, Some(false));
        assert_eq!(outcome.anomaly_score, Some(0.0));
    }

    #[test]
    fn test_too_few_points_is_not_analysed() {
        let short = series_with_shift(8, 4);
        assert!(!M66.detect(&short, &params()).unwrap().is_analysed());
    }

    #[test]
    fn test_sparse_series_is_not_analysed() {
        // 20 points spread over 100 slots.
        let sparse: Vec<Sample> = (0..20)
            .map(|i| Sample::new(i * 300, if i > 10 { 50.0 } else { 1.0 }))
            .collect();
        assert!(!M66.detect(&sparse, &params()).unwrap().is_analysed());
    }

    #[test]
    fn test_level_shift_is_detected_after_the_shift() {
        let shift_at = 200;
        let series = series_with_shift(300, shift_at);
        let outcome = M66.detect(&series, &params()).unwrap();
        assert_eq!(outcome.result, Some(true));
        assert_eq!(outcome.anomaly_score, Some(1.0));
        assert!(!outcome.anomalies.is_empty());

        let shift_ts = shift_at as i64 * 60;
        let p = params();
        let lag = ((p.nth_median + 2) * p.window) as i64 * 60;
        for a in &outcome.anomalies {
            assert!(a.timestamp >= shift_ts, "anomaly at {} precedes shift", a.timestamp);
            assert!(a.timestamp <= shift_ts + lag, "anomaly at {} too late", a.timestamp);
        }
    }

    #[test]
    fn test_window_too_small_is_rejected() {
        let mut p = params();
        p.window = 1;
        assert!(matches!(
            M66.detect(&series_with_shift(50, 25), &p),
            Err(DetectorError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_rolling_median_leaves_unfilled_prefix() {
        let data: Vec<Option<f64>> = [1.0, 5.0, 2.0, 8.0].iter().copied().map(Some).collect();
        let out = M66::rolling_median(&data, 3);
        assert_eq!(out, vec![None, None, Some(2.0), Some(5.0)]);
    }
}
