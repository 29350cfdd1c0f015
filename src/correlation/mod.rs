//! Correlation Resolver
//!
//! For a metric and a period, finds whatever else was recorded during it:
//!
//! - a pattern match from one of the match tables (feature-profile matches
//!   first, then layer matches), giving `match_id`, `fp_id` and `layer_id`
//! - an independently recorded anomaly, giving `anomaly_id`
//!
//! The search window is `[start - resolution, end + resolution]`. The first
//! hit of each kind wins; nothing found leaves the field at 0. A failing
//! lookup is logged and treated as nothing found.

pub mod tables;

pub use tables::{SledAnomalyTable, SledMatchTable};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::storage::StorageError;
use crate::types::{CloudburstPeriod, Correlations};

/// The independently populated pattern-match sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchKind {
    /// Features-profile match; carries no layer.
    FeatureProfile,
    /// Layers match; carries the layer it matched on.
    Layer,
}

impl std::fmt::Display for MatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FeatureProfile => write!(f, "fp"),
            Self::Layer => write!(f, "layer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub match_id: u64,
    pub fp_id: u64,
    pub layer_id: Option<u64>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyHit {
    pub anomaly_id: u64,
    pub timestamp: i64,
}

/// A pattern-match source. Window bounds are inclusive.
pub trait MatchTable: Send + Sync {
    fn kind(&self) -> MatchKind;

    fn find_in_window(
        &self,
        metric_id: u64,
        start: i64,
        end: i64,
    ) -> Result<Option<PatternMatch>, StorageError>;
}

/// Independently recorded anomalies. Window bounds are inclusive.
pub trait AnomalyLedger: Send + Sync {
    fn find_in_window(
        &self,
        metric_id: u64,
        start: i64,
        end: i64,
    ) -> Result<Option<AnomalyHit>, StorageError>;
}

#[derive(Clone)]
pub struct CorrelationResolver {
    matches: Vec<Arc<dyn MatchTable>>,
    anomalies: Arc<dyn AnomalyLedger>,
}

impl CorrelationResolver {
    /// `matches` are consulted in order.
    pub fn new(matches: Vec<Arc<dyn MatchTable>>, anomalies: Arc<dyn AnomalyLedger>) -> Self {
        Self { matches, anomalies }
    }

    pub fn resolve(&self, metric_id: u64, period: &CloudburstPeriod) -> Correlations {
        let start = period.start - period.resolution;
        let end = period.end + period.resolution;
        let mut found = Correlations::default();

        for table in &self.matches {
            match table.find_in_window(metric_id, start, end) {
                Ok(Some(m)) => {
                    found.match_id = m.match_id;
                    found.fp_id = m.fp_id;
                    found.layer_id = m.layer_id.unwrap_or(0);
                    break;
                }
                Ok(None) => {}
                Err(e) => warn!(
                    metric_id,
                    kind = %table.kind(),
                    error = %e,
                    "Match lookup failed, treating as no match"
                ),
            }
        }

        match self.anomalies.find_in_window(metric_id, start, end) {
            Ok(Some(hit)) => found.anomaly_id = hit.anomaly_id,
            Ok(None) => {}
            Err(e) => warn!(
                metric_id,
                error = %e,
                "Anomaly lookup failed, treating as no anomaly"
            ),
        }

        found
    }
}
