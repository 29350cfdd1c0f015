//! Shared data structures for the cloudburst pipeline
//!
//! - series: Metric, Sample, RawAnomaly (consumed within one detection pass)
//! - cloudburst: DetectionWindow, CloudburstPeriod, CloudburstRecord, ProcessedMarker
//! - stats: WorkerStats and the per-metric state machine

mod series;
mod cloudburst;
mod stats;

pub use series::*;
pub use cloudburst::*;
pub use stats::*;
