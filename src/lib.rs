//! cloudburst: two-stage change-point detection over metric time series
//!
//! Finds sustained level shifts ("cloudbursts") in a large metric universe,
//! once per scheduling cycle.
//!
//! ## Architecture
//!
//! - **Orchestrator**: partitions the metric universe across parallel workers
//!   and enforces the cycle budget
//! - **Short-period detection**: recent-window scan for candidate change-points
//! - **Long-period validation**: confirms candidates against a days-long baseline
//! - **Consolidation**: anomalous timestamps → contiguous periods, merged per event
//! - **Deduplication & correlation**: skips known events, attaches pattern
//!   matches and recorded anomalies
//! - **Persistence**: append-only cloudburst store plus processed markers

pub mod catalog;
pub mod config;
pub mod consolidation;
pub mod correlation;
pub mod detector;
pub mod ledger;
pub mod orchestrator;
pub mod pipeline;
pub mod storage;
pub mod timeseries;
pub mod types;

pub use config::CloudburstConfig;
pub use orchestrator::{CycleSummary, Orchestrator};
pub use pipeline::Backends;
pub use types::{CloudburstPeriod, CloudburstRecord, Metric, RawAnomaly, Sample};
