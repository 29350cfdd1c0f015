//! Synthetic metric seeder
//!
//! Populates a data directory with flat, noisy metrics so `cloudburst --once`
//! has something to chew on. Optionally gives one metric a sustained level
//! shift two hours before now, and marks counters for the derivative
//! transform.
//!
//! # Usage
//! ```bash
//! ./seed --data-dir ./data --metrics 50 --shift app.requests.count
//! ./cloudburst --data-dir ./data --once
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use rand::prelude::*;
use rand_distr::{Distribution, Normal};
use std::path::PathBuf;

use cloudburst::catalog::SledCatalog;
use cloudburst::storage::{Database, ProcessLock};
use cloudburst::timeseries::{SledFastCache, SledHistoryStore};
use cloudburst::types::Sample;

/// Baseline level of every seeded metric
const BASELINE: f64 = 10.0;
/// Level after the shift
const SHIFTED: f64 = 500.0;
/// Seconds of history kept in the fast cache
const CACHE_SPAN_SECS: i64 = 6 * 3_600;
/// Shift starts this long before now
const SHIFT_AGE_SECS: i64 = 2 * 3_600;

#[derive(Parser, Debug)]
#[command(name = "cloudburst-seed")]
#[command(about = "Seed a cloudburst data directory with synthetic metrics")]
struct Args {
    /// Data directory to populate
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Number of flat background metrics
    #[arg(long, default_value = "20")]
    metrics: usize,

    /// Native resolution in seconds
    #[arg(long, default_value = "60")]
    resolution: i64,

    /// Days of history to write
    #[arg(long, default_value = "7")]
    days: i64,

    /// Standard deviation of the noise around the baseline
    #[arg(long, default_value = "0.5")]
    noise: f64,

    /// Metric that gets a sustained level shift
    #[arg(long)]
    shift: Option<String>,

    /// Metrics stored as monotonic counters (differentiated before analysis)
    #[arg(long = "counter")]
    counters: Vec<String>,

    /// RNG seed for reproducible data
    #[arg(long, default_value = "42")]
    seed: u64,
}

fn series(
    rng: &mut StdRng,
    noise: &Normal<f64>,
    from: i64,
    until: i64,
    resolution: i64,
    shift_at: Option<i64>,
    counter: bool,
) -> Vec<Sample> {
    let mut total = 0.0;
    (from..=until)
        .step_by(usize::try_from(resolution).unwrap_or(60))
        .map(|ts| {
            let level = match shift_at {
                Some(at) if ts >= at => SHIFTED,
                _ => BASELINE,
            };
            let value = (level + noise.sample(rng)).max(0.0);
            if counter {
                total += value;
                Sample::new(ts, total)
            } else {
                Sample::new(ts, value)
            }
        })
        .collect()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.resolution > 0, "--resolution must be positive");
    let noise = Normal::new(0.0, args.noise.max(0.0)).context("invalid --noise")?;
    let mut rng = StdRng::seed_from_u64(args.seed);

    let _lock = ProcessLock::acquire(&args.data_dir)?;
    let db = Database::open(&args.data_dir)?;
    let catalog = SledCatalog::new(&db)?;
    let cache = SledFastCache::new(&db)?;
    let history = SledHistoryStore::new(&db)?;

    let now = chrono::Utc::now().timestamp();
    let until = now.div_euclid(args.resolution) * args.resolution;
    let from = until - args.days * 86_400;

    let mut names: Vec<String> = (0..args.metrics)
        .map(|i| format!("seed.background.{i:03}"))
        .collect();
    names.extend(args.shift.iter().cloned());
    names.extend(args.counters.iter().cloned());
    names.sort();
    names.dedup();

    for name in &names {
        let counter = args.counters.contains(name);
        let shift_at = (args.shift.as_deref() == Some(name.as_str())).then_some(until - SHIFT_AGE_SECS);
        let samples = series(&mut rng, &noise, from, until, args.resolution, shift_at, counter);
        let recent: Vec<Sample> = samples
            .iter()
            .copied()
            .filter(|s| s.timestamp >= until - CACHE_SPAN_SECS)
            .collect();

        catalog.register(name, Some(args.resolution))?;
        if counter {
            catalog.mark_derivative(name)?;
        }
        cache.put(name, &recent)?;
        history.record(name, &samples)?;
        tracing::info!(
            metric = %name,
            samples = samples.len(),
            shifted = shift_at.is_some(),
            counter,
            "Seeded"
        );
    }

    db.flush()?;
    tracing::info!("✓ Seeded {} metrics into {}", names.len(), args.data_dir.display());
    Ok(())
}
