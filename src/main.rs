//! cloudburst - change-point detection over the metric universe
//!
//! Runs the detection cycle every `orchestrator.run_every_secs` seconds
//! until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Seed a local data directory with synthetic metrics, then run one cycle
//! cargo run --bin seed -- --data-dir ./data --metrics 20 --shift app.requests.count
//! cargo run --release -- --once
//!
//! # Run forever against a Graphite render API for the long window
//! CLOUDBURST_GRAPHITE_URL=http://graphite:8080 ./cloudburst
//! ```
//!
//! # Environment Variables
//!
//! - `CLOUDBURST_CONFIG`: path to a TOML config (default: ./cloudburst.toml)
//! - `CLOUDBURST_WORKERS`, `CLOUDBURST_RUN_EVERY_SECS`, `CLOUDBURST_DATA_DIR`,
//!   `CLOUDBURST_GRAPHITE_URL`: override the matching config values
//! - `CLOUDBURST_LOG_FORMAT`: `json` for JSON log lines
//! - `RUST_LOG`: logging level (default: info)
//! - `RESET_DB`: set to "true" to wipe the data directory on startup

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cloudburst::config::{self, CloudburstConfig};
use cloudburst::orchestrator::{state_counts, Orchestrator};
use cloudburst::pipeline::Backends;
use cloudburst::storage::{Database, ProcessLock};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "cloudburst")]
#[command(about = "Two-stage change-point detection over metric time series")]
#[command(version)]
struct CliArgs {
    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Path to a TOML config file (overrides the search order)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Data directory holding the sled database
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Number of parallel workers per cycle
    #[arg(long)]
    workers: Option<usize>,

    /// Wipe the data directory on startup.
    /// WARNING: This is destructive and cannot be undone!
    /// Can also be set via RESET_DB=true environment variable.
    #[arg(long)]
    reset_db: bool,
}

// ============================================================================
// Logging
// ============================================================================

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var("CLOUDBURST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

// ============================================================================
// Configuration
// ============================================================================

fn load_config(args: &CliArgs) -> Result<CloudburstConfig> {
    let mut cfg = match &args.config {
        Some(path) => {
            let mut cfg = CloudburstConfig::load_from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?;
            cfg.apply_env_overrides();
            cfg
        }
        None => CloudburstConfig::load(),
    };

    if let Some(dir) = &args.data_dir {
        cfg.storage.data_dir.clone_from(dir);
    }
    if let Some(workers) = args.workers {
        cfg.orchestrator.workers = workers;
    }
    cfg.validate().context("invalid configuration")?;
    Ok(cfg)
}

// ============================================================================
// Database Reset
// ============================================================================

/// Check if database reset is requested via CLI flag or environment variable.
fn should_reset_db(cli_flag: bool) -> bool {
    if cli_flag {
        return true;
    }
    std::env::var("RESET_DB")
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

/// Runs under the process lock, so `--reset-db` against a directory another
/// instance is using fails at `ProcessLock::acquire` instead of wiping it.
fn reset_data_directory(lock: &ProcessLock, data_dir: &Path) -> Result<()> {
    warn!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    warn!("  RESET_DB DETECTED - WIPING {}", data_dir.display());
    warn!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    let removed = lock
        .clear_data_dir()
        .with_context(|| format!("clearing {}", data_dir.display()))?;
    warn!("  {} entries removed; a fresh database will be created.", removed);
    Ok(())
}

// ============================================================================
// Supervisor
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    Orchestrator,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Orchestrator => write!(f, "Orchestrator"),
        }
    }
}

/// Monitor tasks until shutdown; a failed or panicked task cancels the rest.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("🔒 Supervisor: All tasks spawned, monitoring...");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("🛑 Supervisor: Shutdown signal received");
                break;
            }
            result = task_set.join_next() => match result {
                Some(Ok(Ok(task))) => info!("🔒 Supervisor: Task {} completed normally", task),
                Some(Ok(Err(e))) => {
                    error!("🔒 Supervisor: Task failed: {:#}", e);
                    cancel_token.cancel();
                    return Err(e);
                }
                Some(Err(e)) => {
                    error!("🔒 Supervisor: Task panicked: {}", e);
                    cancel_token.cancel();
                    return Err(anyhow::anyhow!("task panicked: {e}"));
                }
                None => {
                    info!("🔒 Supervisor: All tasks completed");
                    break;
                }
            }
        }
    }

    // Let the orchestrator finish its current sleep step cleanly.
    while let Some(result) = task_set.join_next().await {
        if let Ok(Ok(task)) = result {
            info!("🔒 Supervisor: Task {} stopped", task);
        }
    }
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = CliArgs::parse();

    let cfg = load_config(&args)?;
    let data_dir = cfg.storage.data_dir.clone();

    let lock = ProcessLock::acquire(&data_dir)?;
    if should_reset_db(args.reset_db) {
        reset_data_directory(&lock, &data_dir)?;
    }

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  cloudburst - change-point detection");
    info!(
        "  {} workers | every {}s | data {}",
        cfg.orchestrator.workers,
        cfg.orchestrator.run_every_secs,
        data_dir.display()
    );
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    config::init(cfg);
    let cfg = Arc::new(config::get().clone());

    let db = Database::open(&data_dir).context("opening database")?;
    let backends = Backends::from_database(&db, &cfg)?;
    let orchestrator = Orchestrator::new(cfg, backends);

    if args.once {
        let now = chrono::Utc::now().timestamp();
        let summary = orchestrator.run_cycle(now).await?;
        for (state, count) in state_counts(&summary.reports) {
            info!("  {:<24} {}", state, count);
        }
        info!(
            "✓ Cycle {} complete: {} metrics, {} stragglers, {} killed",
            summary.reference,
            summary.universe,
            summary.stragglers.len(),
            summary.killed
        );
        db.flush()?;
        return Ok(());
    }

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();
    let orch_cancel = cancel_token.clone();
    task_set.spawn(async move {
        info!("[Orchestrator] Task starting");
        orchestrator.run(orch_cancel).await?;
        Ok(TaskName::Orchestrator)
    });

    run_supervisor(&mut task_set, cancel_token).await?;
    db.flush()?;

    info!("✓ cloudburst shutdown complete");
    Ok(())
}
