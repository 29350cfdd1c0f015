//! Cloudburst Configuration Module
//!
//! Pipeline tunables loaded from TOML, replacing hardcoded cycle lengths,
//! lookbacks and detector parameters with operator-tunable values.
//!
//! ## Loading Order
//!
//! 1. `CLOUDBURST_CONFIG` environment variable (path to TOML file)
//! 2. `cloudburst.toml` in the current working directory
//! 3. Built-in defaults
//!
//! `CLOUDBURST_*` environment overrides are applied last.
//!
//! ## Usage
//!
//! The binary calls `config::init()` once at startup. Pipeline components take
//! an `Arc<CloudburstConfig>` so tests can run side by side with different
//! settings:
//!
//! ```ignore
//! config::init(CloudburstConfig::load());
//! let cfg = Arc::new(config::get().clone());
//! ```

mod settings;
mod validation;
pub mod defaults;

pub use settings::*;
pub use validation::{validate_unknown_keys, ValidationWarning};

use std::sync::OnceLock;

/// Global configuration, initialized once at startup.
static CLOUDBURST_CONFIG: OnceLock<CloudburstConfig> = OnceLock::new();

/// Initialize the global configuration. Later calls are ignored.
pub fn init(config: CloudburstConfig) {
    if CLOUDBURST_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once, ignoring");
    }
}

/// Get the global configuration, or the built-in defaults when `init()` has
/// not run yet.
pub fn get() -> &'static CloudburstConfig {
    CLOUDBURST_CONFIG.get_or_init(CloudburstConfig::default)
}
