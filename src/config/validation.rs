//! Unknown-key detection for cloudburst TOML files.
//!
//! The raw TOML is walked before serde sees it; every dotted key that is not a
//! field of `CloudburstConfig` produces a warning with a "did you mean?"
//! suggestion. Warnings never reject a file.

use std::collections::HashSet;

/// A non-fatal config warning.
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Unknown config key '{}'", self.field)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " (did you mean '{s}'?)")?;
        }
        Ok(())
    }
}

// ============================================================================
// Known Config Keys
// ============================================================================

/// (section, fields) pairs mirroring the structs in `settings.rs`.
const SECTIONS: &[(&str, &[&str])] = &[
    (
        "orchestrator",
        &["workers", "run_every_secs", "kill_margin_secs", "heartbeat_ttl_secs"],
    ),
    (
        "short_period",
        &[
            "check_last_secs",
            "window",
            "coarse_extra_secs",
            "very_coarse_extra_secs",
            "min_samples",
            "minimum_sparsity",
        ],
    ),
    (
        "long_period",
        &[
            "full_duration_secs",
            "check_last_secs",
            "window",
            "high_resolution",
            "high_res_window",
            "high_res_check_last_secs",
            "summarize_secs",
            "batch_size",
        ],
    ),
    ("algorithm", &["nth_median", "sigma", "max_execution_ms"]),
    (
        "ledger",
        &[
            "cycle_progress_ttl_secs",
            "not_processed_ttl_secs",
            "continuation_ttl_secs",
        ],
    ),
    ("derivative", &["non_derivative_monotonic_metrics"]),
    ("storage", &["data_dir", "graphite_url", "graphite_timeout_secs"]),
    ("families", &["cloudburst_enabled"]),
];

/// Every valid dotted key path, sections included.
pub fn known_config_keys() -> HashSet<String> {
    SECTIONS
        .iter()
        .flat_map(|(section, fields)| {
            std::iter::once((*section).to_string())
                .chain(fields.iter().map(move |f| format!("{section}.{f}")))
        })
        .collect()
}

/// Collect dotted key paths from a TOML tree (`{ a = { b = 1 } }` yields
/// `["a", "a.b"]`).
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let Some(table) = value.as_table() else {
        return Vec::new();
    };
    let mut keys = Vec::with_capacity(table.len());
    for (k, v) in table {
        let path = if prefix.is_empty() {
            k.clone()
        } else {
            format!("{prefix}.{k}")
        };
        if v.is_table() {
            let nested = walk_toml_keys(v, &path);
            keys.push(path);
            keys.extend(nested);
        } else {
            keys.push(path);
        }
    }
    keys
}

/// Edit distance between two keys.
fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let above = row[j + 1];
            let substitution = diagonal + usize::from(ca != *cb);
            row[j + 1] = substitution.min(above + 1).min(row[j] + 1);
            diagonal = above;
        }
    }
    row[b.len()]
}

/// Closest known key within three edits.
pub fn suggest_correction(unknown: &str, known: &HashSet<String>) -> Option<String> {
    known
        .iter()
        .map(|k| (k, edit_distance(unknown, k)))
        .filter(|(_, d)| *d <= 3)
        .min_by(|(ka, da), (kb, db)| da.cmp(db).then_with(|| ka.cmp(kb)))
        .map(|(k, _)| k.clone())
}

/// Warnings for every unknown key in `raw_toml`. Parse errors are left to serde.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    let Ok(value) = raw_toml.parse::<toml::Value>() else {
        return Vec::new();
    };
    let known = known_config_keys();
    walk_toml_keys(&value, "")
        .into_iter()
        .filter(|key| !known.contains(key))
        .map(|field| ValidationWarning {
            suggestion: suggest_correction(&field, &known),
            field,
        })
        .collect()
}
