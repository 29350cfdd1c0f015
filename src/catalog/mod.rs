//! Metric Catalog
//!
//! Resolves metric base names to their stable id and native resolution, and
//! answers whether a metric is a monotonic counter. Read-only for the
//! pipeline; `register`/`mark_derivative` exist for whoever feeds the catalog
//! (the seed tool and tests).

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::storage::{trees, Database, StorageError};

/// Catalog lookups. Absence is `Ok(None)`, never an error.
pub trait MetricCatalog: Send + Sync {
    fn resolve(&self, base_name: &str) -> Result<Option<u64>, StorageError>;

    /// Native sampling interval (seconds).
    fn resolution(&self, base_name: &str) -> Result<Option<i64>, StorageError>;

    /// Every known base name, in catalog order.
    fn all_metrics(&self) -> Result<Vec<String>, StorageError>;

    /// Whether the metric is a known monotonic counter.
    fn is_derivative(&self, base_name: &str) -> Result<bool, StorageError>;

    fn backend_name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct CatalogEntry {
    id: u64,
    resolution: Option<i64>,
}

/// sled-backed catalog.
pub struct SledCatalog {
    db: Database,
    metrics: sled::Tree,
    derivative: sled::Tree,
}

impl SledCatalog {
    pub fn new(db: &Database) -> Result<Self, StorageError> {
        Ok(Self {
            db: db.clone(),
            metrics: db.tree(trees::METRICS)?,
            derivative: db.tree(trees::DERIVATIVE_METRICS)?,
        })
    }

    pub fn shared(db: &Database) -> Result<Arc<Self>, StorageError> {
        Ok(Arc::new(Self::new(db)?))
    }

    fn entry(&self, base_name: &str) -> Result<Option<CatalogEntry>, StorageError> {
        self.metrics
            .get(base_name)?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(StorageError::from))
            .transpose()
    }

    /// Add a metric (or update its resolution), returning its id. Ids are
    /// stable across re-registration.
    pub fn register(&self, base_name: &str, resolution: Option<i64>) -> Result<u64, StorageError> {
        let id = match self.entry(base_name)? {
            Some(existing) => existing.id,
            None => self.db.next_id()?,
        };
        let entry = CatalogEntry { id, resolution };
        self.metrics.insert(base_name, serde_json::to_vec(&entry)?)?;
        Ok(id)
    }

    pub fn mark_derivative(&self, base_name: &str) -> Result<(), StorageError> {
        self.derivative.insert(base_name, Vec::<u8>::new())?;
        Ok(())
    }
}

impl MetricCatalog for SledCatalog {
    fn resolve(&self, base_name: &str) -> Result<Option<u64>, StorageError> {
        Ok(self.entry(base_name)?.map(|e| e.id))
    }

    fn resolution(&self, base_name: &str) -> Result<Option<i64>, StorageError> {
        Ok(self
            .entry(base_name)?
            .and_then(|e| e.resolution)
            .filter(|r| *r > 0))
    }

    fn all_metrics(&self) -> Result<Vec<String>, StorageError> {
        self.metrics
            .iter()
            .keys()
            .map(|k| Ok(String::from_utf8_lossy(&k?).into_owned()))
            .collect()
    }

    fn is_derivative(&self, base_name: &str) -> Result<bool, StorageError> {
        Ok(self.derivative.contains_key(base_name)?)
    }

    fn backend_name(&self) -> &'static str {
        "sled"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> SledCatalog {
        SledCatalog::new(&Database::open_temporary().unwrap()).unwrap()
    }

    #[test]
    fn test_register_and_resolve() {
        let catalog = catalog();
        let id = catalog.register("app.requests.count", Some(60)).unwrap();
        assert_eq!(catalog.resolve("app.requests.count").unwrap(), Some(id));
        assert_eq!(catalog.resolution("app.requests.count").unwrap(), Some(60));
        assert_eq!(catalog.resolve("missing").unwrap(), None);
    }

    #[test]
    fn test_reregister_keeps_id() {
        let catalog = catalog();
        let id = catalog.register("m", Some(60)).unwrap();
        let again = catalog.register("m", Some(600)).unwrap();
        assert_eq!(id, again);
        assert_eq!(catalog.resolution("m").unwrap(), Some(600));
    }

    #[test]
    fn test_missing_or_zero_resolution_is_absent() {
        let catalog = catalog();
        catalog.register("no.res", None).unwrap();
        catalog.register("zero.res", Some(0)).unwrap();
        assert_eq!(catalog.resolution("no.res").unwrap(), None);
        assert_eq!(catalog.resolution("zero.res").unwrap(), None);
    }

    #[test]
    fn test_all_metrics_and_derivative_set() {
        let catalog = catalog();
        catalog.register("b.metric", Some(60)).unwrap();
        catalog.register("a.metric", Some(60)).unwrap();
        catalog.mark_derivative("a.metric").unwrap();
        assert_eq!(catalog.all_metrics().unwrap(), vec!["a.metric", "b.metric"]);
        assert!(catalog.is_derivative("a.metric").unwrap());
        assert!(!catalog.is_derivative("b.metric").unwrap());
    }
}
