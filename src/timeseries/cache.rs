//! Fast cache of recent samples per metric.

use std::sync::Arc;

use super::{codec, FetchError};
use crate::storage::{trees, Database};
use crate::types::Sample;

/// Recent samples for the short window. A missing entry is `Ok(None)`.
pub trait FastCache: Send + Sync {
    fn get_recent(&self, base_name: &str) -> Result<Option<Vec<Sample>>, FetchError>;

    fn backend_name(&self) -> &'static str;
}

/// sled-backed cache holding packed entries in the `fast_cache` tree.
pub struct SledFastCache {
    tree: sled::Tree,
}

impl SledFastCache {
    pub fn new(db: &Database) -> Result<Self, FetchError> {
        Ok(Self {
            tree: db.tree(trees::FAST_CACHE)?,
        })
    }

    pub fn shared(db: &Database) -> Result<Arc<Self>, FetchError> {
        Ok(Arc::new(Self::new(db)?))
    }

    /// Replace a metric's entry.
    pub fn put(&self, base_name: &str, series: &[Sample]) -> Result<(), FetchError> {
        self.tree.insert(base_name, codec::pack(series)?)?;
        Ok(())
    }
}

impl FastCache for SledFastCache {
    fn get_recent(&self, base_name: &str) -> Result<Option<Vec<Sample>>, FetchError> {
        let Some(bytes) = self.tree.get(base_name)? else {
            return Ok(None);
        };
        let mut series = codec::unpack(&bytes)?;
        if series.is_empty() {
            return Ok(None);
        }
        series.sort_by_key(|s| s.timestamp);
        Ok(Some(series))
    }

    fn backend_name(&self) -> &'static str {
        "sled"
    }
}
