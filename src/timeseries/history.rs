//! Historical store for the long window.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::{summarize_median, FetchError};
use crate::storage::{trees, Database};
use crate::types::Sample;

/// Ranged access to long history, optionally median-summarized into buckets
/// of `summarize` seconds.
#[async_trait]
pub trait HistoricalStore: Send + Sync {
    async fn get_range(
        &self,
        base_name: &str,
        from: i64,
        until: i64,
        summarize: Option<i64>,
    ) -> Result<Vec<Sample>, FetchError>;

    /// Fetch several metrics at once. Backends that can batch override this.
    async fn get_many(
        &self,
        base_names: &[String],
        from: i64,
        until: i64,
        summarize: Option<i64>,
    ) -> Result<HashMap<String, Vec<Sample>>, FetchError> {
        let mut out = HashMap::with_capacity(base_names.len());
        for name in base_names {
            let series = self.get_range(name, from, until, summarize).await?;
            out.insert(name.clone(), series);
        }
        Ok(out)
    }

    fn backend_name(&self) -> &'static str;
}

/// sled-backed store; keys are `base_name || 0x00 || timestamp`.
pub struct SledHistoryStore {
    tree: sled::Tree,
}

impl SledHistoryStore {
    pub fn new(db: &Database) -> Result<Self, FetchError> {
        Ok(Self {
            tree: db.tree(trees::SAMPLES)?,
        })
    }

    pub fn shared(db: &Database) -> Result<Arc<Self>, FetchError> {
        Ok(Arc::new(Self::new(db)?))
    }

    fn key(base_name: &str, timestamp: i64) -> Vec<u8> {
        let mut key = Vec::with_capacity(base_name.len() + 9);
        key.extend_from_slice(base_name.as_bytes());
        key.push(0);
        key.extend_from_slice(&timestamp.to_be_bytes());
        key
    }

    /// Store samples, overwriting any existing value at the same timestamp.
    pub fn record(&self, base_name: &str, series: &[Sample]) -> Result<(), FetchError> {
        let mut batch = sled::Batch::default();
        for s in series {
            batch.insert(Self::key(base_name, s.timestamp), s.value.to_be_bytes().to_vec());
        }
        self.tree.apply_batch(batch)?;
        Ok(())
    }

    fn scan(&self, base_name: &str, from: i64, until: i64) -> Result<Vec<Sample>, FetchError> {
        let start = Self::key(base_name, from);
        let end = Self::key(base_name, until);
        let prefix_len = base_name.len() + 1;
        let mut out = Vec::new();
        for item in self.tree.range(start..=end) {
            let (key, value) = item?;
            let ts = key
                .get(prefix_len..)
                .and_then(|b| <[u8; 8]>::try_from(b).ok())
                .map(i64::from_be_bytes);
            let v = <[u8; 8]>::try_from(value.as_ref())
                .ok()
                .map(f64::from_be_bytes);
            if let (Some(ts), Some(v)) = (ts, v) {
                out.push(Sample::new(ts, v));
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl HistoricalStore for SledHistoryStore {
    async fn get_range(
        &self,
        base_name: &str,
        from: i64,
        until: i64,
        summarize: Option<i64>,
    ) -> Result<Vec<Sample>, FetchError> {
        let series = self.scan(base_name, from, until)?;
        Ok(match summarize {
            Some(bucket) => summarize_median(&series, bucket),
            None => series,
        })
    }

    fn backend_name(&self) -> &'static str {
        "sled"
    }
}
