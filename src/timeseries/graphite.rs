//! Graphite render API client used as the long-window historical store.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use super::{FetchError, HistoricalStore};
use crate::types::Sample;

/// One series in a `/render?format=json` response.
#[derive(Debug, Deserialize)]
struct RenderSeries {
    target: String,
    /// `[value, timestamp]`, value `null` where no data was stored.
    datapoints: Vec<(Option<f64>, i64)>,
}

/// HTTP client for a Graphite render endpoint.
#[derive(Clone)]
pub struct GraphiteStore {
    http: reqwest::Client,
    base_url: String,
}

impl GraphiteStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Graphite interval string for a bucket size.
    fn interval(secs: i64) -> String {
        if secs % 3_600 == 0 {
            format!("{}h", secs / 3_600)
        } else if secs % 60 == 0 {
            format!("{}min", secs / 60)
        } else {
            format!("{secs}s")
        }
    }

    fn target(base_name: &str, summarize: Option<i64>) -> String {
        match summarize {
            Some(bucket) => format!(
                "summarize({base_name},'{}','median')",
                Self::interval(bucket)
            ),
            None => base_name.to_string(),
        }
    }

    /// Base name behind a returned target, unwrapping `summarize(...)`.
    fn base_name_of(target: &str) -> &str {
        target
            .strip_prefix("summarize(")
            .and_then(|rest| rest.split(',').next())
            .map_or(target, |name| name.trim().trim_matches(|c: char| c == '\'' || c == '"'))
    }

    fn into_samples(series: RenderSeries) -> (String, Vec<Sample>) {
        let name = Self::base_name_of(&series.target).to_string();
        let samples = series
            .datapoints
            .into_iter()
            .filter_map(|(value, ts)| value.map(|v| Sample::new(ts, v)))
            .collect();
        (name, samples)
    }

    fn parse_render(body: &[u8]) -> Result<HashMap<String, Vec<Sample>>, FetchError> {
        let series: Vec<RenderSeries> =
            serde_json::from_slice(body).map_err(|e| FetchError::Decode(e.to_string()))?;
        Ok(series.into_iter().map(Self::into_samples).collect())
    }
}

#[async_trait]
impl HistoricalStore for GraphiteStore {
    async fn get_range(
        &self,
        base_name: &str,
        from: i64,
        until: i64,
        summarize: Option<i64>,
    ) -> Result<Vec<Sample>, FetchError> {
        let names = [base_name.to_string()];
        let mut found = self.get_many(&names, from, until, summarize).await?;
        Ok(found.remove(base_name).unwrap_or_default())
    }

    async fn get_many(
        &self,
        base_names: &[String],
        from: i64,
        until: i64,
        summarize: Option<i64>,
    ) -> Result<HashMap<String, Vec<Sample>>, FetchError> {
        let mut query: Vec<(&str, String)> = vec![
            ("format", "json".to_string()),
            ("from", from.to_string()),
            ("until", until.to_string()),
        ];
        query.extend(
            base_names
                .iter()
                .map(|name| ("target", Self::target(name, summarize))),
        );

        let resp = self
            .http
            .get(format!("{}/render", self.base_url))
            .query(&query)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(FetchError::Status(resp.status().as_u16()));
        }
        let body = resp.bytes().await?;
        let mut found = Self::parse_render(&body)?;
        for name in base_names {
            found.entry(name.clone()).or_default();
        }
        tracing::debug!(targets = base_names.len(), "Graphite render fetched");
        Ok(found)
    }

    fn backend_name(&self) -> &'static str {
        "graphite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_target() {
        assert_eq!(
            GraphiteStore::target("app.cpu", Some(900)),
            "summarize(app.cpu,'15min','median')"
        );
        assert_eq!(GraphiteStore::target("app.cpu", None), "app.cpu");
        assert_eq!(GraphiteStore::interval(7_200), "2h");
        assert_eq!(GraphiteStore::interval(45), "45s");
    }

    #[test]
    fn test_base_name_of_unwraps_summarize() {
        assert_eq!(
            GraphiteStore::base_name_of("summarize(app.cpu, \"15min\", \"median\")"),
            "app.cpu"
        );
        assert_eq!(GraphiteStore::base_name_of("app.cpu"), "app.cpu");
    }

    #[test]
    fn test_parse_render_drops_nulls() {
        let body = br#"[
            {"target": "summarize(a.b, \"15min\", \"median\")",
             "datapoints": [[1.0, 900], [null, 1800], [3.5, 2700]]},
            {"target": "c.d", "datapoints": []}
        ]"#;
        let parsed = GraphiteStore::parse_render(body).unwrap();
        assert_eq!(
            parsed["a.b"],
            vec![Sample::new(900, 1.0), Sample::new(2_700, 3.5)]
        );
        assert!(parsed["c.d"].is_empty());
    }

    #[test]
    fn test_bad_body_is_decode_error() {
        assert!(matches!(
            GraphiteStore::parse_render(b"<html>"),
            Err(FetchError::Decode(_))
        ));
    }
}
