use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use common::{CollectionError, ErrorKind, MacroRow};

#[derive(Debug, Deserialize)]
struct UpstreamObservation {
    date: String,
    value: Option<f64>,
}

/// Collects daily macro-indicator observations (e.g. CPI, Fed funds rate)
/// from a FRED-shaped REST API. Missing observations are preserved as
/// `value: None` rather than interpolated here — interpolation and
/// forward-fill are the strategy layer's concern, not the collector's.
pub struct MacroCollector {
    base_url: String,
    api_key: Option<String>,
    http: Client,
}

impl MacroCollector {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            http: Client::builder()
                .use_rustls_tls()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build HTTP client"),
        }
    }

    fn map_status(status: StatusCode, body: &str) -> CollectionError {
        if status == StatusCode::TOO_MANY_REQUESTS {
            return CollectionError::new(ErrorKind::RateLimit, format!("HTTP 429: {body}"));
        }
        if status.is_server_error() {
            return CollectionError::new(ErrorKind::ServerError, format!("HTTP {status}: {body}"));
        }
        CollectionError::new(ErrorKind::ClientError, format!("HTTP {status}: {body}"))
    }

    fn parse_retry_after(value: &str) -> Option<Duration> {
        value.trim().parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[async_trait]
impl common::MacroCollector for MacroCollector {
    async fn collect_macro(
        &self,
        indicator_id: &str,
        since: Option<NaiveDate>,
    ) -> Result<Vec<MacroRow>, CollectionError> {
        let mut url = format!("{}/series/observations/{}", self.base_url, indicator_id);
        if let Some(since) = since {
            url.push_str(&format!("?observation_start={since}"));
        }

        let mut req = self.http.get(&url);
        if let Some(key) = &self.api_key {
            req = req.query(&[("api_key", key.as_str())]);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                CollectionError::new(ErrorKind::Network, e.to_string())
            } else {
                CollectionError::new(ErrorKind::Unexpected, e.to_string())
            }
        })?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::parse_retry_after);

        let body = resp
            .text()
            .await
            .map_err(|e| CollectionError::new(ErrorKind::Network, e.to_string()))?;

        if !status.is_success() {
            let mut err = Self::map_status(status, &body);
            if let Some(retry_after) = retry_after {
                err = err.with_retry_after(retry_after);
            }
            return Err(err);
        }

        let observations: Vec<UpstreamObservation> = serde_json::from_str(&body)
            .map_err(|e| CollectionError::new(ErrorKind::Validation, format!("malformed response: {e}")))?;

        let mut rows = Vec::with_capacity(observations.len());
        for obs in observations {
            let date = NaiveDate::parse_from_str(&obs.date, "%Y-%m-%d").map_err(|e| {
                CollectionError::new(ErrorKind::Validation, format!("bad observation date {}: {e}", obs.date))
            })?;
            rows.push(MacroRow {
                indicator_id: indicator_id.to_string(),
                date,
                value: obs.value,
                is_interpolated: false,
                is_forward_filled: false,
            });
        }

        debug!(indicator_id, rows = rows.len(), "collected macro observations");
        Ok(rows)
    }
}
