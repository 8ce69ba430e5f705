use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use common::{CollectionError, ErrorKind, OhlcCollector, OhlcRow};

/// One OHLCV candle as returned by the upstream crypto market-data API.
#[derive(Debug, Deserialize)]
struct UpstreamCandle {
    #[serde(rename = "t")]
    timestamp_ms: i64,
    #[serde(rename = "o")]
    open: f64,
    #[serde(rename = "h")]
    high: f64,
    #[serde(rename = "l")]
    low: f64,
    #[serde(rename = "c")]
    close: f64,
    #[serde(rename = "v")]
    volume: f64,
}

/// Collects OHLC candles for a crypto asset from a REST market-data API.
pub struct CryptoCollector {
    base_url: String,
    api_key: Option<String>,
    http: Client,
}

impl CryptoCollector {
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
impl OhlcCollector for CryptoCollector {
    async fn collect_ohlc(
        &self,
        asset_id: &str,
        since_ms: Option<i64>,
    ) -> Result<Vec<OhlcRow>, CollectionError> {
        let mut url = format!("{}/assets/{}/ohlc", self.base_url, asset_id);
        if let Some(since) = since_ms {
            url.push_str(&format!("?since={since}"));
        }

        let mut req = self.http.get(&url);
        if let Some(key) = &self.api_key {
            req = req.header("X-Api-Key", key);
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

        let candles: Vec<UpstreamCandle> = serde_json::from_str(&body)
            .map_err(|e| CollectionError::new(ErrorKind::Validation, format!("malformed response: {e}")))?;

        let rows: Vec<OhlcRow> = candles
            .into_iter()
            .map(|c| OhlcRow::new(asset_id, c.timestamp_ms, c.open, c.high, c.low, c.close, c.volume))
            .filter(|row| row.is_valid())
            .collect();

        debug!(asset_id, rows = rows.len(), "collected OHLC candles");
        Ok(rows)
    }
}
