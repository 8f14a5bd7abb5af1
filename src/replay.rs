use crate::error::ReplayError;
use crate::types::Delivery;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde::Serialize;
use std::time::{Duration, Instant};

const RESPONSE_EXCERPT_CHARS: usize = 1000;
const HOP_BY_HOP: [&str; 4] = ["host", "content-length", "connection", "transfer-encoding"];

/// Result of re-sending a stored delivery.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayOutcome {
    pub original_webhook_id: String,
    pub target_url: String,
    pub status: u16,
    pub processing_time_ms: u64,
    /// First 1000 characters of the target's response body.
    pub response: String,
    pub headers: serde_json::Map<String, serde_json::Value>,
}

/// Re-sends stored deliveries to an arbitrary target. The stored record is
/// only read.
pub struct Replayer {
    client: reqwest::Client,
    timeout: Duration,
}

impl Replayer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    pub async fn replay(&self, delivery: &Delivery, target_url: &str) -> Result<ReplayOutcome, ReplayError> {
        let url = reqwest::Url::parse(target_url)
            .map_err(|e| ReplayError::InvalidTarget(format!("{target_url}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ReplayError::InvalidTarget(format!(
                "{target_url}: unsupported scheme `{}`",
                url.scheme()
            )));
        }

        let headers = replay_headers(delivery);
        let start = Instant::now();

        tracing::info!(
            webhook_id = %delivery.id,
            delivery_id = %delivery.delivery_id,
            target = %url,
            "replaying delivery"
        );

        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .headers(headers)
            .body(delivery.raw_body())
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status().as_u16();
        let response_headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), serde_json::Value::String(v.to_string())))
            })
            .collect();
        let body = response.text().await.map_err(|e| self.classify(e))?;
        let elapsed = start.elapsed().as_millis() as u64;

        tracing::info!(webhook_id = %delivery.id, status, elapsed_ms = elapsed, "replay finished");

        Ok(ReplayOutcome {
            original_webhook_id: delivery.id.clone(),
            target_url: target_url.to_string(),
            status,
            processing_time_ms: elapsed,
            response: body.chars().take(RESPONSE_EXCERPT_CHARS).collect(),
            headers: response_headers,
        })
    }

    fn classify(&self, err: reqwest::Error) -> ReplayError {
        if err.is_timeout() {
            ReplayError::Timeout(self.timeout.as_secs())
        } else if err.is_builder() {
            ReplayError::InvalidTarget(err.to_string())
        } else {
            ReplayError::TargetUnreachable(err.to_string())
        }
    }
}

/// Stored headers minus hop-by-hop ones, plus replay markers.
fn replay_headers(delivery: &Delivery) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &delivery.headers {
        if HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value))
        else {
            continue;
        };
        headers.append(name, value);
    }

    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    headers.insert("x-webhook-replay", HeaderValue::from_static("true"));
    if let Ok(v) = HeaderValue::from_str(&delivery.id) {
        headers.insert("x-original-webhook-id", v);
    }
    if let Ok(v) = HeaderValue::from_str(&delivery.delivery_id) {
        headers.insert("x-original-delivery-id", v);
    }
    headers
}
