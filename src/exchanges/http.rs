//! REST plumbing shared by the concrete gateways

use super::FetchResult;
use crate::config::ExchangeConfig;
use crate::error::{AppError, FetchError, Result};
use parking_lot::Mutex;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::{Duration, Instant};
use url::Url;

/// Spaces requests at least `min_interval` apart.
///
/// Concurrent callers are handed consecutive slots, so a burst of N tasks is
/// spread over N intervals instead of hitting the exchange at once.
#[derive(Debug)]
pub struct RequestThrottle {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Reserve the next slot and return how long to wait for it
    fn reserve(&self) -> Duration {
        let now = Instant::now();
        let mut next = self.next_slot.lock();
        let slot = match *next {
            Some(at) if at > now => at,
            _ => now,
        };
        *next = Some(slot + self.min_interval);
        slot - now
    }

    pub async fn acquire(&self) {
        let wait = self.reserve();
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// HTTP client plus base URL for one exchange
pub struct RestClient {
    client: Client,
    base_url: Url,
    throttle: Option<RequestThrottle>,
    api_key_header: Option<(&'static str, String)>,
}

impl RestClient {
    /// `spacing` is applied only when the exchange config enables rate limiting.
    pub fn new(
        config: &ExchangeConfig,
        default_base: &str,
        spacing: Duration,
        api_key_header: &'static str,
    ) -> Result<Self> {
        let base = config.base_url.as_deref().unwrap_or(default_base);
        let base_url = Url::parse(base)
            .map_err(|e| AppError::Config(format!("Invalid base_url '{}': {}", base, e)))?;

        let client = Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            client,
            base_url,
            throttle: config
                .enable_rate_limit
                .then(|| RequestThrottle::new(spacing)),
            api_key_header: config
                .effective_api_key()
                .map(|key| (api_key_header, key.to_string())),
        })
    }

    /// GET `path` with `query` and decode the JSON body as `T`
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> FetchResult<T> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| FetchError::permanent(format!("bad endpoint {}: {}", path, e)))?;

        if let Some(throttle) = &self.throttle {
            throttle.acquire().await;
        }

        let mut request = self.client.get(url).query(query);
        if let Some((header, key)) = &self.api_key_header {
            request = request.header(*header, key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::from_transport(&e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::from_transport(&e))?;

        if !status.is_success() {
            return Err(FetchError::from_status(status, &body));
        }

        serde_json::from_str(&body)
            .map_err(|e| FetchError::permanent(format!("malformed response from {}: {}", path, e)))
    }
}

/// Numeric JSON value that may be encoded as a string
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Integer JSON value that may be encoded as a string
pub fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Decode one positional `[ts, o, h, l, c, v, ...]` candle
pub fn parse_candle(raw: &[Value]) -> FetchResult<[f64; 6]> {
    if raw.len() < 6 {
        return Err(FetchError::permanent(format!(
            "candle has {} fields, expected at least 6",
            raw.len()
        )));
    }

    let timestamp = value_as_i64(&raw[0])
        .ok_or_else(|| FetchError::permanent(format!("bad candle timestamp: {}", raw[0])))?;

    let mut out = [timestamp as f64, 0.0, 0.0, 0.0, 0.0, 0.0];
    for i in 1..6 {
        // Unparseable numbers become NaN so the validator reports them as nulls
        out[i] = value_as_f64(&raw[i]).unwrap_or(f64::NAN);
    }
    Ok(out)
}
