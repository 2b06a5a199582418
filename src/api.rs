//! Admin dashboard order API.
//!
//! [`RemoteOrderApi`] is the seam the reconciler talks through;
//! [`HttpOrderApi`] is the production implementation over reqwest.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::SyncConfig;
use crate::error::RemoteError;

/// Remote order operations, each reporting success or a [`RemoteError`].
#[async_trait]
pub trait RemoteOrderApi: Send + Sync {
    /// Create an order from its full payload. Returns the created resource.
    async fn create_order(&self, payload: &Value, idempotency_key: &str) -> Result<Value, RemoteError>;

    /// Apply a (possibly partial) payload to an existing order.
    async fn update_order(
        &self,
        order_id: &str,
        payload: &Value,
        idempotency_key: &str,
    ) -> Result<Value, RemoteError>;

    async fn delete_order(&self, order_id: &str, idempotency_key: &str) -> Result<(), RemoteError>;

    /// Lightweight reachability check.
    async fn check_health(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the admin dashboard URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_admin_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    // Ensure scheme
    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    // Again, in case "/api/" was present
    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Percent-encode a path segment (order ids are uuids, but stay safe).
fn encode_segment(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly error.
fn friendly_error(url: &str, err: &reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        return RemoteError::Timeout(format!("Connection to {url} timed out"));
    }
    if err.is_connect() {
        return RemoteError::Transport(format!("Cannot reach admin dashboard at {url}"));
    }
    if err.is_builder() {
        return RemoteError::InvalidConfig(format!("Invalid admin dashboard URL: {url}"));
    }
    RemoteError::Transport(format!("Network error communicating with {url}: {err}"))
}

/// Convert an HTTP status code into a user-friendly message.
fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Admin dashboard endpoint not found".to_string(),
        s if s >= 500 => "Admin dashboard server error".to_string(),
        _ => "Unexpected response from admin dashboard".to_string(),
    }
}

/// Prefer the server's own `error` / `message` field when the body is JSON.
fn status_error(status: StatusCode, body_text: &str) -> RemoteError {
    let message = serde_json::from_str::<Value>(body_text)
        .ok()
        .and_then(|json| {
            json.get("error")
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| status_message(status));
    RemoteError::Status {
        status: status.as_u16(),
        message,
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Authenticated client for the admin dashboard order endpoints.
pub struct HttpOrderApi {
    client: Client,
    base_url: String,
    api_key: String,
    terminal_id: String,
    health_timeout: Duration,
}

impl HttpOrderApi {
    pub fn new(config: &SyncConfig) -> Result<Self, RemoteError> {
        if !config.is_configured() {
            return Err(RemoteError::InvalidConfig(
                "admin URL and API key are required".into(),
            ));
        }
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| RemoteError::InvalidConfig(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_admin_url(&config.admin_url),
            api_key: config.api_key.to_string(),
            terminal_id: config.terminal_id.clone(),
            health_timeout: config.health_timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn order_url(&self, order_id: &str) -> String {
        format!("{}/api/pos/orders/{}", self.base_url, encode_segment(order_id))
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        idempotency_key: &str,
        body: Option<&Value>,
    ) -> Result<Value, RemoteError> {
        let mut req = self
            .client
            .request(method.clone(), url)
            .header("X-POS-API-Key", &self.api_key)
            .header("x-terminal-id", &self.terminal_id)
            .header("Idempotency-Key", idempotency_key);
        if let Some(b) = body {
            req = req.json(b);
        }

        let resp = req.send().await.map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            debug!(%method, url, status = status.as_u16(), "Admin dashboard rejected request");
            return Err(status_error(status, &body_text));
        }

        // Empty 204 responses decode to null.
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RemoteOrderApi for HttpOrderApi {
    async fn create_order(&self, payload: &Value, idempotency_key: &str) -> Result<Value, RemoteError> {
        let url = format!("{}/api/pos/orders", self.base_url);
        self.send(Method::POST, &url, idempotency_key, Some(payload))
            .await
    }

    async fn update_order(
        &self,
        order_id: &str,
        payload: &Value,
        idempotency_key: &str,
    ) -> Result<Value, RemoteError> {
        let url = self.order_url(order_id);
        self.send(Method::PATCH, &url, idempotency_key, Some(payload))
            .await
    }

    async fn delete_order(&self, order_id: &str, idempotency_key: &str) -> Result<(), RemoteError> {
        let url = self.order_url(order_id);
        self.send(Method::DELETE, &url, idempotency_key, None)
            .await
            .map(|_| ())
    }

    async fn check_health(&self) -> bool {
        let health_url = format!("{}/api/health", self.base_url);
        match self
            .client
            .head(&health_url)
            .header("X-POS-API-Key", &self.api_key)
            .timeout(self.health_timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Health check failed: {}", friendly_error(&self.base_url, &e));
                false
            }
        }
    }
}

/// Id the dashboard assigned to a created order, if the response carries one.
pub fn extract_remote_id(response: &Value) -> Option<String> {
    response
        .get("order")
        .and_then(|o| o.get("id"))
        .or_else(|| response.get("data").and_then(|d| d.get("id")))
        .or_else(|| response.get("id"))
        .and_then(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}
