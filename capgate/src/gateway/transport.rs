//! Transport seam between the admission pipeline and the wire
//!
//! The pipeline decides; the transport moves bytes. The default backend is
//! reqwest; tests substitute a scripted transport.

use async_trait::async_trait;
use http::Method;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// A fully built outbound request, post admission and auth injection
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute URL (base joined with path)
    pub url: String,
    /// Merged headers (endpoint defaults, per-call, auth)
    pub headers: BTreeMap<String, String>,
    /// Query parameters, canonical order
    pub params: BTreeMap<String, String>,
    /// JSON body, when present
    pub body: Option<serde_json::Value>,
    /// Per-attempt timeout
    pub timeout: Duration,
}

/// What came back from the wire
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON body, or the raw text wrapped as a JSON string
    pub body: serde_json::Value,
}

/// Transport-level failure
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// DNS, connect, TLS, or mid-stream failure
    #[error("network error: {0}")]
    Network(String),

    /// The attempt exceeded its timeout
    #[error("transport timeout")]
    Timeout,
}

/// Dispatch backend
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one attempt; retries and timeouts are the pipeline's job
    /// beyond the per-attempt timeout carried on the request
    async fn dispatch(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// reqwest-backed transport
#[cfg(feature = "http-transport")]
pub struct HttpTransport {
    client: reqwest::Client,
}

#[cfg(feature = "http-transport")]
impl HttpTransport {
    /// Create a transport with a default client
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[cfg(feature = "http-transport")]
impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "http-transport")]
#[async_trait]
impl Transport for HttpTransport {
    async fn dispatch(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Network(e.to_string())
            }
        })?;
        let body = serde_json::from_str(&text)
            .unwrap_or_else(|_| serde_json::Value::String(text));

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}
