//! Endpoint catalog types
//!
//! Every external target the gateway can call is an endpoint; there is no
//! per-service hierarchy. Per-endpoint circuit, rate, and cache state is
//! created lazily on first contact and collected when the endpoint drains
//! out of the catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::vault::CredentialHandle;

/// Smoothing factor for the latency EWMA
const EWMA_ALPHA: f64 = 0.2;

/// Opaque endpoint identity, assigned at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointId(Uuid);

impl EndpointId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Protocol family of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    /// Plain HTTP/REST
    #[default]
    Rest,
    /// GraphQL over HTTP
    Graphql,
    /// gRPC
    Grpc,
    /// WebSocket
    Websocket,
    /// Generic RPC
    Rpc,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rest => write!(f, "rest"),
            Self::Graphql => write!(f, "graphql"),
            Self::Grpc => write!(f, "grpc"),
            Self::Websocket => write!(f, "websocket"),
            Self::Rpc => write!(f, "rpc"),
        }
    }
}

/// How the gateway authenticates against an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthScheme {
    /// `Authorization: Bearer <value>`
    Bearer,
    /// `<header>: <value>`
    ApiKey {
        /// Header carrying the key
        #[serde(default = "default_api_key_header")]
        header: String,
    },
}

pub(crate) fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

/// An auth scheme bound (or awaiting binding) to a vault credential
///
/// Imported catalogs restore the scheme but not the binding; `update_auth`
/// re-binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAuth {
    /// How the credential is injected
    pub scheme: AuthScheme,
    /// Sealed credential to inject; `None` until bound
    pub credential: Option<CredentialHandle>,
}

impl EndpointAuth {
    /// Bearer auth bound to a sealed credential
    pub fn bearer(credential: CredentialHandle) -> Self {
        Self {
            scheme: AuthScheme::Bearer,
            credential: Some(credential),
        }
    }

    /// API-key auth bound to a sealed credential, default header
    pub fn api_key(credential: CredentialHandle) -> Self {
        Self {
            scheme: AuthScheme::ApiKey {
                header: default_api_key_header(),
            },
            credential: Some(credential),
        }
    }

    /// API-key auth with an explicit header name
    pub fn api_key_header(credential: CredentialHandle, header: impl Into<String>) -> Self {
        Self {
            scheme: AuthScheme::ApiKey {
                header: header.into(),
            },
            credential: Some(credential),
        }
    }
}

/// Registration options for a new endpoint
#[derive(Debug, Clone, Default)]
pub struct EndpointSpec {
    /// Protocol family (defaults to REST)
    pub kind: EndpointKind,
    /// Auth binding, if the endpoint needs one
    pub auth: Option<EndpointAuth>,
    /// Headers sent on every request; per-call headers win on conflict
    pub headers: BTreeMap<String, String>,
    /// Per-request timeout in milliseconds (default 30 000)
    pub timeout_ms: Option<u64>,
    /// Retries for idempotent transient failures (default 2)
    pub retry_budget: Option<u32>,
    /// Feature gating this endpoint, if any; when the feature rotates out
    /// the endpoint is disabled
    pub feature: Option<String>,
}

impl EndpointSpec {
    /// Spec with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the protocol family
    pub fn kind(mut self, kind: EndpointKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the auth binding
    pub fn auth(mut self, auth: EndpointAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Add a default header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the request timeout in milliseconds
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Set the retry budget
    pub fn retry_budget(mut self, retries: u32) -> Self {
        self.retry_budget = Some(retries);
        self
    }

    /// Gate the endpoint on a feature id
    pub fn feature(mut self, feature: impl Into<String>) -> Self {
        self.feature = Some(feature.into());
        self
    }
}

/// A registered endpoint
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Opaque identity
    pub id: EndpointId,
    /// Unique human name
    pub name: String,
    /// Base URL the path is joined onto
    pub base_url: String,
    /// Protocol family
    pub kind: EndpointKind,
    /// Auth binding
    pub auth: Option<EndpointAuth>,
    /// Headers sent on every request
    pub default_headers: BTreeMap<String, String>,
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
    /// Retries for idempotent transient failures
    pub retry_budget: u32,
    /// Whether requests are admitted
    pub enabled: bool,
    /// Feature gating this endpoint, if any
    pub feature: Option<String>,
}

/// Observational per-endpoint counters; they inform operators, not
/// admission
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointStats {
    /// Dispatched requests (cache hits excluded)
    pub requests: u64,
    /// Successful completions
    pub successes: u64,
    /// Failed completions (cancellations excluded)
    pub failures: u64,
    /// Exponentially weighted moving average latency, milliseconds
    pub ewma_latency_ms: f64,
    /// When the endpoint was last dispatched to
    pub last_request: Option<DateTime<Utc>>,
}

impl EndpointStats {
    pub(crate) fn record_dispatch(&mut self) {
        self.requests += 1;
        self.last_request = Some(Utc::now());
    }

    pub(crate) fn record_success(&mut self, latency_ms: u64) {
        self.successes += 1;
        self.fold_latency(latency_ms);
    }

    pub(crate) fn record_failure(&mut self, latency_ms: u64) {
        self.failures += 1;
        self.fold_latency(latency_ms);
    }

    fn fold_latency(&mut self, latency_ms: u64) {
        let sample = latency_ms as f64;
        if self.successes + self.failures <= 1 {
            self.ewma_latency_ms = sample;
        } else {
            self.ewma_latency_ms = EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * self.ewma_latency_ms;
        }
    }
}
