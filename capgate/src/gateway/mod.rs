//! API gateway — governed request admission
//!
//! Every external call runs the same pipeline: endpoint lookup and
//! enablement, circuit check, rate check, cache lookup for idempotent
//! reads, auth injection from the vault, interceptors, then dispatch with
//! timeout and budgeted retries. Admission decisions are synchronous; the
//! pipeline only suspends at dispatch, retry backoff, and queue waits.

pub mod cache;
pub mod circuit;
pub mod endpoint;
pub mod interceptor;
pub mod queue;
pub mod rate_limit;
pub mod transport;

pub use cache::{CacheKey, CacheStats, ResponseCache};
pub use circuit::{CircuitBreaker, CircuitPass, CircuitState, CircuitStatus, CircuitTransition};
pub use endpoint::{
    AuthScheme, Endpoint, EndpointAuth, EndpointId, EndpointKind, EndpointSpec, EndpointStats,
};
pub use interceptor::{InterceptorId, Interceptors, RequestFlow};
pub use queue::{Priority, RequestQueue};
pub use rate_limit::{RateLimiter, RateStatus};
pub use transport::{Transport, TransportError, TransportRequest, TransportResponse};

#[cfg(feature = "http-transport")]
pub use transport::HttpTransport;

use dashmap::DashMap;
use http::Method;
use secrecy::ExposeSecret;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditKind, AuditLog};
use crate::config::{CacheConfig, CircuitBreakerConfig, Config, RateLimiterConfig};
use crate::error::{GatewayError, VaultError};
use crate::vault::CredentialVault;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RETRY_BUDGET: u32 = 2;
const RETRY_BASE_MS: u64 = 100;
const RETRY_CAP_MS: u64 = 2_000;

/// Per-call options for [`Gateway::request`]
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// HTTP method (default GET)
    pub method: Method,
    /// Per-call headers; win over endpoint defaults
    pub headers: BTreeMap<String, String>,
    /// Query parameters
    pub params: BTreeMap<String, String>,
    /// JSON body
    pub body: Option<serde_json::Value>,
    /// Whether GET responses may be served from / stored in the cache
    pub cache: bool,
    /// Queue priority (queued path only)
    pub priority: Priority,
    /// Overrides the method-derived idempotency judgement
    pub idempotent: Option<bool>,
    /// Caller-held cancellation token
    pub cancel: Option<CancellationToken>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: BTreeMap::new(),
            params: BTreeMap::new(),
            body: None,
            cache: true,
            priority: Priority::Normal,
            idempotent: None,
            cancel: None,
        }
    }
}

impl RequestOptions {
    /// Options with defaults (GET, cacheable, normal priority)
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the method
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add a query parameter
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Set the JSON body
    pub fn body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Opt out of the response cache
    pub fn no_cache(mut self) -> Self {
        self.cache = false;
        self
    }

    /// Set the queue priority
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Force the idempotency judgement
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = Some(idempotent);
        self
    }

    /// Attach a cancellation token
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Outcome of an admitted request
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    /// HTTP status (200 for cache hits and short circuits)
    pub status: u16,
    /// Response body
    pub data: serde_json::Value,
    /// Whether the response came from the cache
    pub cached: bool,
    /// End-to-end latency in milliseconds (0 for cache hits)
    pub latency_ms: u64,
}

/// Per-endpoint stats row in [`GatewayStats`]
#[derive(Debug, Clone)]
pub struct EndpointStatsView {
    /// Endpoint id
    pub id: EndpointId,
    /// Endpoint name
    pub name: String,
    /// Whether requests are admitted
    pub enabled: bool,
    /// Counters
    pub stats: EndpointStats,
}

/// Aggregate gateway statistics snapshot
#[derive(Debug, Clone)]
pub struct GatewayStats {
    /// Per endpoint, sorted by name
    pub endpoints: Vec<EndpointStatsView>,
    /// Sum of dispatched requests
    pub total_requests: u64,
    /// Sum of successes
    pub total_successes: u64,
    /// Sum of failures
    pub total_failures: u64,
    /// Response cache counters
    pub cache: CacheStats,
}

/// Handle for a queued request
pub struct QueuedRequest {
    rx: oneshot::Receiver<Result<GatewayResponse, GatewayError>>,
    cancel: CancellationToken,
}

impl QueuedRequest {
    /// Cancel the request; before dispatch the queued work is dropped,
    /// after dispatch the transport is aborted
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The token governing this request
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Await completion
    pub async fn wait(self) -> Result<GatewayResponse, GatewayError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Cancelled),
        }
    }
}

struct EndpointEntry {
    endpoint: Endpoint,
    stats: EndpointStats,
    in_flight: u32,
    pending_delete: bool,
}

struct Prepared {
    id: EndpointId,
    name: String,
    request: TransportRequest,
    pass: CircuitPass,
    cache_key: Option<CacheKey>,
    retry_budget: u32,
    idempotent: bool,
    cancel: Option<CancellationToken>,
    path: String,
    method: Method,
}

enum Admitted {
    Cached(GatewayResponse),
    ShortCircuit(GatewayResponse),
    Dispatch(Box<Prepared>),
}

/// The gateway core: endpoint catalog plus the admission pipeline
pub struct Gateway {
    endpoints: DashMap<EndpointId, EndpointEntry>,
    names: DashMap<String, EndpointId>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    cache: ResponseCache,
    queue: RequestQueue,
    interceptors: Interceptors,
    vault: Arc<CredentialVault>,
    audit: Arc<AuditLog>,
    transport: Arc<dyn Transport>,
}

impl Gateway {
    /// Build a gateway from configuration
    pub fn new(
        config: &Config,
        vault: Arc<CredentialVault>,
        audit: Arc<AuditLog>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            endpoints: DashMap::new(),
            names: DashMap::new(),
            limiter: RateLimiter::new(config.rate_limiter.clone()),
            breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
            cache: ResponseCache::new(config.cache.clone()),
            queue: RequestQueue::new(config.queue.concurrency),
            interceptors: Interceptors::new(),
            vault,
            audit,
            transport,
        }
    }

    // ------------------------------------------------------------------
    // Catalog management
    // ------------------------------------------------------------------

    /// Register an endpoint; names are unique
    pub fn register_endpoint(
        &self,
        name: impl Into<String>,
        base_url: impl Into<String>,
        spec: EndpointSpec,
    ) -> Result<EndpointId, GatewayError> {
        let name = name.into();
        let id = EndpointId::generate();
        match self.names.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(GatewayError::EndpointExists { name });
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(id);
            }
        }
        let endpoint = Endpoint {
            id,
            name: name.clone(),
            base_url: base_url.into(),
            kind: spec.kind,
            auth: spec.auth,
            default_headers: spec.headers,
            timeout_ms: spec.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            retry_budget: spec.retry_budget.unwrap_or(DEFAULT_RETRY_BUDGET),
            enabled: true,
            feature: spec.feature,
        };
        self.endpoints.insert(
            id,
            EndpointEntry {
                endpoint,
                stats: EndpointStats::default(),
                in_flight: 0,
                pending_delete: false,
            },
        );
        tracing::info!(endpoint = %name, id = %id, "endpoint registered");
        Ok(id)
    }

    /// Delete an endpoint; with requests in flight the deletion is deferred
    /// until they drain
    pub fn delete_endpoint(&self, id: EndpointId) -> Result<(), GatewayError> {
        let (drained, name) = {
            let mut entry = self
                .endpoints
                .get_mut(&id)
                .ok_or_else(|| GatewayError::EndpointNotFound {
                    endpoint: id.to_string(),
                })?;
            entry.pending_delete = true;
            (entry.in_flight == 0, entry.endpoint.name.clone())
        };
        // The name is freed immediately; in-flight requests keep the state
        // alive until they complete.
        self.names.remove(&name);
        if drained {
            self.remove_endpoint(id);
        } else {
            tracing::info!(endpoint = %name, "endpoint deletion deferred until drain");
        }
        Ok(())
    }

    fn remove_endpoint(&self, id: EndpointId) {
        if let Some((_, entry)) = self.endpoints.remove(&id) {
            self.names.remove_if(&entry.endpoint.name, |_, mapped| *mapped == id);
            self.limiter.forget(id);
            self.breaker.forget(id);
            self.cache.purge_endpoint(id);
            tracing::info!(endpoint = %entry.endpoint.name, "endpoint removed");
        }
    }

    /// Enable or disable an endpoint
    pub fn set_enabled(&self, id: EndpointId, enabled: bool) -> Result<(), GatewayError> {
        let mut entry = self
            .endpoints
            .get_mut(&id)
            .ok_or_else(|| GatewayError::EndpointNotFound {
                endpoint: id.to_string(),
            })?;
        entry.endpoint.enabled = enabled;
        Ok(())
    }

    /// Replace an endpoint's auth binding
    pub fn update_auth(
        &self,
        id: EndpointId,
        auth: Option<EndpointAuth>,
    ) -> Result<(), GatewayError> {
        let mut entry = self
            .endpoints
            .get_mut(&id)
            .ok_or_else(|| GatewayError::EndpointNotFound {
                endpoint: id.to_string(),
            })?;
        entry.endpoint.auth = auth;
        Ok(())
    }

    /// Look up an endpoint id by name
    pub fn find_endpoint(&self, name: &str) -> Option<EndpointId> {
        self.names.get(name).map(|id| *id)
    }

    /// Snapshot one endpoint's catalog record
    pub fn endpoint(&self, id: EndpointId) -> Result<Endpoint, GatewayError> {
        self.endpoints
            .get(&id)
            .filter(|entry| !entry.pending_delete)
            .map(|entry| entry.endpoint.clone())
            .ok_or_else(|| GatewayError::EndpointNotFound {
                endpoint: id.to_string(),
            })
    }

    /// Snapshot the catalog, sorted by name (pending deletions excluded)
    pub fn catalog(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = self
            .endpoints
            .iter()
            .filter(|entry| !entry.pending_delete)
            .map(|entry| entry.endpoint.clone())
            .collect();
        endpoints.sort_by(|a, b| a.name.cmp(&b.name));
        endpoints
    }

    /// Flip the enablement of every endpoint gated on `feature`
    pub(crate) fn set_enabled_by_feature(&self, feature: &str, enabled: bool) {
        for mut entry in self.endpoints.iter_mut() {
            if entry.endpoint.feature.as_deref() == Some(feature) {
                entry.endpoint.enabled = enabled;
                tracing::info!(
                    endpoint = %entry.endpoint.name,
                    feature,
                    enabled,
                    "endpoint enablement follows feature rotation"
                );
            }
        }
    }

    /// Install an endpoint record verbatim (catalog import)
    pub(crate) fn install_endpoint(&self, endpoint: Endpoint) -> Result<(), GatewayError> {
        match self.names.entry(endpoint.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(GatewayError::EndpointExists {
                name: endpoint.name.clone(),
            }),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(endpoint.id);
                self.endpoints.insert(
                    endpoint.id,
                    EndpointEntry {
                        endpoint,
                        stats: EndpointStats::default(),
                        in_flight: 0,
                        pending_delete: false,
                    },
                );
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Request pipeline
    // ------------------------------------------------------------------

    /// Run the admission pipeline and dispatch
    pub async fn request(
        &self,
        id: EndpointId,
        path: &str,
        options: RequestOptions,
    ) -> Result<GatewayResponse, GatewayError> {
        match self.admit(id, path, options)? {
            Admitted::Cached(response) | Admitted::ShortCircuit(response) => Ok(response),
            Admitted::Dispatch(prepared) => {
                let result = self.dispatch(*prepared).await;
                self.finish(id);
                result
            }
        }
    }

    /// Like [`request`](Self::request) but scheduled through the priority
    /// queue
    pub fn queue_request(
        self: &Arc<Self>,
        id: EndpointId,
        path: impl Into<String>,
        mut options: RequestOptions,
    ) -> QueuedRequest {
        let token = options
            .cancel
            .get_or_insert_with(CancellationToken::new)
            .clone();
        let (tx, rx) = oneshot::channel();
        let gateway = Arc::clone(self);
        let path = path.into();
        let priority = options.priority;
        let job_token = token.clone();
        self.queue.enqueue(priority, async move {
            let result = if job_token.is_cancelled() {
                // Cancelled while parked: the work never dispatches.
                Err(GatewayError::Cancelled)
            } else {
                gateway.request(id, &path, options).await
            };
            let _ = tx.send(result);
        });
        QueuedRequest { rx, cancel: token }
    }

    fn admit(
        &self,
        id: EndpointId,
        path: &str,
        options: RequestOptions,
    ) -> Result<Admitted, GatewayError> {
        // Step 1: lookup and enablement.
        let endpoint = {
            let entry = self.endpoints.get(&id);
            match entry {
                Some(entry) if !entry.pending_delete => {
                    if !entry.endpoint.enabled {
                        let err = GatewayError::EndpointDisabled {
                            name: entry.endpoint.name.clone(),
                        };
                        drop(entry);
                        self.audit_deny(id, path, &err);
                        return Err(err);
                    }
                    entry.endpoint.clone()
                }
                _ => {
                    let err = GatewayError::EndpointNotFound {
                        endpoint: id.to_string(),
                    };
                    self.audit_deny(id, path, &err);
                    return Err(err);
                }
            }
        };

        // Step 2: circuit.
        let pass = match self.breaker.can_pass(id) {
            Ok(pass) => pass,
            Err(retry_in_ms) => {
                let err = GatewayError::CircuitOpen { retry_in_ms };
                self.audit_deny(id, path, &err);
                return Err(err);
            }
        };

        // Step 3: rate. Refusals here are not circuit failures.
        if let Err(retry_after_ms) = self.limiter.try_acquire(id) {
            self.breaker.release(id, pass);
            self.audit.record(
                AuditKind::RateLimited,
                json!({
                    "endpoint": endpoint.name,
                    "path": path,
                    "retry_after_ms": retry_after_ms,
                }),
            );
            return Err(GatewayError::RateLimited { retry_after_ms });
        }

        // Step 4: cache, for idempotent reads only.
        let cacheable = options.method == Method::GET && options.cache;
        let cache_key = cacheable.then(|| CacheKey::for_request(id, path, &options.params));
        if let Some(key) = cache_key {
            if let Some(data) = self.cache.get(&key) {
                self.breaker.release(id, pass);
                self.audit.record(
                    AuditKind::Admission,
                    json!({
                        "endpoint": endpoint.name,
                        "path": path,
                        "method": options.method.as_str(),
                        "cached": true,
                    }),
                );
                return Ok(Admitted::Cached(GatewayResponse {
                    status: 200,
                    data,
                    cached: true,
                    latency_ms: 0,
                }));
            }
        }

        // Step 5: build the request, injecting auth from the vault.
        let request = match self.build_request(&endpoint, path, &options) {
            Ok(request) => request,
            Err(err) => {
                self.breaker.release(id, pass);
                self.audit_deny(id, path, &err);
                return Err(err);
            }
        };

        // Step 6: request interceptors.
        let request = match self.interceptors.apply_request(request) {
            Ok(RequestFlow::Continue(request)) => request,
            Ok(RequestFlow::ShortCircuit(response)) => {
                self.breaker.release(id, pass);
                let response = match self.interceptors.apply_response(response) {
                    Ok(response) => response,
                    Err(err) => {
                        self.audit_deny(id, path, &err);
                        return Err(err);
                    }
                };
                self.audit.record(
                    AuditKind::Admission,
                    json!({
                        "endpoint": endpoint.name,
                        "path": path,
                        "method": options.method.as_str(),
                        "short_circuit": true,
                    }),
                );
                return Ok(Admitted::ShortCircuit(GatewayResponse {
                    status: response.status,
                    data: response.body,
                    cached: false,
                    latency_ms: 0,
                }));
            }
            Err(err) => {
                self.breaker.release(id, pass);
                self.audit_deny(id, path, &err);
                return Err(err);
            }
        };

        // Admitted for dispatch; hold the drain guard from here on.
        if let Some(mut entry) = self.endpoints.get_mut(&id) {
            entry.in_flight += 1;
        }

        let idempotent = options.idempotent.unwrap_or(matches!(
            options.method,
            Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE
        ));
        Ok(Admitted::Dispatch(Box::new(Prepared {
            id,
            name: endpoint.name,
            request,
            pass,
            cache_key,
            retry_budget: endpoint.retry_budget,
            idempotent,
            cancel: options.cancel,
            path: path.to_string(),
            method: options.method,
        })))
    }

    fn build_request(
        &self,
        endpoint: &Endpoint,
        path: &str,
        options: &RequestOptions,
    ) -> Result<TransportRequest, GatewayError> {
        let mut headers = endpoint.default_headers.clone();
        for (name, value) in &options.headers {
            headers.insert(name.clone(), value.clone());
        }
        if let Some(auth) = &endpoint.auth {
            let handle = auth
                .credential
                .as_ref()
                .ok_or(VaultError::CredentialUnknown {
                    name: "(unbound)".to_string(),
                })?;
            let secret = self.vault.resolve(handle)?;
            match &auth.scheme {
                AuthScheme::Bearer => {
                    headers.insert(
                        "Authorization".to_string(),
                        format!("Bearer {}", secret.expose_secret()),
                    );
                }
                AuthScheme::ApiKey { header } => {
                    headers.insert(header.clone(), secret.expose_secret().to_string());
                }
            }
        }

        let base = endpoint.base_url.trim_end_matches('/');
        let path_part = path.trim_start_matches('/');
        Ok(TransportRequest {
            method: options.method.clone(),
            url: format!("{base}/{path_part}"),
            headers,
            params: options.params.clone(),
            body: options.body.clone(),
            timeout: Duration::from_millis(endpoint.timeout_ms),
        })
    }

    async fn dispatch(&self, prepared: Prepared) -> Result<GatewayResponse, GatewayError> {
        if let Some(mut entry) = self.endpoints.get_mut(&prepared.id) {
            entry.stats.record_dispatch();
        }
        let started = Instant::now();
        let result = self.attempt_loop(&prepared).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                if let Some(mut entry) = self.endpoints.get_mut(&prepared.id) {
                    entry.stats.record_success(latency_ms);
                }
                if let Some(CircuitTransition::Closed) =
                    self.breaker.record_success(prepared.id, prepared.pass)
                {
                    tracing::info!(endpoint = %prepared.name, "circuit closed");
                    self.audit.record(
                        AuditKind::CircuitClose,
                        json!({ "endpoint": prepared.name.as_str() }),
                    );
                }
                if let Some(key) = prepared.cache_key {
                    self.cache.insert(key, response.body.clone());
                }
                // Response interceptor failures surface as-is; stats and
                // cache writes above are not reverted.
                let response = match self.interceptors.apply_response(response) {
                    Ok(response) => response,
                    Err(err) => {
                        self.audit.record(
                            AuditKind::Admission,
                            json!({
                                "endpoint": prepared.name.as_str(),
                                "path": prepared.path.as_str(),
                                "method": prepared.method.as_str(),
                                "outcome": err.kind(),
                            }),
                        );
                        return Err(err);
                    }
                };
                self.audit.record(
                    AuditKind::Admission,
                    json!({
                        "endpoint": prepared.name.as_str(),
                        "path": prepared.path.as_str(),
                        "method": prepared.method.as_str(),
                        "status": response.status,
                        "latency_ms": latency_ms,
                    }),
                );
                Ok(GatewayResponse {
                    status: response.status,
                    data: response.body,
                    cached: false,
                    latency_ms,
                })
            }
            Err(GatewayError::Cancelled) => {
                // Cancellation settles the circuit pass without counting
                // either way.
                self.breaker.release(prepared.id, prepared.pass);
                self.audit.record(
                    AuditKind::Admission,
                    json!({
                        "endpoint": prepared.name.as_str(),
                        "path": prepared.path.as_str(),
                        "method": prepared.method.as_str(),
                        "outcome": "cancelled",
                    }),
                );
                Err(GatewayError::Cancelled)
            }
            Err(err) => {
                if let Some(mut entry) = self.endpoints.get_mut(&prepared.id) {
                    entry.stats.record_failure(latency_ms);
                }
                let counted = counted_failure(&err);
                if let Some(CircuitTransition::Opened) =
                    self.breaker.record_failure(prepared.id, prepared.pass, counted)
                {
                    tracing::warn!(endpoint = %prepared.name, "circuit opened");
                    self.audit.record(
                        AuditKind::CircuitOpen,
                        json!({ "endpoint": prepared.name.as_str() }),
                    );
                }
                self.audit.record(
                    AuditKind::Admission,
                    json!({
                        "endpoint": prepared.name.as_str(),
                        "path": prepared.path.as_str(),
                        "method": prepared.method.as_str(),
                        "outcome": err.kind(),
                    }),
                );
                Err(err)
            }
        }
    }

    async fn attempt_loop(&self, prepared: &Prepared) -> Result<TransportResponse, GatewayError> {
        let max_attempts = 1 + if prepared.idempotent {
            prepared.retry_budget
        } else {
            0
        };
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = self.one_attempt(prepared).await;
            let err = match outcome {
                Ok(response) if response.status >= 500 => GatewayError::HttpStatus {
                    code: response.status,
                },
                Ok(response) if response.status >= 400 => {
                    // Client errors are never retried.
                    return Err(GatewayError::HttpStatus {
                        code: response.status,
                    });
                }
                Ok(response) => return Ok(response),
                Err(GatewayError::Cancelled) => return Err(GatewayError::Cancelled),
                Err(err) => err,
            };
            if attempt >= max_attempts || !retriable(&err) {
                return Err(err);
            }
            let backoff = backoff_with_jitter(attempt);
            tracing::debug!(
                endpoint = %prepared.name,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "retrying after transient failure"
            );
            match &prepared.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => return Err(GatewayError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                None => tokio::time::sleep(backoff).await,
            }
        }
    }

    async fn one_attempt(&self, prepared: &Prepared) -> Result<TransportResponse, GatewayError> {
        let dispatch = tokio::time::timeout(
            prepared.request.timeout,
            self.transport.dispatch(prepared.request.clone()),
        );
        let outcome = match &prepared.cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => return Err(GatewayError::Cancelled),
                    outcome = dispatch => outcome,
                }
            }
            None => dispatch.await,
        };
        match outcome {
            Err(_elapsed) => Err(GatewayError::Timeout),
            Ok(Err(TransportError::Timeout)) => Err(GatewayError::Timeout),
            Ok(Err(TransportError::Network(message))) => Err(GatewayError::Network(message)),
            Ok(Ok(response)) => Ok(response),
        }
    }

    fn finish(&self, id: EndpointId) {
        let remove = match self.endpoints.get_mut(&id) {
            Some(mut entry) => {
                entry.in_flight = entry.in_flight.saturating_sub(1);
                entry.pending_delete && entry.in_flight == 0
            }
            None => false,
        };
        if remove {
            self.remove_endpoint(id);
        }
    }

    fn audit_deny(&self, id: EndpointId, path: &str, err: &GatewayError) {
        self.audit.record(
            AuditKind::Deny,
            json!({
                "endpoint": id.to_string(),
                "path": path,
                "reason": err.kind(),
            }),
        );
    }

    // ------------------------------------------------------------------
    // Observation and configuration
    // ------------------------------------------------------------------

    /// Rate window snapshot for one endpoint
    pub fn rate_status(&self, id: EndpointId) -> Result<RateStatus, GatewayError> {
        self.ensure_exists(id)?;
        Ok(self.limiter.status(id))
    }

    /// Circuit snapshot for one endpoint
    pub fn circuit_status(&self, id: EndpointId) -> Result<CircuitStatus, GatewayError> {
        self.ensure_exists(id)?;
        Ok(self.breaker.status(id))
    }

    fn ensure_exists(&self, id: EndpointId) -> Result<(), GatewayError> {
        if self.endpoints.contains_key(&id) {
            Ok(())
        } else {
            Err(GatewayError::EndpointNotFound {
                endpoint: id.to_string(),
            })
        }
    }

    /// Aggregate statistics snapshot
    pub fn stats(&self) -> GatewayStats {
        let mut endpoints: Vec<EndpointStatsView> = self
            .endpoints
            .iter()
            .map(|entry| EndpointStatsView {
                id: entry.endpoint.id,
                name: entry.endpoint.name.clone(),
                enabled: entry.endpoint.enabled,
                stats: entry.stats.clone(),
            })
            .collect();
        endpoints.sort_by(|a, b| a.name.cmp(&b.name));
        let total_requests = endpoints.iter().map(|e| e.stats.requests).sum();
        let total_successes = endpoints.iter().map(|e| e.stats.successes).sum();
        let total_failures = endpoints.iter().map(|e| e.stats.failures).sum();
        GatewayStats {
            endpoints,
            total_requests,
            total_successes,
            total_failures,
            cache: self.cache.stats(),
        }
    }

    /// Register a request or response interceptor
    pub fn add_request_interceptor(
        &self,
        order: i32,
        callback: impl Fn(TransportRequest) -> Result<RequestFlow, GatewayError>
            + Send
            + Sync
            + 'static,
    ) -> InterceptorId {
        self.interceptors.add_request(order, callback)
    }

    /// Register a response interceptor
    pub fn add_response_interceptor(
        &self,
        order: i32,
        callback: impl Fn(TransportResponse) -> Result<TransportResponse, GatewayError>
            + Send
            + Sync
            + 'static,
    ) -> InterceptorId {
        self.interceptors.add_response(order, callback)
    }

    /// Remove an interceptor by id
    pub fn remove_interceptor(&self, id: InterceptorId) -> bool {
        self.interceptors.remove(id)
    }

    /// Drop every cached response
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Replace rate limiter settings
    pub fn configure_rate_limiter(&self, config: RateLimiterConfig) {
        self.limiter.configure(config);
    }

    /// Replace circuit breaker settings, globally or per endpoint
    pub fn configure_circuit_breaker(
        &self,
        endpoint: Option<EndpointId>,
        config: CircuitBreakerConfig,
    ) {
        self.breaker.configure(endpoint, config);
    }

    /// Replace cache settings
    pub fn configure_cache(&self, config: CacheConfig) {
        self.cache.configure(config);
    }

    /// Replace the queue concurrency bound
    pub fn configure_queue(&self, concurrency: usize) {
        self.queue.configure(concurrency);
    }

    /// Current rate limiter settings (export)
    pub(crate) fn rate_limiter_config(&self) -> RateLimiterConfig {
        self.limiter.config()
    }

    /// Current circuit breaker defaults (export)
    pub(crate) fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        self.breaker.defaults_config()
    }

    /// Current cache settings (export)
    pub(crate) fn cache_config(&self) -> CacheConfig {
        self.cache.config()
    }
}

fn counted_failure(err: &GatewayError) -> bool {
    match err {
        GatewayError::Timeout | GatewayError::Network(_) => true,
        GatewayError::HttpStatus { code } => *code >= 500 || *code == 408 || *code == 429,
        _ => false,
    }
}

fn retriable(err: &GatewayError) -> bool {
    match err {
        GatewayError::Timeout | GatewayError::Network(_) => true,
        GatewayError::HttpStatus { code } => *code >= 500,
        _ => false,
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let exp = RETRY_BASE_MS.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
    let capped = exp.min(RETRY_CAP_MS);
    // Full jitter: anywhere in [0, capped].
    let jittered = (capped as f64 * rand::random::<f64>()) as u64;
    Duration::from_millis(jittered)
}
