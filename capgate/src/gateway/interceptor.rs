//! Ordered request/response interceptors
//!
//! Request interceptors run in ascending order and may rewrite the request
//! or short-circuit with a response; response interceptors run in ascending
//! order over the outcome. Interceptor errors surface to the caller with
//! whatever kind they raise; recorded side effects (stats, cache) are not
//! reverted.

use std::fmt;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::gateway::transport::{TransportRequest, TransportResponse};

/// Identity of a registered interceptor, for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterceptorId(Uuid);

impl fmt::Display for InterceptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a request interceptor decided
#[derive(Debug)]
pub enum RequestFlow {
    /// Keep going with this (possibly rewritten) request
    Continue(TransportRequest),
    /// Skip dispatch and answer with this response
    ShortCircuit(TransportResponse),
}

/// Request interceptor callback
pub type RequestInterceptorFn =
    dyn Fn(TransportRequest) -> Result<RequestFlow, GatewayError> + Send + Sync + 'static;

/// Response interceptor callback
pub type ResponseInterceptorFn =
    dyn Fn(TransportResponse) -> Result<TransportResponse, GatewayError> + Send + Sync + 'static;

struct Registered<F: ?Sized> {
    id: InterceptorId,
    order: i32,
    callback: Arc<F>,
}

impl<F: ?Sized> Clone for Registered<F> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            order: self.order,
            callback: Arc::clone(&self.callback),
        }
    }
}

/// Interceptor registry
pub struct Interceptors {
    request: RwLock<Vec<Registered<RequestInterceptorFn>>>,
    response: RwLock<Vec<Registered<ResponseInterceptorFn>>>,
}

impl Interceptors {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            request: RwLock::new(Vec::new()),
            response: RwLock::new(Vec::new()),
        }
    }

    /// Register a request interceptor at the given order
    pub fn add_request(
        &self,
        order: i32,
        callback: impl Fn(TransportRequest) -> Result<RequestFlow, GatewayError>
            + Send
            + Sync
            + 'static,
    ) -> InterceptorId {
        let id = InterceptorId(Uuid::new_v4());
        let mut list = write_guard(&self.request);
        list.push(Registered {
            id,
            order,
            callback: Arc::new(callback),
        });
        list.sort_by_key(|r| r.order);
        id
    }

    /// Register a response interceptor at the given order
    pub fn add_response(
        &self,
        order: i32,
        callback: impl Fn(TransportResponse) -> Result<TransportResponse, GatewayError>
            + Send
            + Sync
            + 'static,
    ) -> InterceptorId {
        let id = InterceptorId(Uuid::new_v4());
        let mut list = write_guard(&self.response);
        list.push(Registered {
            id,
            order,
            callback: Arc::new(callback),
        });
        list.sort_by_key(|r| r.order);
        id
    }

    /// Remove an interceptor of either kind; returns whether one existed
    pub fn remove(&self, id: InterceptorId) -> bool {
        let mut removed = false;
        {
            let mut list = write_guard(&self.request);
            let before = list.len();
            list.retain(|r| r.id != id);
            removed |= list.len() != before;
        }
        {
            let mut list = write_guard(&self.response);
            let before = list.len();
            list.retain(|r| r.id != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Run request interceptors in order
    pub fn apply_request(&self, request: TransportRequest) -> Result<RequestFlow, GatewayError> {
        let chain: Vec<Registered<RequestInterceptorFn>> = read_guard(&self.request).clone();
        let mut current = request;
        for registered in chain {
            match (registered.callback)(current)? {
                RequestFlow::Continue(next) => current = next,
                RequestFlow::ShortCircuit(response) => {
                    return Ok(RequestFlow::ShortCircuit(response))
                }
            }
        }
        Ok(RequestFlow::Continue(current))
    }

    /// Run response interceptors in order
    pub fn apply_response(
        &self,
        response: TransportResponse,
    ) -> Result<TransportResponse, GatewayError> {
        let chain: Vec<Registered<ResponseInterceptorFn>> = read_guard(&self.response).clone();
        let mut current = response;
        for registered in chain {
            current = (registered.callback)(current)?;
        }
        Ok(current)
    }
}

impl Default for Interceptors {
    fn default() -> Self {
        Self::new()
    }
}

fn write_guard<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read_guard<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
