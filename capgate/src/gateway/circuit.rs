//! Three-state circuit breaker, keyed by endpoint
//!
//! Counted failures trip the circuit after the configured threshold; the
//! open state refuses callers until the reset timeout, then admits exactly
//! one probe. A successful probe closes the circuit; a counted-failure probe
//! reopens it for another full reset timeout (fixed, no exponential growth).

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::gateway::endpoint::EndpointId;

/// Observable circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests pass
    Closed,
    /// Requests refused until the reset timeout
    Open,
    /// One probe in flight; other callers refused
    HalfOpen,
}

/// Snapshot of one endpoint's circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitStatus {
    /// Current state
    pub state: CircuitState,
    /// Counted failures since the last success
    pub consecutive_failures: u32,
    /// Milliseconds until a probe is admitted, when open
    pub retry_in_ms: Option<u64>,
}

/// State transitions worth auditing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    /// The circuit tripped open
    Opened,
    /// A probe succeeded and the circuit closed
    Closed,
}

/// Admission token returned by [`CircuitBreaker::can_pass`]
///
/// The holder must settle it through `record_success`, `record_failure`, or
/// `release`; a probe token left unsettled would wedge the half-open state.
#[derive(Debug, Clone, Copy)]
pub struct CircuitPass {
    pub(crate) probe: bool,
}

#[derive(Debug, Clone)]
struct Entry {
    state: CircuitState,
    consecutive_failures: u32,
    retry_at: Option<Instant>,
    probe_in_flight: bool,
    overrides: Option<CircuitBreakerConfig>,
}

impl Entry {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            retry_at: None,
            probe_in_flight: false,
            overrides: None,
        }
    }
}

/// Per-endpoint breaker table
#[derive(Debug)]
pub struct CircuitBreaker {
    defaults: RwLock<CircuitBreakerConfig>,
    entries: DashMap<EndpointId, Entry>,
}

impl CircuitBreaker {
    /// Create a breaker with the given default settings
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            defaults: RwLock::new(config),
            entries: DashMap::new(),
        }
    }

    /// Replace default settings, or override one endpoint's settings
    pub fn configure(&self, endpoint: Option<EndpointId>, config: CircuitBreakerConfig) {
        match endpoint {
            Some(id) => {
                let mut entry = self.entries.entry(id).or_insert_with(Entry::new);
                entry.overrides = Some(config);
            }
            None => {
                let mut defaults = match self.defaults.write() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                *defaults = config;
            }
        }
    }

    /// Current default settings
    pub fn defaults_config(&self) -> CircuitBreakerConfig {
        match self.defaults.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn settings_for(&self, entry: &Entry) -> CircuitBreakerConfig {
        entry.overrides.clone().unwrap_or_else(|| {
            match self.defaults.read() {
                Ok(guard) => guard.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            }
        })
    }

    /// Check whether a request may pass
    ///
    /// Does not mutate except for the documented open-to-half-open edge:
    /// the first caller past the reset timeout becomes the probe.
    pub fn can_pass(&self, id: EndpointId) -> Result<CircuitPass, u64> {
        let mut entry = self.entries.entry(id).or_insert_with(Entry::new);
        match entry.state {
            CircuitState::Closed => Ok(CircuitPass { probe: false }),
            CircuitState::Open => {
                let now = Instant::now();
                match entry.retry_at {
                    Some(retry_at) if now < retry_at => {
                        Err(retry_at.duration_since(now).as_millis() as u64)
                    }
                    _ => {
                        entry.state = CircuitState::HalfOpen;
                        entry.probe_in_flight = true;
                        Ok(CircuitPass { probe: true })
                    }
                }
            }
            CircuitState::HalfOpen => {
                if entry.probe_in_flight {
                    let retry_in = entry
                        .retry_at
                        .map(|at| at.saturating_duration_since(Instant::now()).as_millis() as u64)
                        .unwrap_or(0);
                    Err(retry_in)
                } else {
                    entry.probe_in_flight = true;
                    Ok(CircuitPass { probe: true })
                }
            }
        }
    }

    /// Record a successful completion
    pub fn record_success(&self, id: EndpointId, pass: CircuitPass) -> Option<CircuitTransition> {
        let mut entry = self.entries.entry(id).or_insert_with(Entry::new);
        let closed_now = entry.state != CircuitState::Closed;
        entry.state = CircuitState::Closed;
        entry.consecutive_failures = 0;
        entry.retry_at = None;
        if pass.probe {
            entry.probe_in_flight = false;
        }
        closed_now.then_some(CircuitTransition::Closed)
    }

    /// Record a failed completion
    ///
    /// `counted` is false for plain 4xx responses, which never contribute to
    /// tripping the circuit; an uncounted probe failure still closes the
    /// circuit because the endpoint answered.
    pub fn record_failure(
        &self,
        id: EndpointId,
        pass: CircuitPass,
        counted: bool,
    ) -> Option<CircuitTransition> {
        let mut entry = self.entries.entry(id).or_insert_with(Entry::new);
        let settings = self.settings_for(&entry);
        if pass.probe {
            entry.probe_in_flight = false;
            if counted {
                entry.state = CircuitState::Open;
                entry.consecutive_failures += 1;
                entry.retry_at = Some(Instant::now() + settings.reset_timeout());
                return Some(CircuitTransition::Opened);
            }
            // The remote answered; an uncounted status closes the circuit.
            let closed_now = entry.state != CircuitState::Closed;
            entry.state = CircuitState::Closed;
            entry.consecutive_failures = 0;
            entry.retry_at = None;
            return closed_now.then_some(CircuitTransition::Closed);
        }
        if !counted {
            return None;
        }
        entry.consecutive_failures += 1;
        if entry.state == CircuitState::Closed
            && entry.consecutive_failures >= settings.failure_threshold
        {
            entry.state = CircuitState::Open;
            entry.retry_at = Some(Instant::now() + settings.reset_timeout());
            return Some(CircuitTransition::Opened);
        }
        None
    }

    /// Return an unsettled pass (cache hit, cancellation, refused rate)
    pub fn release(&self, id: EndpointId, pass: CircuitPass) {
        if !pass.probe {
            return;
        }
        if let Some(mut entry) = self.entries.get_mut(&id) {
            entry.probe_in_flight = false;
        }
    }

    /// Current snapshot for one endpoint
    pub fn status(&self, id: EndpointId) -> CircuitStatus {
        match self.entries.get(&id) {
            Some(entry) => CircuitStatus {
                state: entry.state,
                consecutive_failures: entry.consecutive_failures,
                retry_in_ms: entry.retry_at.map(|at| {
                    at.saturating_duration_since(Instant::now()).as_millis() as u64
                }),
            },
            None => CircuitStatus {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                retry_in_ms: None,
            },
        }
    }

    /// Drop an endpoint's circuit state (endpoint deletion)
    pub fn forget(&self, id: EndpointId) {
        self.entries.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout_ms: reset_ms,
        })
    }

    fn trip(breaker: &CircuitBreaker, id: EndpointId, failures: u32) {
        for _ in 0..failures {
            let pass = breaker.can_pass(id).unwrap();
            breaker.record_failure(id, pass, true);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = breaker(3, 1_000);
        let id = EndpointId::generate();
        trip(&breaker, id, 2);
        assert_eq!(breaker.status(id).state, CircuitState::Closed);

        trip(&breaker, id, 1);
        assert_eq!(breaker.status(id).state, CircuitState::Open);
        let retry_in = breaker.can_pass(id).unwrap_err();
        assert!(retry_in <= 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_after_reset_timeout() {
        let breaker = breaker(1, 1_000);
        let id = EndpointId::generate();
        trip(&breaker, id, 1);

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(breaker.can_pass(id).is_err());

        tokio::time::advance(Duration::from_millis(1)).await;
        let pass = breaker.can_pass(id).unwrap();
        assert!(pass.probe);
        // Only one probe at a time.
        assert!(breaker.can_pass(id).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_success_closes() {
        let breaker = breaker(1, 1_000);
        let id = EndpointId::generate();
        trip(&breaker, id, 1);
        tokio::time::advance(Duration::from_millis(1_000)).await;

        let pass = breaker.can_pass(id).unwrap();
        let transition = breaker.record_success(id, pass);
        assert_eq!(transition, Some(CircuitTransition::Closed));
        assert_eq!(breaker.status(id).state, CircuitState::Closed);
        assert_eq!(breaker.status(id).consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reopens_with_fixed_timeout() {
        let breaker = breaker(1, 1_000);
        let id = EndpointId::generate();
        trip(&breaker, id, 1);
        tokio::time::advance(Duration::from_millis(1_000)).await;

        let pass = breaker.can_pass(id).unwrap();
        let transition = breaker.record_failure(id, pass, true);
        assert_eq!(transition, Some(CircuitTransition::Opened));

        // Fixed reset timeout, no exponential growth.
        let retry_in = breaker.can_pass(id).unwrap_err();
        assert!(retry_in > 900 && retry_in <= 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncounted_probe_failure_closes() {
        let breaker = breaker(1, 1_000);
        let id = EndpointId::generate();
        trip(&breaker, id, 1);
        tokio::time::advance(Duration::from_millis(1_000)).await;

        let pass = breaker.can_pass(id).unwrap();
        // A plain 4xx means the endpoint is reachable.
        let transition = breaker.record_failure(id, pass, false);
        assert_eq!(transition, Some(CircuitTransition::Closed));
        assert!(breaker.can_pass(id).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_4xx_never_trips() {
        let breaker = breaker(2, 1_000);
        let id = EndpointId::generate();
        for _ in 0..10 {
            let pass = breaker.can_pass(id).unwrap();
            breaker.record_failure(id, pass, false);
        }
        assert_eq!(breaker.status(id).state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_counter() {
        let breaker = breaker(3, 1_000);
        let id = EndpointId::generate();
        trip(&breaker, id, 2);
        let pass = breaker.can_pass(id).unwrap();
        breaker.record_success(id, pass);
        assert_eq!(breaker.status(id).consecutive_failures, 0);

        trip(&breaker, id, 2);
        assert_eq!(breaker.status(id).state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_probe_frees_slot() {
        let breaker = breaker(1, 1_000);
        let id = EndpointId::generate();
        trip(&breaker, id, 1);
        tokio::time::advance(Duration::from_millis(1_000)).await;

        let pass = breaker.can_pass(id).unwrap();
        assert!(pass.probe);
        breaker.release(id, pass);

        // The slot is free again for the next caller.
        let pass = breaker.can_pass(id).unwrap();
        assert!(pass.probe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_endpoint_override() {
        let breaker = breaker(5, 30_000);
        let id = EndpointId::generate();
        breaker.configure(
            Some(id),
            CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout_ms: 100,
            },
        );
        trip(&breaker, id, 1);
        assert_eq!(breaker.status(id).state, CircuitState::Open);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(breaker.can_pass(id).is_ok());
    }
}
