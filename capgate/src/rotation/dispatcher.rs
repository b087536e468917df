//! Rotation event fan-out
//!
//! Subscribers receive each published event exactly once, in publication
//! order. A failing callback is audited and logged; it never prevents the
//! remaining subscribers from firing and never bubbles into `update()`.

use std::fmt;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::audit::{AuditKind, AuditLog};

use super::RotationEvent;

/// Error a subscriber may return; isolated from the publisher
#[derive(Debug, Clone)]
pub struct SubscriberError {
    /// What went wrong, for the audit trail
    pub message: String,
}

impl SubscriberError {
    /// Build an error from any displayable cause
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for SubscriberError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SubscriberError {}

/// Rotation event callback
///
/// Subscribers are expected to be non-blocking; long work belongs on a
/// queue, not in the callback.
pub type SubscriberFn =
    dyn Fn(&RotationEvent) -> Result<(), SubscriberError> + Send + Sync + 'static;

/// Identity of a subscription, for unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

/// Publication-ordered event fan-out with error isolation
pub struct RotationDispatcher {
    subscribers: Mutex<Vec<(SubscriptionId, Arc<SubscriberFn>)>>,
}

impl RotationDispatcher {
    /// Create an empty dispatcher
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback; returns the id used to unsubscribe
    pub fn subscribe(
        &self,
        callback: impl Fn(&RotationEvent) -> Result<(), SubscriberError> + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.push((id, Arc::new(callback)));
        id
    }

    /// Remove a subscription; idempotent, effective before the next event
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.retain(|(sub_id, _)| *sub_id != id);
    }

    /// Deliver a batch of events, in order, to every current subscriber
    pub fn publish(&self, events: &[RotationEvent], audit: &AuditLog) {
        if events.is_empty() {
            return;
        }
        let snapshot: Vec<(SubscriptionId, Arc<SubscriberFn>)> = {
            let subscribers = match self.subscribers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            subscribers.clone()
        };
        for event in events {
            for (id, callback) in &snapshot {
                if let Err(err) = callback(event) {
                    tracing::warn!(
                        subscription = %id.0,
                        error = %err,
                        "rotation subscriber failed"
                    );
                    audit.record(
                        AuditKind::Deny,
                        serde_json::json!({
                            "subscriber": id.0.to_string(),
                            "error": err.message,
                            "context": "rotation_subscriber",
                        }),
                    );
                }
            }
        }
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        match self.subscribers.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl Default for RotationDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
