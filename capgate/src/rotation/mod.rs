//! Rotation engine — the single owner of `(tier, hardware_score, bridge)`
//!
//! All state mutation funnels through [`RotationEngine::update`]. Each
//! update recomputes the visible feature set through the tier gate, diffs it
//! against the previously published set, and yields the precise events to
//! fan out: a `tier_change` first when the effective tier moved, then a
//! `rotate` carrying the delta.
//!
//! Bridge transitions to offline are debounced: the flip only takes effect
//! once it has persisted for the configured stable window (recovery to
//! online is immediate). The engine reports the pending debounce so the
//! caller can schedule a [`tick`](RotationEngine::tick) at expiry.

pub mod dispatcher;
pub mod gate;

pub use dispatcher::{RotationDispatcher, SubscriberError, SubscriberFn, SubscriptionId};
pub use gate::{Decision, FeatureSet, RotationDelta, StateSnapshot, TierGate};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::features::{FeatureRegistry, Tier};
use crate::vault::CredentialView;

/// Reported bridge connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    /// Companion service reachable
    Online,
    /// Companion service unreachable
    Offline,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Partial state mutation; unset fields are left as they are
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateUpdate {
    /// New tier, if changing
    pub tier: Option<Tier>,
    /// New hardware score, if changing
    pub hardware_score: Option<u32>,
    /// New bridge report, if changing
    pub bridge: Option<BridgeState>,
}

impl StateUpdate {
    /// An empty update; recomputes against current credentials without
    /// changing the triple
    pub fn none() -> Self {
        Self::default()
    }

    /// Set the tier
    pub fn tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    /// Set the hardware score
    pub fn hardware_score(mut self, score: u32) -> Self {
        self.hardware_score = Some(score);
        self
    }

    /// Set the bridge report
    pub fn bridge(mut self, bridge: BridgeState) -> Self {
        self.bridge = Some(bridge);
        self
    }
}

/// Events produced by an update, in publication order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationEvent {
    /// The effective tier moved; always published before the rotate event
    /// of the same update
    TierChange {
        /// Effective tier before the update
        previous: Tier,
        /// Effective tier after the update
        current: Tier,
    },
    /// The visible feature set changed
    Rotate {
        /// Added/removed feature ids, deterministically ordered
        delta: RotationDelta,
        /// State after the update
        state: StateSnapshot,
    },
}

/// A pending debounce expiry the caller should schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceTick {
    /// Token guarding against superseded timers
    pub generation: u64,
    /// Time until the offline report takes effect
    pub delay: Duration,
}

/// What one update produced
#[derive(Debug, Clone, Default)]
pub struct UpdateOutcome {
    /// Events to publish, already ordered
    pub events: Vec<RotationEvent>,
    /// Debounce expiry to schedule, when an offline report is pending
    pub debounce: Option<DebounceTick>,
}

/// Single owner of the rotation triple and the published feature set
pub struct RotationEngine {
    registry: Arc<FeatureRegistry>,
    tier: Tier,
    hardware_score: u32,
    bridge: BridgeState,
    bridge_effective: bool,
    offline_since: Option<Instant>,
    stable: Duration,
    published: FeatureSet,
    effective_tier: Tier,
    generation: u64,
}

impl RotationEngine {
    /// Create an engine and compute the initial feature set
    ///
    /// Construction publishes nothing; the initial set is the baseline
    /// against which the first update is diffed.
    pub fn new(
        registry: Arc<FeatureRegistry>,
        stable: Duration,
        tier: Tier,
        hardware_score: u32,
        bridge: BridgeState,
        credentials: &dyn CredentialView,
    ) -> Self {
        let bridge_effective = bridge == BridgeState::Online;
        let gate = TierGate::new(&registry, tier, hardware_score, bridge_effective, credentials);
        let published = gate.feature_set();
        let effective_tier = gate.effective_tier();
        Self {
            registry,
            tier,
            hardware_score,
            bridge,
            bridge_effective,
            offline_since: if bridge_effective { None } else { Some(Instant::now()) },
            stable,
            published,
            effective_tier,
            generation: 0,
        }
    }

    /// Apply a partial mutation and produce the events it implies
    pub fn update(
        &mut self,
        partial: StateUpdate,
        credentials: &dyn CredentialView,
    ) -> UpdateOutcome {
        if let Some(tier) = partial.tier {
            self.tier = tier;
        }
        if let Some(score) = partial.hardware_score {
            self.hardware_score = score;
        }
        if let Some(bridge) = partial.bridge {
            match (self.bridge, bridge) {
                (BridgeState::Online, BridgeState::Offline) => {
                    self.bridge = BridgeState::Offline;
                    self.offline_since = Some(Instant::now());
                }
                (BridgeState::Offline, BridgeState::Online) => {
                    // Recover open: online takes effect immediately.
                    self.bridge = BridgeState::Online;
                    self.offline_since = None;
                }
                _ => {}
            }
        }

        let mut debounce = None;
        self.bridge_effective = match self.bridge {
            BridgeState::Online => true,
            BridgeState::Offline => match self.offline_since {
                Some(since) if since.elapsed() < self.stable => {
                    // Still within the debounce window; schedule the expiry.
                    self.generation += 1;
                    debounce = Some(DebounceTick {
                        generation: self.generation,
                        delay: self.stable.saturating_sub(since.elapsed()),
                    });
                    true
                }
                _ => false,
            },
        };

        let mut outcome = self.recompute(credentials);
        outcome.debounce = debounce;
        outcome
    }

    /// Apply a debounce expiry scheduled by an earlier update
    ///
    /// Returns `None` when the timer was superseded (newer update, recovery
    /// to online, or the flip was already applied).
    pub fn tick(
        &mut self,
        generation: u64,
        credentials: &dyn CredentialView,
    ) -> Option<UpdateOutcome> {
        if generation != self.generation || self.bridge != BridgeState::Offline {
            return None;
        }
        let since = self.offline_since?;
        if since.elapsed() < self.stable || !self.bridge_effective {
            return None;
        }
        self.bridge_effective = false;
        tracing::info!("bridge offline debounce elapsed; applying offline state");
        Some(self.recompute(credentials))
    }

    fn recompute(&mut self, credentials: &dyn CredentialView) -> UpdateOutcome {
        let gate = TierGate::new(
            &self.registry,
            self.tier,
            self.hardware_score,
            self.bridge_effective,
            credentials,
        );
        let new_set = gate.feature_set();
        let new_effective = gate.effective_tier();

        let mut events = Vec::new();
        if new_effective != self.effective_tier {
            tracing::info!(
                previous = %self.effective_tier,
                current = %new_effective,
                "effective tier changed"
            );
            events.push(RotationEvent::TierChange {
                previous: self.effective_tier,
                current: new_effective,
            });
        }

        let delta = RotationDelta::between(&self.published, &new_set);
        if !delta.is_empty() {
            tracing::debug!(
                added = delta.added.len(),
                removed = delta.removed.len(),
                "feature set rotated"
            );
            events.push(RotationEvent::Rotate {
                delta,
                state: StateSnapshot {
                    tier: self.tier,
                    hardware_score: self.hardware_score,
                    bridge_online: self.bridge_effective,
                    effective_tier: new_effective,
                },
            });
        }

        self.effective_tier = new_effective;
        self.published = new_set;
        UpdateOutcome {
            events,
            debounce: None,
        }
    }

    /// Current state snapshot
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            tier: self.tier,
            hardware_score: self.hardware_score,
            bridge_online: self.bridge_effective,
            effective_tier: self.effective_tier,
        }
    }

    /// The feature set as last published
    pub fn published(&self) -> &FeatureSet {
        &self.published
    }

    /// The bridge state as last reported (pre-debounce)
    pub fn reported_bridge(&self) -> BridgeState {
        self.bridge
    }

    /// The registry this engine decides over
    pub fn registry(&self) -> &Arc<FeatureRegistry> {
        &self.registry
    }
}
