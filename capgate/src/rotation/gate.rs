//! Tier gate — pure admission decisions over a state snapshot
//!
//! Everything here is referentially transparent given a registry, a state
//! triple, and a credential view; the rotation engine calls it to compute
//! feature sets and the facade calls it for explicit checks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::DenyReason;
use crate::features::{FeatureRegistry, Scope, Tier};
use crate::vault::CredentialView;

/// Outcome of an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The feature is currently permitted
    Admit,
    /// The feature is refused for the given reason
    Deny(DenyReason),
}

impl Decision {
    /// Whether the decision admits
    pub fn is_admit(&self) -> bool {
        matches!(self, Decision::Admit)
    }
}

/// Per-scope visible features, scope-ordered, registry-ordered within a scope
pub type FeatureSet = BTreeMap<Scope, Vec<String>>;

/// The pair of ordered, disjoint feature-id lists between two snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationDelta {
    /// Newly visible features
    pub added: Vec<String>,
    /// No-longer-visible features
    pub removed: Vec<String>,
}

impl RotationDelta {
    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Diff `new` against `old`, scope by scope in canonical order
    pub fn between(old: &FeatureSet, new: &FeatureSet) -> RotationDelta {
        let mut delta = RotationDelta::default();
        for scope in Scope::ALL {
            let empty = Vec::new();
            let old_list = old.get(&scope).unwrap_or(&empty);
            let new_list = new.get(&scope).unwrap_or(&empty);
            for id in new_list {
                if !old_list.contains(id) {
                    delta.added.push(id.clone());
                }
            }
            for id in old_list {
                if !new_list.contains(id) {
                    delta.removed.push(id.clone());
                }
            }
        }
        delta
    }
}

/// A state triple plus the derived effective tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Stored tier, as last set by `update()`
    pub tier: Tier,
    /// Hardware capability score
    pub hardware_score: u32,
    /// Debounced bridge view
    pub bridge_online: bool,
    /// Tier after all caps
    pub effective_tier: Tier,
}

/// Pure decision view over one snapshot
pub struct TierGate<'a> {
    registry: &'a FeatureRegistry,
    tier: Tier,
    hardware_score: u32,
    bridge_online: bool,
    credentials: &'a dyn CredentialView,
}

impl<'a> TierGate<'a> {
    /// Build a gate over the given inputs; `bridge_online` is the debounced
    /// view
    pub fn new(
        registry: &'a FeatureRegistry,
        tier: Tier,
        hardware_score: u32,
        bridge_online: bool,
        credentials: &'a dyn CredentialView,
    ) -> Self {
        Self {
            registry,
            tier,
            hardware_score,
            bridge_online,
            credentials,
        }
    }

    /// Tier after forced downgrades
    ///
    /// Three caps apply, and the minimum wins:
    /// - the hardware floor cap (highest tier whose floor the score meets),
    /// - the feature hardware cap (a tier is blocked while any non-optional
    ///   feature declared at it demands a score the device lacks),
    /// - the bridge cap (when the bridge is debounced-offline, a tier is
    ///   blocked while any non-optional feature declared at it requires the
    ///   bridge).
    pub fn effective_tier(&self) -> Tier {
        let mut effective = self.tier.min(Tier::highest_for_score(self.hardware_score));
        for tier in Tier::ALL {
            if self.tier_blocked(tier) {
                let below = match tier.rank() {
                    0 => Tier::Free,
                    rank => Tier::ALL[rank as usize - 1],
                };
                effective = effective.min(below);
                break;
            }
        }
        effective
    }

    fn tier_blocked(&self, tier: Tier) -> bool {
        self.registry
            .iter()
            .filter(|def| !def.requirement.optional)
            .filter(|def| def.requirement.required_tier == tier)
            .any(|def| {
                let hw_blocked = def
                    .requirement
                    .min_hardware_score
                    .is_some_and(|floor| self.hardware_score < floor);
                let bridge_blocked = def.requirement.requires_bridge && !self.bridge_online;
                hw_blocked || bridge_blocked
            })
    }

    /// Check a single feature; unknown ids are a distinguished deny
    pub fn check(&self, feature: &str) -> Decision {
        let requirement = match self.registry.requirements(feature) {
            Ok(req) => req,
            Err(reason) => return Decision::Deny(reason),
        };

        let effective = self.effective_tier();
        if requirement.required_tier > effective {
            return Decision::Deny(DenyReason::TierBelow {
                required: requirement.required_tier,
                effective,
            });
        }
        if let Some(floor) = requirement.min_hardware_score {
            if self.hardware_score < floor {
                return Decision::Deny(DenyReason::HardwareBelow {
                    required: floor,
                    actual: self.hardware_score,
                });
            }
        }
        if requirement.requires_bridge && !self.bridge_online {
            return Decision::Deny(DenyReason::BridgeRequired);
        }
        for credential in &requirement.required_credentials {
            if !self.credentials.contains(credential) {
                return Decision::Deny(DenyReason::CredentialMissing {
                    credential: credential.clone(),
                });
            }
        }
        Decision::Admit
    }

    /// Visible features in one scope, registry order
    ///
    /// Anything not admitted is excluded silently here; an explicit
    /// [`check`](Self::check) still reports the deny reason.
    pub fn available(&self, scope: Scope) -> Vec<String> {
        self.registry
            .all_in(scope)
            .into_iter()
            .filter(|id| self.check(id).is_admit())
            .map(str::to_string)
            .collect()
    }

    /// The full per-scope feature set
    pub fn feature_set(&self) -> FeatureSet {
        let mut set = FeatureSet::new();
        for scope in Scope::ALL {
            let visible = self.available(scope);
            if !visible.is_empty() {
                set.insert(scope, visible);
            }
        }
        set
    }

    /// The snapshot this gate decides over
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            tier: self.tier,
            hardware_score: self.hardware_score,
            bridge_online: self.bridge_online,
            effective_tier: self.effective_tier(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureRequirement;
    use std::collections::BTreeSet;

    fn registry() -> FeatureRegistry {
        FeatureRegistry::builder(1)
            .feature("chat.basic", FeatureRequirement::tier(Tier::Free))
            .unwrap()
            .feature("chat.mcp", FeatureRequirement::tier(Tier::Pro).with_bridge())
            .unwrap()
            .feature(
                "build.goo-field",
                FeatureRequirement::tier(Tier::Dev)
                    .with_min_score(50)
                    .with_bridge(),
            )
            .unwrap()
            .feature(
                "ai.huggingface",
                FeatureRequirement::tier(Tier::Basic)
                    .with_credential("HF_TOKEN")
                    .optional(),
            )
            .unwrap()
            .build()
    }

    fn no_creds() -> BTreeSet<String> {
        BTreeSet::new()
    }

    #[test]
    fn test_effective_tier_feature_hardware_cap() {
        let registry = registry();
        let creds = no_creds();
        // A dev feature demands score 50; at 30 the dev tier is blocked and
        // the cap lands on pro.
        let gate = TierGate::new(&registry, Tier::Dev, 30, true, &creds);
        assert_eq!(gate.effective_tier(), Tier::Pro);

        let gate = TierGate::new(&registry, Tier::Dev, 60, true, &creds);
        assert_eq!(gate.effective_tier(), Tier::Dev);
    }

    #[test]
    fn test_effective_tier_floor_cap() {
        let registry = registry();
        let creds = no_creds();
        // Dev's hardware floor is 25; a score of 10 caps to pro regardless
        // of feature demands.
        let gate = TierGate::new(&registry, Tier::Dev, 10, true, &creds);
        assert_eq!(gate.effective_tier(), Tier::Pro);
    }

    #[test]
    fn test_effective_tier_bridge_cap() {
        let registry = registry();
        let creds = no_creds();
        // chat.mcp (pro, bridge) blocks pro while the bridge is offline.
        let gate = TierGate::new(&registry, Tier::Pro, 100, false, &creds);
        assert_eq!(gate.effective_tier(), Tier::Basic);
    }

    #[test]
    fn test_effective_tier_cap_applies_above_blocked_tier() {
        let registry = registry();
        let creds = no_creds();
        // The blocked dev tier caps an enterprise request too; a higher
        // requested tier cannot step over the cap.
        let gate = TierGate::new(&registry, Tier::Enterprise, 30, true, &creds);
        assert_eq!(gate.effective_tier(), Tier::Pro);
    }

    #[test]
    fn test_effective_never_exceeds_requested() {
        let registry = registry();
        let creds = no_creds();
        for tier in Tier::ALL {
            for score in [0, 24, 25, 49, 50, 100] {
                for bridge in [true, false] {
                    let gate = TierGate::new(&registry, tier, score, bridge, &creds);
                    assert!(gate.effective_tier() <= tier);
                }
            }
        }
    }

    #[test]
    fn test_check_deny_order_tier_before_hardware() {
        let registry = registry();
        let creds = no_creds();
        // Free tier, low score: tier ranks first among the reasons.
        let gate = TierGate::new(&registry, Tier::Free, 0, true, &creds);
        match gate.check("build.goo-field") {
            Decision::Deny(DenyReason::TierBelow { required, effective }) => {
                assert_eq!(required, Tier::Dev);
                assert_eq!(effective, Tier::Free);
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn test_check_hardware_before_bridge() {
        let registry = FeatureRegistry::builder(1)
            .feature(
                "build.heavy",
                FeatureRequirement::tier(Tier::Free)
                    .with_min_score(50)
                    .with_bridge(),
            )
            .unwrap()
            .build();
        let creds = no_creds();
        let gate = TierGate::new(&registry, Tier::Pro, 10, false, &creds);
        match gate.check("build.heavy") {
            Decision::Deny(DenyReason::HardwareBelow { required, actual }) => {
                assert_eq!(required, 50);
                assert_eq!(actual, 10);
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn test_optional_feature_hidden_but_check_surfaces_reason() {
        let registry = registry();
        let creds = no_creds();
        let gate = TierGate::new(&registry, Tier::Pro, 100, true, &creds);
        // Hidden from the visible set
        assert!(gate.available(Scope::Ai).is_empty());
        // Explicit check still reports why
        assert_eq!(
            gate.check("ai.huggingface"),
            Decision::Deny(DenyReason::CredentialMissing {
                credential: "HF_TOKEN".into()
            })
        );
    }

    #[test]
    fn test_credential_present_admits() {
        let registry = registry();
        let mut creds = BTreeSet::new();
        creds.insert("HF_TOKEN".to_string());
        let gate = TierGate::new(&registry, Tier::Pro, 100, true, &creds);
        assert!(gate.check("ai.huggingface").is_admit());
        assert_eq!(gate.available(Scope::Ai), vec!["ai.huggingface"]);
    }

    #[test]
    fn test_unknown_feature() {
        let registry = registry();
        let creds = no_creds();
        let gate = TierGate::new(&registry, Tier::Enterprise, 100, true, &creds);
        assert_eq!(
            gate.check("chat.unheard-of"),
            Decision::Deny(DenyReason::UnknownFeature {
                feature: "chat.unheard-of".into()
            })
        );
    }

    #[test]
    fn test_delta_between_orders_by_scope_then_registry() {
        let mut old = FeatureSet::new();
        old.insert(Scope::Chat, vec!["chat.basic".into(), "chat.mcp".into()]);
        old.insert(Scope::Doc, vec!["doc.editor".into()]);

        let mut new = FeatureSet::new();
        new.insert(Scope::Chat, vec!["chat.basic".into()]);
        new.insert(Scope::Doc, vec!["doc.editor".into(), "doc.search".into()]);
        new.insert(Scope::Ai, vec!["ai.local".into()]);

        let delta = RotationDelta::between(&old, &new);
        assert_eq!(delta.added, vec!["doc.search", "ai.local"]);
        assert_eq!(delta.removed, vec!["chat.mcp"]);
    }

    #[test]
    fn test_delta_disjoint_and_empty_for_identical_sets() {
        let mut set = FeatureSet::new();
        set.insert(Scope::Chat, vec!["chat.basic".into()]);
        let delta = RotationDelta::between(&set, &set.clone());
        assert!(delta.is_empty());
    }
}
