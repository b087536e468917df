//! The assembled gating core
//!
//! [`CapGate`] owns every component and is the only surface external
//! collaborators see: rotation updates, feature checks, the credential
//! vault, the gateway, the tool router, the audit log, and the export
//! codec. Construction goes through [`CapGateBuilder`].

use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;

use crate::audit::{AuditEntry, AuditKind, AuditLog, AuditQuery};
use crate::config::Config;
use crate::error::{CodecError, Error, Result};
use crate::export::{EndpointExport, ExportRecord, RotationExport, EXPORT_VERSION};
use crate::features::{FeatureRegistry, Scope, Tier};
use crate::gateway::{EndpointId, Gateway, Priority, RequestOptions, Transport};
use crate::mcp::{ExecutionPlan, ScopeLevel, ScopeRouter, ToolDescriptor, ToolHandler};
use crate::rotation::{
    BridgeState, Decision, FeatureSet, RotationDispatcher, RotationEngine, RotationEvent,
    StateSnapshot, StateUpdate, SubscriberError, SubscriptionId, TierGate,
};
use crate::vault::{CredentialVault, Sanitizer};

#[cfg(not(feature = "http-transport"))]
struct UnconfiguredTransport;

#[cfg(not(feature = "http-transport"))]
#[async_trait::async_trait]
impl Transport for UnconfiguredTransport {
    async fn dispatch(
        &self,
        _request: crate::gateway::TransportRequest,
    ) -> std::result::Result<crate::gateway::TransportResponse, crate::gateway::TransportError>
    {
        Err(crate::gateway::TransportError::Network(
            "no transport configured".into(),
        ))
    }
}

/// Builder for [`CapGate`]
pub struct CapGateBuilder {
    config: Config,
    registry: Option<FeatureRegistry>,
    transport: Option<Arc<dyn Transport>>,
    sanitizer: Option<Box<dyn Sanitizer>>,
    tier: Tier,
    hardware_score: u32,
    bridge: BridgeState,
    scope: ScopeLevel,
}

impl CapGateBuilder {
    fn new() -> Self {
        Self {
            config: Config::default(),
            registry: None,
            transport: None,
            sanitizer: None,
            tier: Tier::Free,
            hardware_score: 0,
            bridge: BridgeState::Offline,
            scope: ScopeLevel::Visitor,
        }
    }

    /// Use this configuration instead of defaults
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Use a custom feature registry instead of the built-in catalog
    pub fn registry(mut self, registry: FeatureRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use a custom transport backend
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use a custom credential sanitizer
    pub fn sanitizer(mut self, sanitizer: Box<dyn Sanitizer>) -> Self {
        self.sanitizer = Some(sanitizer);
        self
    }

    /// Initial tier (default free)
    pub fn tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    /// Initial hardware score (default 0)
    pub fn hardware_score(mut self, score: u32) -> Self {
        self.hardware_score = score;
        self
    }

    /// Initial bridge state (default offline)
    pub fn bridge(mut self, bridge: BridgeState) -> Self {
        self.bridge = bridge;
        self
    }

    /// Initial tool scope (default visitor)
    pub fn scope(mut self, scope: ScopeLevel) -> Self {
        self.scope = scope;
        self
    }

    /// Assemble the core
    pub fn build(self) -> CapGate {
        let config = self.config;
        let audit = Arc::new(AuditLog::new(config.audit.max_logs));
        let vault = Arc::new(match self.sanitizer {
            Some(sanitizer) => CredentialVault::with_sanitizer(Arc::clone(&audit), sanitizer),
            None => CredentialVault::new(Arc::clone(&audit)),
        });
        let registry = Arc::new(self.registry.unwrap_or_else(FeatureRegistry::standard));

        #[cfg(feature = "http-transport")]
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(crate::gateway::HttpTransport::new()));
        #[cfg(not(feature = "http-transport"))]
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(UnconfiguredTransport));

        let engine = RotationEngine::new(
            Arc::clone(&registry),
            config.bridge.stable(),
            self.tier,
            self.hardware_score,
            self.bridge,
            &*vault,
        );
        let gateway = Arc::new(Gateway::new(
            &config,
            Arc::clone(&vault),
            Arc::clone(&audit),
            transport,
        ));

        CapGate {
            config,
            registry,
            audit,
            vault,
            rotation: Arc::new(Mutex::new(engine)),
            publish_order: Arc::new(Mutex::new(())),
            dispatcher: Arc::new(RotationDispatcher::new()),
            gateway,
            router: Arc::new(Mutex::new(ScopeRouter::new(self.scope))),
        }
    }
}

/// Capability rotation and access-gating core
#[derive(Clone)]
pub struct CapGate {
    config: Config,
    registry: Arc<FeatureRegistry>,
    audit: Arc<AuditLog>,
    vault: Arc<CredentialVault>,
    rotation: Arc<Mutex<RotationEngine>>,
    // Outermost lock around update/publish so events reach subscribers in
    // publication order.
    publish_order: Arc<Mutex<()>>,
    dispatcher: Arc<RotationDispatcher>,
    gateway: Arc<Gateway>,
    router: Arc<Mutex<ScopeRouter>>,
}

impl CapGate {
    /// Start building a core
    pub fn builder() -> CapGateBuilder {
        CapGateBuilder::new()
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        match mutex.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ------------------------------------------------------------------
    // Rotation & features
    // ------------------------------------------------------------------

    /// Apply a partial state mutation; deltas fan out to subscribers
    ///
    /// Subscribers must not call back into `update` from their callback.
    pub fn update(&self, partial: StateUpdate) {
        let order = Self::lock(&self.publish_order);
        let outcome = Self::lock(&self.rotation).update(partial, &*self.vault);
        self.settle(outcome, order);
    }

    fn apply_tick(&self, generation: u64) {
        let order = Self::lock(&self.publish_order);
        let outcome = Self::lock(&self.rotation).tick(generation, &*self.vault);
        if let Some(outcome) = outcome {
            self.settle(outcome, order);
        }
    }

    fn settle(&self, outcome: crate::rotation::UpdateOutcome, order: MutexGuard<'_, ()>) {
        for event in &outcome.events {
            match event {
                RotationEvent::TierChange { previous, current } => {
                    self.audit.record(
                        AuditKind::TierChange,
                        json!({
                            "previous": previous.to_string(),
                            "current": current.to_string(),
                        }),
                    );
                    // Demote, never promote.
                    Self::lock(&self.router).demote_for(*current);
                }
                RotationEvent::Rotate { delta, .. } => {
                    for feature in &delta.removed {
                        self.gateway.set_enabled_by_feature(feature, false);
                    }
                    for feature in &delta.added {
                        self.gateway.set_enabled_by_feature(feature, true);
                    }
                }
            }
        }
        self.dispatcher.publish(&outcome.events, &self.audit);
        drop(order);

        if let Some(tick) = outcome.debounce {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let core = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep_until(Instant::now() + tick.delay).await;
                    core.apply_tick(tick.generation);
                });
            } else {
                // Without a runtime the flip applies lazily on the next
                // update.
                tracing::debug!("no runtime for debounce timer");
            }
        }
    }

    /// Current rotation snapshot
    pub fn state(&self) -> StateSnapshot {
        Self::lock(&self.rotation).snapshot()
    }

    /// Check one feature against the current state; the decision is audited
    pub fn check_feature(&self, feature: &str) -> Decision {
        let snapshot = self.state();
        let gate = TierGate::new(
            &self.registry,
            snapshot.tier,
            snapshot.hardware_score,
            snapshot.bridge_online,
            &*self.vault,
        );
        let decision = gate.check(feature);
        match &decision {
            Decision::Admit => {
                self.audit
                    .record(AuditKind::Admission, json!({ "feature": feature }));
            }
            Decision::Deny(reason) => {
                self.audit.record(
                    AuditKind::Deny,
                    json!({ "feature": feature, "reason": reason.kind() }),
                );
            }
        }
        decision
    }

    /// The published feature set, optionally narrowed to one scope
    pub fn features(&self, scope: Option<Scope>) -> FeatureSet {
        let published = Self::lock(&self.rotation).published().clone();
        match scope {
            Some(scope) => published
                .into_iter()
                .filter(|(s, _)| *s == scope)
                .collect(),
            None => published,
        }
    }

    /// Subscribe to rotation events
    pub fn subscribe(
        &self,
        callback: impl Fn(&RotationEvent) -> std::result::Result<(), SubscriberError>
            + Send
            + Sync
            + 'static,
    ) -> SubscriptionId {
        self.dispatcher.subscribe(callback)
    }

    /// Remove a subscription; idempotent
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.dispatcher.unsubscribe(id);
    }

    // ------------------------------------------------------------------
    // Component access
    // ------------------------------------------------------------------

    /// The credential vault
    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    /// The gateway
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// The feature registry
    pub fn registry(&self) -> &FeatureRegistry {
        &self.registry
    }

    /// The active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    // ------------------------------------------------------------------
    // Tool router
    // ------------------------------------------------------------------

    /// Register (or replace) a tool
    pub fn register_tool(&self, descriptor: ToolDescriptor, handler: Option<Arc<ToolHandler>>) {
        Self::lock(&self.router).register_tool(descriptor, handler);
    }

    /// Set the tool scope directly (administrative)
    pub fn set_scope(&self, scope: ScopeLevel) {
        Self::lock(&self.router).set_scope(scope);
    }

    /// Current tool scope
    pub fn current_scope(&self) -> ScopeLevel {
        Self::lock(&self.router).current_scope()
    }

    /// Register the bridge endpoint tool dispatch prefers
    pub fn set_bridge_endpoint(&self, endpoint: Option<EndpointId>) {
        Self::lock(&self.router).set_bridge_endpoint(endpoint);
    }

    /// Raise the tool scope; gated by the effective tier and audited
    pub fn elevate(&self, target: ScopeLevel) -> Result<()> {
        let effective = self.state().effective_tier;
        let outcome = Self::lock(&self.router).elevate(target, effective);
        match outcome {
            Ok(()) => {
                self.audit.record(
                    AuditKind::Admission,
                    json!({ "elevation": target.to_string() }),
                );
                Ok(())
            }
            Err(reason) => {
                self.audit.record(
                    AuditKind::Deny,
                    json!({ "elevation": target.to_string(), "reason": reason.kind() }),
                );
                Err(Error::Denied(reason))
            }
        }
    }

    /// Tools executable at the current scope
    pub fn tools_for_current_scope(&self) -> Vec<ToolDescriptor> {
        Self::lock(&self.router).tools_for_current_scope()
    }

    /// Execute a tool; admission consults the tier gate and scope state
    pub async fn execute_tool(
        &self,
        tool_id: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let snapshot = self.state();
        let plan = Self::lock(&self.router).plan(
            tool_id,
            snapshot.effective_tier,
            snapshot.bridge_online,
            &*self.vault,
        );
        match plan {
            Err(reason) => {
                self.audit.record(
                    AuditKind::Deny,
                    json!({ "tool": tool_id, "reason": reason.kind() }),
                );
                Err(Error::Denied(reason))
            }
            Ok(ExecutionPlan::Bridge(endpoint)) => {
                let options = RequestOptions::new()
                    .method(http::Method::POST)
                    .body(params)
                    .priority(Priority::High)
                    .no_cache();
                let response = self
                    .gateway
                    .request(endpoint, &format!("/tools/{tool_id}"), options)
                    .await
                    .map_err(Error::Gateway)?;
                self.audit.record(
                    AuditKind::ToolExec,
                    json!({ "tool": tool_id, "route": "bridge" }),
                );
                Ok(response.data)
            }
            Ok(ExecutionPlan::Local(handler)) => {
                let result = handler(params).map_err(Error::Gateway)?;
                self.audit.record(
                    AuditKind::ToolExec,
                    json!({ "tool": tool_id, "route": "local" }),
                );
                Ok(result)
            }
        }
    }

    // ------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------

    /// Query the audit ring
    pub fn logs(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        self.audit.query(query)
    }

    // ------------------------------------------------------------------
    // Export / import
    // ------------------------------------------------------------------

    /// Serialize policy and catalog state to canonical JSON
    pub fn export_json(&self) -> Result<String> {
        let (snapshot, bridge) = {
            let engine = Self::lock(&self.rotation);
            (engine.snapshot(), engine.reported_bridge())
        };
        let record = ExportRecord {
            version: EXPORT_VERSION,
            rotation_state: RotationExport {
                tier: snapshot.tier,
                hardware_score: snapshot.hardware_score,
                bridge,
                effective_tier: snapshot.effective_tier,
                registry_version: self.registry.version(),
            },
            endpoints: self
                .gateway
                .catalog()
                .iter()
                .map(EndpointExport::from_endpoint)
                .collect(),
            rate_limiter: self.gateway.rate_limiter_config(),
            circuit_breaker: self.gateway.circuit_breaker_config(),
            cache: self.gateway.cache_config(),
        };
        Ok(record.to_canonical_json()?)
    }

    /// Validate and apply an export payload
    ///
    /// On any validation failure current state is untouched. Imported auth
    /// bindings come back unbound; `update_auth` re-binds them.
    pub fn import_json(&self, json: &str) -> Result<()> {
        let record = ExportRecord::from_json(json)?;
        if record.rotation_state.registry_version != self.registry.version() {
            return Err(Error::Codec(CodecError::IncompatibleVersion {
                expected: self.registry.version(),
                found: record.rotation_state.registry_version,
            }));
        }

        self.gateway.configure_rate_limiter(record.rate_limiter);
        self.gateway
            .configure_circuit_breaker(None, record.circuit_breaker);
        self.gateway.configure_cache(record.cache);

        // Replace the catalog.
        for endpoint in self.gateway.catalog() {
            let _ = self.gateway.delete_endpoint(endpoint.id);
        }
        for export in record.endpoints {
            self.gateway
                .install_endpoint(export.into_endpoint())
                .map_err(Error::Gateway)?;
        }

        self.update(
            StateUpdate::none()
                .tier(record.rotation_state.tier)
                .hardware_score(record.rotation_state.hardware_score)
                .bridge(record.rotation_state.bridge),
        );
        tracing::info!("policy state imported");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimiterConfig;
    use crate::error::{DenyReason, GatewayError};
    use crate::features::FeatureRequirement;
    use crate::gateway::transport::testing::{Script, ScriptedTransport};
    use crate::gateway::{CircuitState, EndpointSpec};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn scenario_registry() -> FeatureRegistry {
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

    fn core_with(transport: ScriptedTransport) -> CapGate {
        CapGate::builder()
            .registry(scenario_registry())
            .transport(Arc::new(transport))
            .tier(Tier::Pro)
            .hardware_score(30)
            .bridge(BridgeState::Online)
            .build()
    }

    fn collect_deltas(core: &CapGate) -> Arc<StdMutex<Vec<RotationEvent>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        core.subscribe(move |event| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });
        seen
    }

    // E1 — tier rotation delta
    #[tokio::test]
    async fn test_tier_rotation_delta() {
        let core = core_with(ScriptedTransport::ok(json!(null)));
        let events = collect_deltas(&core);

        core.update(StateUpdate::none().tier(Tier::Dev));
        // Hardware cap holds the effective tier at pro: no events at all.
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(core.state().effective_tier, Tier::Pro);

        core.update(StateUpdate::none().hardware_score(60));
        let seen = events.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(matches!(
            seen[0],
            RotationEvent::TierChange {
                previous: Tier::Pro,
                current: Tier::Dev,
            }
        ));
        match &seen[1] {
            RotationEvent::Rotate { delta, .. } => {
                assert_eq!(delta.added, vec!["build.goo-field"]);
                assert!(delta.removed.is_empty());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    // E2 — bridge debounce
    #[tokio::test(start_paused = true)]
    async fn test_bridge_debounce_flap_is_silent() {
        let core = CapGate::builder()
            .registry(scenario_registry())
            .transport(Arc::new(ScriptedTransport::ok(json!(null))))
            .tier(Tier::Pro)
            .hardware_score(100)
            .bridge(BridgeState::Online)
            .build();
        let events = collect_deltas(&core);

        core.update(StateUpdate::none().bridge(BridgeState::Offline));
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        core.update(StateUpdate::none().bridge(BridgeState::Online));
        tokio::time::sleep(Duration::from_millis(1_000)).await;

        assert!(events.lock().unwrap().is_empty());
        assert!(core.state().bridge_online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bridge_debounce_expiry_emits_removal() {
        let core = CapGate::builder()
            .registry(scenario_registry())
            .transport(Arc::new(ScriptedTransport::ok(json!(null))))
            .tier(Tier::Pro)
            .hardware_score(100)
            .bridge(BridgeState::Online)
            .build();
        let events = collect_deltas(&core);

        core.update(StateUpdate::none().bridge(BridgeState::Offline));
        assert!(events.lock().unwrap().is_empty());

        // Past the stable window the scheduled tick applies the flip.
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        let seen = events.lock().unwrap();
        let rotate = seen
            .iter()
            .find_map(|e| match e {
                RotationEvent::Rotate { delta, state } => Some((delta.clone(), *state)),
                _ => None,
            })
            .expect("rotate event after debounce");
        assert_eq!(rotate.0.removed, vec!["chat.mcp"]);
        assert!(rotate.0.added.is_empty());
        assert!(!rotate.1.bridge_online);
    }

    // E3 — rate limit
    #[tokio::test]
    async fn test_rate_limit_scenario() {
        let core = core_with(ScriptedTransport::ok(json!({"ok": true})));
        core.gateway().configure_rate_limiter(RateLimiterConfig {
            window_ms: 60_000,
            max_requests: 3,
        });
        let id = core
            .gateway()
            .register_endpoint("svc", "https://svc.example.test", EndpointSpec::new())
            .unwrap();

        for _ in 0..3 {
            assert!(core
                .gateway()
                .request(id, "/list", RequestOptions::new())
                .await
                .is_ok());
        }
        for _ in 3..6 {
            let err = core
                .gateway()
                .request(id, "/list", RequestOptions::new())
                .await
                .unwrap_err();
            match err {
                GatewayError::RateLimited { retry_after_ms } => {
                    assert!(retry_after_ms <= 60_000);
                }
                other => panic!("expected rate limit, got {other:?}"),
            }
        }
        // Rate refusals are not circuit failures.
        assert_eq!(
            core.gateway().circuit_status(id).unwrap().state,
            CircuitState::Closed
        );
    }

    // E4 — circuit trip
    #[tokio::test(start_paused = true)]
    async fn test_circuit_trip_scenario() {
        let core = CapGate::builder()
            .registry(scenario_registry())
            .transport(Arc::new(ScriptedTransport::new(vec![
                Script::Respond(500, json!(null)),
                Script::Respond(500, json!(null)),
                Script::Respond(500, json!(null)),
                Script::Respond(200, json!({"up": true})),
            ])))
            .tier(Tier::Pro)
            .hardware_score(30)
            .bridge(BridgeState::Online)
            .build();
        core.gateway().configure_circuit_breaker(
            None,
            crate::config::CircuitBreakerConfig {
                failure_threshold: 3,
                reset_timeout_ms: 1_000,
            },
        );
        let id = core
            .gateway()
            .register_endpoint(
                "svc",
                "https://svc.example.test",
                EndpointSpec::new().retry_budget(0),
            )
            .unwrap();

        for i in 0..3 {
            let _ = core
                .gateway()
                .request(id, &format!("/f/{i}"), RequestOptions::new())
                .await;
        }
        let err = core
            .gateway()
            .request(id, "/f/3", RequestOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "circuit_open");

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        let response = core
            .gateway()
            .request(id, "/probe", RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(response.data, json!({"up": true}));
        assert_eq!(
            core.gateway().circuit_status(id).unwrap().state,
            CircuitState::Closed
        );
    }

    // E5 — scope admission
    #[tokio::test]
    async fn test_scope_admission_scenario() {
        let core = CapGate::builder()
            .registry(scenario_registry())
            .transport(Arc::new(ScriptedTransport::ok(json!(null))))
            .tier(Tier::Basic)
            .hardware_score(100)
            .bridge(BridgeState::Online)
            .scope(ScopeLevel::Micro)
            .build();
        core.register_tool(
            ToolDescriptor::new("template.list", ScopeLevel::Micro),
            Some(Arc::new(|_| Ok(json!(["invoice", "report"])))),
        );
        core.register_tool(
            ToolDescriptor::new("code.generate", ScopeLevel::Builder),
            Some(Arc::new(|_| Ok(json!("fn main() {}")))),
        );

        let result = core.execute_tool("template.list", json!({})).await.unwrap();
        assert_eq!(result, json!(["invoice", "report"]));

        let err = core.execute_tool("code.generate", json!({})).await.unwrap_err();
        match err {
            Error::Denied(DenyReason::ScopeDenied { required, current }) => {
                assert_eq!(required, ScopeLevel::Builder);
                assert_eq!(current, ScopeLevel::Micro);
            }
            other => panic!("unexpected error {other:?}"),
        }

        core.update(StateUpdate::none().tier(Tier::Dev));
        core.elevate(ScopeLevel::Builder).unwrap();
        let result = core.execute_tool("code.generate", json!({})).await.unwrap();
        assert_eq!(result, json!("fn main() {}"));
    }

    // E6 — credential gating
    #[tokio::test]
    async fn test_credential_gating_scenario() {
        let core = core_with(ScriptedTransport::ok(json!(null)));
        let events = collect_deltas(&core);

        assert_eq!(
            core.check_feature("ai.huggingface"),
            Decision::Deny(DenyReason::CredentialMissing {
                credential: "HF_TOKEN".into()
            })
        );
        assert!(core.features(Some(Scope::Ai)).is_empty());

        core.vault().seal("HF_TOKEN", "hf_value");
        // Sealing alone rotates nothing; the explicit no-op update does.
        assert!(events.lock().unwrap().is_empty());
        core.update(StateUpdate::none());

        let seen = events.lock().unwrap();
        match seen.last().expect("rotate event") {
            RotationEvent::Rotate { delta, .. } => {
                assert_eq!(delta.added, vec!["ai.huggingface"]);
            }
            other => panic!("unexpected event {other:?}"),
        }
        drop(seen);
        assert_eq!(
            core.features(Some(Scope::Ai))
                .get(&Scope::Ai)
                .map(Vec::as_slice),
            Some(&["ai.huggingface".to_string()][..])
        );
    }

    #[tokio::test]
    async fn test_tier_change_demotes_scope() {
        let core = CapGate::builder()
            .registry(scenario_registry())
            .transport(Arc::new(ScriptedTransport::ok(json!(null))))
            .tier(Tier::Dev)
            .hardware_score(100)
            .bridge(BridgeState::Online)
            .scope(ScopeLevel::Builder)
            .build();

        core.update(StateUpdate::none().tier(Tier::Basic));
        assert_eq!(core.current_scope(), ScopeLevel::Micro);

        // Coming back up does not auto-promote.
        core.update(StateUpdate::none().tier(Tier::Dev));
        assert_eq!(core.current_scope(), ScopeLevel::Micro);
    }

    #[tokio::test]
    async fn test_feature_gated_endpoint_follows_rotation() {
        let core = core_with(ScriptedTransport::ok(json!(null)));
        let id = core
            .gateway()
            .register_endpoint(
                "bridge-tools",
                "https://bridge.example.test",
                EndpointSpec::new().feature("chat.mcp"),
            )
            .unwrap();
        assert!(core
            .gateway()
            .request(id, "/ping", RequestOptions::new())
            .await
            .is_ok());

        // Dropping to basic removes chat.mcp; the endpoint follows.
        core.update(StateUpdate::none().tier(Tier::Basic));
        let err = core
            .gateway()
            .request(id, "/ping2", RequestOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "endpoint_disabled");

        core.update(StateUpdate::none().tier(Tier::Pro));
        assert!(core
            .gateway()
            .request(id, "/ping3", RequestOptions::new())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_audit_covers_decisions() {
        let core = core_with(ScriptedTransport::ok(json!(null)));
        core.check_feature("chat.basic");
        core.check_feature("build.goo-field");

        let admissions = core.logs(&AuditQuery {
            kind: Some(AuditKind::Admission),
            ..Default::default()
        });
        assert!(admissions
            .iter()
            .any(|e| e.payload["feature"] == "chat.basic"));
        let denies = core.logs(&AuditQuery {
            kind: Some(AuditKind::Deny),
            ..Default::default()
        });
        assert!(denies
            .iter()
            .any(|e| e.payload["feature"] == "build.goo-field"));
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let core = core_with(ScriptedTransport::ok(json!(null)));
        core.gateway()
            .register_endpoint(
                "zeta",
                "https://z.example.test",
                EndpointSpec::new().header("Accept", "application/json"),
            )
            .unwrap();
        core.gateway()
            .register_endpoint("alpha", "https://a.example.test", EndpointSpec::new())
            .unwrap();
        core.gateway().configure_rate_limiter(RateLimiterConfig {
            window_ms: 10_000,
            max_requests: 7,
        });

        let exported = core.export_json().unwrap();

        // Endpoints are sorted by name.
        let value: serde_json::Value = serde_json::from_str(&exported).unwrap();
        let names: Vec<&str> = value["endpoints"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);

        // Import into a fresh core; re-export equals the original.
        let other = core_with(ScriptedTransport::ok(json!(null)));
        other.import_json(&exported).unwrap();
        assert_eq!(other.export_json().unwrap(), exported);
    }

    #[tokio::test]
    async fn test_import_rejects_registry_mismatch() {
        let core = core_with(ScriptedTransport::ok(json!(null)));
        let exported = core.export_json().unwrap();

        let other = CapGate::builder()
            .registry(
                FeatureRegistry::builder(2)
                    .feature("chat.basic", FeatureRequirement::tier(Tier::Free))
                    .unwrap()
                    .build(),
            )
            .transport(Arc::new(ScriptedTransport::ok(json!(null))))
            .build();
        let err = other.import_json(&exported).unwrap_err();
        assert!(matches!(
            err,
            Error::Codec(CodecError::IncompatibleVersion { .. })
        ));
        // Nothing was applied.
        assert!(other.gateway().catalog().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let core = core_with(ScriptedTransport::ok(json!(null)));
        let seen = Arc::new(StdMutex::new(0usize));
        let sink = Arc::clone(&seen);
        let id = core.subscribe(move |_| {
            *sink.lock().unwrap() += 1;
            Ok(())
        });

        core.update(StateUpdate::none().hardware_score(60).tier(Tier::Dev));
        let first = *seen.lock().unwrap();
        assert!(first > 0);

        core.unsubscribe(id);
        core.update(StateUpdate::none().tier(Tier::Basic));
        assert_eq!(*seen.lock().unwrap(), first);
    }
}
