//! # capgate
//!
//! Capability rotation and access-gating core: decides, at every call site
//! and every state change, whether a named feature is currently permitted,
//! which external-service call may proceed, and under what rate and failure
//! budget.
//!
//! ## Components
//!
//! - **Rotation**: a reactive state machine over `(tier, hardware score,
//!   bridge)` that recomputes the visible feature set on every update and
//!   emits precise added/removed deltas, with bridge-offline debounce.
//! - **Tier gate**: pure admission decisions (tier, hardware floor, bridge,
//!   credentials) over a versioned feature registry.
//! - **Gateway**: per-endpoint registration with a governed request
//!   pipeline — circuit breaker, fixed-window rate limiter, LRU+TTL
//!   response cache, priority queue, interceptors, retries with jittered
//!   backoff.
//! - **Vault**: sealed credential store; secrets are injected only inside
//!   the gateway's request builder.
//! - **Tool router**: scope hierarchy (visitor < micro < app < builder)
//!   gating tool execution, with tier-gated elevation and automatic
//!   demotion.
//! - **Audit**: bounded ring of every admission decision and gateway event.
//! - **Export**: deterministic serialization of policy and catalog state.
//!
//! ## Example
//!
//! ```rust,no_run
//! use capgate::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> capgate::Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let core = CapGate::builder()
//!         .config(config)
//!         .tier(Tier::Pro)
//!         .hardware_score(60)
//!         .bridge(BridgeState::Online)
//!         .build();
//!
//!     core.vault().seal("HF_TOKEN", "hf_...");
//!     core.update(StateUpdate::none());
//!
//!     if core.check_feature("ai.huggingface").is_admit() {
//!         let id = core.gateway().register_endpoint(
//!             "huggingface",
//!             "https://huggingface.co/api",
//!             EndpointSpec::new(),
//!         )?;
//!         let response = core
//!             .gateway()
//!             .request(id, "/models", RequestOptions::new())
//!             .await?;
//!         println!("{}", response.data);
//!     }
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod config;
pub mod core;
pub mod error;
pub mod export;
pub mod features;
pub mod gateway;
pub mod mcp;
pub mod observability;
pub mod rotation;
pub mod vault;

pub use crate::core::{CapGate, CapGateBuilder};
pub use crate::error::{Error, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::audit::{AuditEntry, AuditKind, AuditQuery};
    pub use crate::config::Config;
    pub use crate::core::{CapGate, CapGateBuilder};
    pub use crate::error::{CodecError, DenyReason, Error, GatewayError, Result, VaultError};
    pub use crate::features::{FeatureRegistry, FeatureRequirement, Scope, Tier};
    pub use crate::gateway::{
        AuthScheme, Endpoint, EndpointAuth, EndpointId, EndpointKind, EndpointSpec,
        GatewayResponse, Priority, RequestOptions,
    };
    pub use crate::mcp::{ScopeLevel, ToolDescriptor};
    pub use crate::observability::{init_tracing, shutdown_tracing};
    pub use crate::rotation::{
        BridgeState, Decision, RotationDelta, RotationEvent, StateSnapshot, StateUpdate,
    };
    pub use crate::vault::{CredentialHandle, CredentialVault};
}
