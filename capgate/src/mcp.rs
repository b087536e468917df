//! Scope-gated tool router
//!
//! Tools live in a hierarchy of scope levels (visitor < micro < app <
//! builder), each with a tier minimum. A tool executes only when its scope
//! level is within the current scope, the effective tier covers the current
//! scope's minimum, and its credentials are sealed. Dispatch prefers the
//! bridge endpoint when the bridge is online and falls back to a local
//! handler when one is registered.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{DenyReason, GatewayError};
use crate::features::Tier;
use crate::gateway::EndpointId;
use crate::vault::CredentialView;

/// Tool scope hierarchy, totally ordered
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum ScopeLevel {
    /// Unauthenticated browsing
    #[default]
    Visitor,
    /// Small interactions
    Micro,
    /// Full application surface
    App,
    /// Code and system construction
    Builder,
}

impl ScopeLevel {
    /// All levels, ascending
    pub const ALL: [ScopeLevel; 4] = [
        ScopeLevel::Visitor,
        ScopeLevel::Micro,
        ScopeLevel::App,
        ScopeLevel::Builder,
    ];

    /// Minimum tier required to hold this scope
    pub fn required_tier(self) -> Tier {
        match self {
            Self::Visitor => Tier::Free,
            Self::Micro => Tier::Basic,
            Self::App => Tier::Pro,
            Self::Builder => Tier::Dev,
        }
    }

    /// Highest scope a tier may hold
    pub fn highest_for(tier: Tier) -> ScopeLevel {
        let mut best = ScopeLevel::Visitor;
        for level in ScopeLevel::ALL {
            if level.required_tier() <= tier {
                best = level;
            }
        }
        best
    }
}

impl fmt::Display for ScopeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Visitor => write!(f, "visitor"),
            Self::Micro => write!(f, "micro"),
            Self::App => write!(f, "app"),
            Self::Builder => write!(f, "builder"),
        }
    }
}

/// A registered tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool id
    pub id: String,
    /// Scope level required to execute
    pub scope_level: ScopeLevel,
    /// Credentials that must be sealed before execution
    #[serde(default)]
    pub required_credentials: Vec<String>,
    /// JSON schema of the tool input
    #[serde(default)]
    pub input_schema: serde_json::Value,
}

impl ToolDescriptor {
    /// Descriptor with no credentials and an empty schema
    pub fn new(id: impl Into<String>, scope_level: ScopeLevel) -> Self {
        Self {
            id: id.into(),
            scope_level,
            required_credentials: Vec::new(),
            input_schema: serde_json::Value::Null,
        }
    }

    /// Require a sealed credential
    pub fn with_credential(mut self, name: impl Into<String>) -> Self {
        self.required_credentials.push(name.into());
        self
    }

    /// Attach an input schema
    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.input_schema = schema;
        self
    }
}

/// Local fallback handler for a tool
pub type ToolHandler =
    dyn Fn(serde_json::Value) -> Result<serde_json::Value, GatewayError> + Send + Sync + 'static;

/// Where an admitted tool call should go
pub enum ExecutionPlan {
    /// Dispatch through the bridge endpoint
    Bridge(EndpointId),
    /// Run the registered local handler
    Local(Arc<ToolHandler>),
}

struct ToolEntry {
    descriptor: ToolDescriptor,
    handler: Option<Arc<ToolHandler>>,
}

/// Scope state plus the tool table
pub struct ScopeRouter {
    tools: Vec<ToolEntry>,
    index: HashMap<String, usize>,
    current_scope: ScopeLevel,
    bridge_endpoint: Option<EndpointId>,
}

impl ScopeRouter {
    /// Create a router at the given initial scope
    pub fn new(initial_scope: ScopeLevel) -> Self {
        Self {
            tools: Vec::new(),
            index: HashMap::new(),
            current_scope: initial_scope,
            bridge_endpoint: None,
        }
    }

    /// Register (or replace) a tool and its optional local handler
    pub fn register_tool(&mut self, descriptor: ToolDescriptor, handler: Option<Arc<ToolHandler>>) {
        match self.index.get(&descriptor.id) {
            Some(&i) => {
                self.tools[i] = ToolEntry {
                    descriptor,
                    handler,
                };
            }
            None => {
                self.index.insert(descriptor.id.clone(), self.tools.len());
                self.tools.push(ToolEntry {
                    descriptor,
                    handler,
                });
            }
        }
    }

    /// Set the scope directly (administrative; not tier-gated)
    pub fn set_scope(&mut self, scope: ScopeLevel) {
        self.current_scope = scope;
    }

    /// Current scope
    pub fn current_scope(&self) -> ScopeLevel {
        self.current_scope
    }

    /// Register the bridge endpoint tool calls prefer
    pub fn set_bridge_endpoint(&mut self, endpoint: Option<EndpointId>) {
        self.bridge_endpoint = endpoint;
    }

    /// Raise the scope; admitted only when the target's tier minimum is
    /// within the effective tier
    pub fn elevate(
        &mut self,
        target: ScopeLevel,
        effective_tier: Tier,
    ) -> Result<(), DenyReason> {
        if target.required_tier() > effective_tier {
            return Err(DenyReason::ScopeDenied {
                required: target,
                current: self.current_scope,
            });
        }
        tracing::info!(from = %self.current_scope, to = %target, "scope elevated");
        self.current_scope = target;
        Ok(())
    }

    /// Drop to the highest scope the tier still permits; never promotes
    pub fn demote_for(&mut self, effective_tier: Tier) -> Option<(ScopeLevel, ScopeLevel)> {
        let highest = ScopeLevel::highest_for(effective_tier);
        if highest < self.current_scope {
            let previous = self.current_scope;
            self.current_scope = highest;
            tracing::info!(from = %previous, to = %highest, "scope demoted after tier change");
            Some((previous, highest))
        } else {
            None
        }
    }

    /// Tools executable at the current scope
    pub fn tools_for_current_scope(&self) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .filter(|entry| entry.descriptor.scope_level <= self.current_scope)
            .map(|entry| entry.descriptor.clone())
            .collect()
    }

    /// Admit a tool call and plan its dispatch
    pub fn plan(
        &self,
        tool_id: &str,
        effective_tier: Tier,
        bridge_online: bool,
        credentials: &dyn CredentialView,
    ) -> Result<ExecutionPlan, DenyReason> {
        let entry = self
            .index
            .get(tool_id)
            .map(|&i| &self.tools[i])
            .ok_or_else(|| DenyReason::ToolUnknown {
                tool: tool_id.to_string(),
            })?;

        if entry.descriptor.scope_level > self.current_scope {
            return Err(DenyReason::ScopeDenied {
                required: entry.descriptor.scope_level,
                current: self.current_scope,
            });
        }
        if effective_tier < self.current_scope.required_tier() {
            return Err(DenyReason::TierBelow {
                required: self.current_scope.required_tier(),
                effective: effective_tier,
            });
        }
        for credential in &entry.descriptor.required_credentials {
            if !credentials.contains(credential) {
                return Err(DenyReason::CredentialMissing {
                    credential: credential.clone(),
                });
            }
        }

        if bridge_online {
            if let Some(endpoint) = self.bridge_endpoint {
                return Ok(ExecutionPlan::Bridge(endpoint));
            }
        }
        match &entry.handler {
            Some(handler) => Ok(ExecutionPlan::Local(Arc::clone(handler))),
            // Bridge unavailable and no local fallback: the call has
            // nowhere to go.
            None => Err(DenyReason::ToolUnknown {
                tool: tool_id.to_string(),
            }),
        }
    }
}
