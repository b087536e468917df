//! Error types shared across the gating core
//!
//! Every deny and failure surfaced by the crate is a precise kind; callers
//! (UI, subsystems) are responsible for presenting messages. The core never
//! formats human-facing strings beyond `Display`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::features::Tier;
use crate::mcp::ScopeLevel;

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Why a feature, tool, or elevation was refused
///
/// When several reasons apply at once, admission surfaces the first by the
/// declaration order below (tier before hardware before bridge before
/// credentials).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenyReason {
    /// The effective tier ranks below the feature's required tier
    TierBelow {
        /// Tier the feature requires
        required: Tier,
        /// Effective tier at decision time
        effective: Tier,
    },
    /// The hardware score is below the feature's floor
    HardwareBelow {
        /// Minimum hardware score the feature requires
        required: u32,
        /// Hardware score at decision time
        actual: u32,
    },
    /// The feature requires the bridge and the bridge is offline
    BridgeRequired,
    /// A required credential is not present in the vault
    CredentialMissing {
        /// Name of the first missing credential
        credential: String,
    },
    /// The feature id is not in the registry
    UnknownFeature {
        /// The unrecognized feature id
        feature: String,
    },
    /// The tool's scope (or an elevation target) exceeds what the current
    /// scope and tier admit
    ScopeDenied {
        /// Scope level the operation requires
        required: ScopeLevel,
        /// Scope level currently held
        current: ScopeLevel,
    },
    /// The tool id is not registered
    ToolUnknown {
        /// The unrecognized tool id
        tool: String,
    },
}

impl DenyReason {
    /// Stable snake_case kind string, used in audit payloads
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TierBelow { .. } => "tier_below",
            Self::HardwareBelow { .. } => "hardware_below",
            Self::BridgeRequired => "bridge_required",
            Self::CredentialMissing { .. } => "credential_missing",
            Self::UnknownFeature { .. } => "unknown_feature",
            Self::ScopeDenied { .. } => "scope_denied",
            Self::ToolUnknown { .. } => "tool_unknown",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TierBelow { required, effective } => {
                write!(f, "tier_below (required {required}, effective {effective})")
            }
            Self::HardwareBelow { required, actual } => {
                write!(f, "hardware_below (required {required}, actual {actual})")
            }
            Self::BridgeRequired => write!(f, "bridge_required"),
            Self::CredentialMissing { credential } => {
                write!(f, "credential_missing ({credential})")
            }
            Self::UnknownFeature { feature } => write!(f, "unknown_feature ({feature})"),
            Self::ScopeDenied { required, current } => {
                write!(f, "scope_denied (required {required}, current {current})")
            }
            Self::ToolUnknown { tool } => write!(f, "tool_unknown ({tool})"),
        }
    }
}

/// Gateway pipeline errors
///
/// `RateLimited` and `CircuitOpen` carry an actionable retry horizon;
/// callers choose whether to retry. Network and timeout failures are retried
/// internally within the endpoint's retry budget before being surfaced.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// An endpoint with this name is already registered
    #[error("endpoint already exists: {name}")]
    EndpointExists {
        /// The conflicting endpoint name
        name: String,
    },

    /// No endpoint with this id (or the endpoint is draining for deletion)
    #[error("endpoint not found: {endpoint}")]
    EndpointNotFound {
        /// Endpoint id or name as given by the caller
        endpoint: String,
    },

    /// The endpoint is administratively disabled
    #[error("endpoint disabled: {name}")]
    EndpointDisabled {
        /// The disabled endpoint's name
        name: String,
    },

    /// The endpoint's circuit is open
    #[error("circuit open, retry in {retry_in_ms} ms")]
    CircuitOpen {
        /// Milliseconds until the next probe is admitted
        retry_in_ms: u64,
    },

    /// The endpoint's rate window is exhausted
    #[error("rate limited, retry after {retry_after_ms} ms")]
    RateLimited {
        /// Milliseconds until the window resets
        retry_after_ms: u64,
    },

    /// The request exceeded the endpoint timeout
    #[error("request timed out")]
    Timeout,

    /// Transport-level failure (DNS, connect, TLS, mid-stream)
    #[error("network error: {0}")]
    Network(String),

    /// Non-success HTTP status from the remote
    #[error("http status {code}")]
    HttpStatus {
        /// The status code returned by the remote
        code: u16,
    },

    /// The request was cancelled by the caller
    #[error("request cancelled")]
    Cancelled,

    /// Credential resolution failed while building the request
    #[error("credential resolution failed: {0}")]
    Credential(#[from] VaultError),
}

impl GatewayError {
    /// Stable snake_case kind string, used in audit payloads
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EndpointExists { .. } => "endpoint_exists",
            Self::EndpointNotFound { .. } => "endpoint_not_found",
            Self::EndpointDisabled { .. } => "endpoint_disabled",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout => "timeout",
            Self::Network(_) => "network",
            Self::HttpStatus { .. } => "http_status",
            Self::Cancelled => "cancelled",
            Self::Credential(_) => "credential",
        }
    }
}

/// Credential vault errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VaultError {
    /// No credential with this name, or its handle was revoked
    #[error("unknown credential: {name}")]
    CredentialUnknown {
        /// Name (or handle description) that failed to resolve
        name: String,
    },

    /// Raw value requested outside the gateway request builder
    #[error("credential is sealed")]
    CredentialSealed,
}

/// Export/import codec errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Version mismatch or unrecognized top-level shape; current state is
    /// untouched
    #[error("incompatible export version (expected {expected}, found {found})")]
    IncompatibleVersion {
        /// Version this build reads and writes
        expected: u32,
        /// Version (or best-effort description) found in the payload
        found: u32,
    },

    /// The payload is not a well-formed export record
    #[error("malformed export: {0}")]
    MalformedExport(String),
}

/// Main error type for the crate
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Admission refused
    #[error("admission denied: {0}")]
    Denied(DenyReason),

    /// Gateway pipeline error
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Credential vault error
    #[error(transparent)]
    Vault(#[from] VaultError),

    /// Export/import codec error
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<DenyReason> for Error {
    fn from(reason: DenyReason) -> Self {
        Error::Denied(reason)
    }
}
