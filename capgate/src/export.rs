//! Deterministic export/import of policy and catalog state
//!
//! The export record carries the endpoint catalog (no secrets, no
//! `Authorization` headers), limiter/breaker/cache settings, and the
//! rotation state. Field order is fixed by the record structs and arrays
//! are sorted, so equal states serialize to byte-equal JSON. Import
//! validates shape and version before anything touches live state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::{CacheConfig, CircuitBreakerConfig, RateLimiterConfig};
use crate::error::CodecError;
use crate::features::Tier;
use crate::gateway::{AuthScheme, Endpoint, EndpointId, EndpointKind};
use crate::rotation::BridgeState;

/// Version this build reads and writes
pub const EXPORT_VERSION: u32 = 1;

/// Rotation state as exported (credentials excluded by construction)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationExport {
    /// Stored tier
    pub tier: Tier,
    /// Hardware score
    pub hardware_score: u32,
    /// Reported bridge state
    pub bridge: BridgeState,
    /// Effective tier at export time
    pub effective_tier: Tier,
    /// Registry version identifier (contents are not exported)
    pub registry_version: u32,
}

/// One endpoint catalog row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointExport {
    /// Endpoint id
    pub id: EndpointId,
    /// Unique name
    pub name: String,
    /// Base URL
    pub base_url: String,
    /// Protocol family
    pub kind: EndpointKind,
    /// Auth scheme only; credential bindings never leave the vault
    #[serde(default)]
    pub auth: Option<AuthScheme>,
    /// Default headers, `Authorization` removed
    pub headers: BTreeMap<String, String>,
    /// Request timeout
    pub timeout_ms: u64,
    /// Retry budget
    pub retry_budget: u32,
    /// Enablement flag
    pub enabled: bool,
    /// Gating feature, when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
}

impl EndpointExport {
    /// Strip a live endpoint down to its exportable record
    pub fn from_endpoint(endpoint: &Endpoint) -> Self {
        let headers = endpoint
            .default_headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("authorization"))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Self {
            id: endpoint.id,
            name: endpoint.name.clone(),
            base_url: endpoint.base_url.clone(),
            kind: endpoint.kind,
            auth: endpoint.auth.as_ref().map(|auth| auth.scheme.clone()),
            headers,
            timeout_ms: endpoint.timeout_ms,
            retry_budget: endpoint.retry_budget,
            enabled: endpoint.enabled,
            feature: endpoint.feature.clone(),
        }
    }

    /// Rebuild a live endpoint; auth comes back unbound
    pub fn into_endpoint(self) -> Endpoint {
        Endpoint {
            id: self.id,
            name: self.name,
            base_url: self.base_url,
            kind: self.kind,
            auth: self.auth.map(|scheme| crate::gateway::EndpointAuth {
                scheme,
                credential: None,
            }),
            default_headers: self.headers,
            timeout_ms: self.timeout_ms,
            retry_budget: self.retry_budget,
            enabled: self.enabled,
            feature: self.feature,
        }
    }
}

/// The full export record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRecord {
    /// Format version
    pub version: u32,
    /// Rotation state
    pub rotation_state: RotationExport,
    /// Endpoint catalog, sorted by name
    pub endpoints: Vec<EndpointExport>,
    /// Rate limiter settings
    pub rate_limiter: RateLimiterConfig,
    /// Circuit breaker default settings
    pub circuit_breaker: CircuitBreakerConfig,
    /// Cache settings
    pub cache: CacheConfig,
}

const TOP_LEVEL_KEYS: &[&str] = &[
    "version",
    "rotation_state",
    "endpoints",
    "rate_limiter",
    "circuit_breaker",
    "cache",
];
const ROTATION_KEYS: &[&str] = &[
    "tier",
    "hardware_score",
    "bridge",
    "effective_tier",
    "registry_version",
];
const ENDPOINT_KEYS: &[&str] = &[
    "id",
    "name",
    "base_url",
    "kind",
    "auth",
    "headers",
    "timeout_ms",
    "retry_budget",
    "enabled",
    "feature",
];
const RATE_KEYS: &[&str] = &["window_ms", "max_requests"];
const CIRCUIT_KEYS: &[&str] = &["failure_threshold", "reset_timeout_ms"];
const CACHE_KEYS: &[&str] = &["ttl_ms", "max_size"];

impl ExportRecord {
    /// Serialize to canonical JSON
    pub fn to_canonical_json(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|e| CodecError::MalformedExport(e.to_string()))
    }

    /// Parse and validate an export payload
    ///
    /// Unknown fields and version mismatches are `IncompatibleVersion`;
    /// structural problems are `MalformedExport`. Nothing is applied here.
    pub fn from_json(json: &str) -> Result<ExportRecord, CodecError> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| CodecError::MalformedExport(e.to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| CodecError::MalformedExport("top level must be an object".into()))?;

        let found = object
            .get("version")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        check_keys(object.keys(), TOP_LEVEL_KEYS, found)?;
        if found != EXPORT_VERSION {
            return Err(CodecError::IncompatibleVersion {
                expected: EXPORT_VERSION,
                found,
            });
        }

        if let Some(rotation) = object.get("rotation_state").and_then(Value::as_object) {
            check_keys(rotation.keys(), ROTATION_KEYS, found)?;
        }
        if let Some(endpoints) = object.get("endpoints").and_then(Value::as_array) {
            for endpoint in endpoints {
                if let Some(endpoint) = endpoint.as_object() {
                    check_keys(endpoint.keys(), ENDPOINT_KEYS, found)?;
                }
            }
        }
        for (section, keys) in [
            ("rate_limiter", RATE_KEYS),
            ("circuit_breaker", CIRCUIT_KEYS),
            ("cache", CACHE_KEYS),
        ] {
            if let Some(section) = object.get(section).and_then(Value::as_object) {
                check_keys(section.keys(), keys, found)?;
            }
        }

        serde_json::from_value(value).map_err(|e| CodecError::MalformedExport(e.to_string()))
    }
}

fn check_keys<'a>(
    keys: impl Iterator<Item = &'a String>,
    known: &[&str],
    found_version: u32,
) -> Result<(), CodecError> {
    for key in keys {
        if !known.contains(&key.as_str()) {
            return Err(CodecError::IncompatibleVersion {
                expected: EXPORT_VERSION,
                found: found_version,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::EndpointAuth;
    use crate::vault::CredentialVault;

    fn sample() -> ExportRecord {
        ExportRecord {
            version: EXPORT_VERSION,
            rotation_state: RotationExport {
                tier: Tier::Pro,
                hardware_score: 60,
                bridge: BridgeState::Online,
                effective_tier: Tier::Pro,
                registry_version: 1,
            },
            endpoints: vec![EndpointExport {
                id: EndpointId::generate(),
                name: "hf".into(),
                base_url: "https://hf.example.test".into(),
                kind: EndpointKind::Rest,
                auth: Some(AuthScheme::Bearer),
                headers: BTreeMap::new(),
                timeout_ms: 30_000,
                retry_budget: 2,
                enabled: true,
                feature: None,
            }],
            rate_limiter: RateLimiterConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            cache: CacheConfig::default(),
        }
    }

    #[test]
    fn test_round_trip_is_identity() {
        let record = sample();
        let json = record.to_canonical_json().unwrap();
        let parsed = ExportRecord::from_json(&json).unwrap();
        assert_eq!(parsed, record);
        // Determinism: re-serializing yields byte-equal output.
        assert_eq!(parsed.to_canonical_json().unwrap(), json);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut record = sample();
        record.version = 9;
        let json = record.to_canonical_json().unwrap();
        let err = ExportRecord::from_json(&json).unwrap_err();
        assert_eq!(
            err,
            CodecError::IncompatibleVersion {
                expected: EXPORT_VERSION,
                found: 9
            }
        );
    }

    #[test]
    fn test_unknown_top_level_field_rejected() {
        let json = r#"{"version":1,"rotation_state":{"tier":"free","hardware_score":0,"bridge":"online","effective_tier":"free","registry_version":1},"endpoints":[],"rate_limiter":{"window_ms":60000,"max_requests":100},"circuit_breaker":{"failure_threshold":5,"reset_timeout_ms":30000},"cache":{"ttl_ms":300000,"max_size":500},"surprise":true}"#;
        let err = ExportRecord::from_json(json).unwrap_err();
        assert!(matches!(err, CodecError::IncompatibleVersion { .. }));
    }

    #[test]
    fn test_unknown_nested_field_rejected() {
        let json = r#"{"version":1,"rotation_state":{"tier":"free","hardware_score":0,"bridge":"online","effective_tier":"free","registry_version":1,"mystery":1},"endpoints":[],"rate_limiter":{"window_ms":60000,"max_requests":100},"circuit_breaker":{"failure_threshold":5,"reset_timeout_ms":30000},"cache":{"ttl_ms":300000,"max_size":500}}"#;
        let err = ExportRecord::from_json(json).unwrap_err();
        assert!(matches!(err, CodecError::IncompatibleVersion { .. }));
    }

    #[test]
    fn test_malformed_payload() {
        assert!(matches!(
            ExportRecord::from_json("not json"),
            Err(CodecError::MalformedExport(_))
        ));
        assert!(matches!(
            ExportRecord::from_json("[1,2,3]"),
            Err(CodecError::MalformedExport(_))
        ));
    }

    #[test]
    fn test_authorization_header_stripped() {
        let audit = std::sync::Arc::new(crate::audit::AuditLog::new(4));
        let vault = CredentialVault::new(audit);
        let outcome = vault.seal("T", "secret");
        assert!(vault.contains("T"));

        let endpoint = Endpoint {
            id: EndpointId::generate(),
            name: "svc".into(),
            base_url: "https://svc.example.test".into(),
            kind: EndpointKind::Rest,
            auth: Some(EndpointAuth::bearer(outcome.handle)),
            default_headers: BTreeMap::from([
                ("Authorization".to_string(), "Bearer leak".to_string()),
                ("Accept".to_string(), "application/json".to_string()),
            ]),
            timeout_ms: 30_000,
            retry_budget: 2,
            enabled: true,
            feature: None,
        };

        let export = EndpointExport::from_endpoint(&endpoint);
        assert!(!export.headers.contains_key("Authorization"));
        assert!(export.headers.contains_key("Accept"));
        assert_eq!(export.auth, Some(AuthScheme::Bearer));

        let json = serde_json::to_string(&export).unwrap();
        assert!(!json.contains("secret"));
        assert!(!json.contains("leak"));
    }

    #[test]
    fn test_import_restores_unbound_auth() {
        let export = sample();
        let endpoint = export.endpoints[0].clone().into_endpoint();
        let auth = endpoint.auth.unwrap();
        assert_eq!(auth.scheme, AuthScheme::Bearer);
        assert!(auth.credential.is_none());
    }
}
