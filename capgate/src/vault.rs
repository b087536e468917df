//! Sealed credential store
//!
//! Secrets enter through [`CredentialVault::seal`] and are only ever read
//! back inside the gateway's request builder (a `pub(crate)` boundary).
//! Everything callers can observe — listings, handles, audit entries — is
//! name-only.

use dashmap::DashMap;
use secrecy::SecretString;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditKind, AuditLog};
use crate::error::VaultError;

/// Normalizes raw credential input before sealing
///
/// Injected so embedders can supply their own policy; the default strips
/// invisible characters, folds fullwidth ASCII, and trims whitespace.
pub trait Sanitizer: Send + Sync {
    /// Return the normalized form of `raw`
    fn sanitize(&self, raw: &str) -> String;
}

/// Default sanitizer: trim, strip zero-width characters, fold fullwidth
/// ASCII to its plain form
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardSanitizer;

impl Sanitizer for StandardSanitizer {
    fn sanitize(&self, raw: &str) -> String {
        raw.chars()
            .filter(|c| !matches!(c, '\u{200B}'..='\u{200D}' | '\u{FEFF}' | '\u{2060}'))
            .map(|c| match c {
                // Fullwidth ASCII block folds onto the ASCII range
                '\u{FF01}'..='\u{FF5E}' => {
                    char::from_u32(c as u32 - 0xFF01 + 0x21).unwrap_or(c)
                }
                '\u{3000}' => ' ',
                _ => c,
            })
            .collect::<String>()
            .trim()
            .to_string()
    }
}

/// Opaque reference to a sealed credential
///
/// Handles are dereferenced only inside the gateway; outside it they are
/// just identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CredentialHandle(Uuid);

/// Result of sealing a credential
#[derive(Debug, Clone, Copy)]
pub struct SealOutcome {
    /// Handle for binding the credential to endpoints
    pub handle: CredentialHandle,
    /// Whether the stored value differs from the raw input
    pub normalized: bool,
}

struct Entry {
    secret: Arc<SecretString>,
    handle: Uuid,
}

/// Sealed key/value credential store
pub struct CredentialVault {
    sanitizer: Box<dyn Sanitizer>,
    entries: DashMap<String, Entry>,
    handles: DashMap<Uuid, String>,
    audit: Arc<AuditLog>,
}

impl CredentialVault {
    /// Create a vault with the default sanitizer
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self::with_sanitizer(audit, Box::new(StandardSanitizer))
    }

    /// Create a vault with a custom sanitizer
    pub fn with_sanitizer(audit: Arc<AuditLog>, sanitizer: Box<dyn Sanitizer>) -> Self {
        Self {
            sanitizer,
            entries: DashMap::new(),
            handles: DashMap::new(),
            audit,
        }
    }

    /// Seal a credential under `name`, replacing any previous value
    ///
    /// The raw value is normalized first; when normalization changed it, the
    /// sanitized form is stored and the change is reported on the outcome.
    pub fn seal(&self, name: &str, raw: &str) -> SealOutcome {
        let sanitized = self.sanitizer.sanitize(raw);
        let normalized = sanitized != raw;
        if normalized {
            tracing::warn!(credential = name, "credential input normalized before sealing");
        }

        let handle = Uuid::new_v4();
        if let Some(previous) = self.entries.insert(
            name.to_string(),
            Entry {
                secret: Arc::new(SecretString::from(sanitized)),
                handle,
            },
        ) {
            self.handles.remove(&previous.handle);
        }
        self.handles.insert(handle, name.to_string());

        SealOutcome {
            handle: CredentialHandle(handle),
            normalized,
        }
    }

    /// Replace the value under an existing name; the old handle stops
    /// resolving
    pub fn rotate(&self, name: &str, raw_new: &str) -> Result<CredentialHandle, VaultError> {
        if !self.entries.contains_key(name) {
            return Err(VaultError::CredentialUnknown {
                name: name.to_string(),
            });
        }
        let outcome = self.seal(name, raw_new);
        self.audit.record(
            AuditKind::CredentialRotated,
            serde_json::json!({ "credential": name }),
        );
        tracing::info!(credential = name, "credential rotated");
        Ok(outcome.handle)
    }

    /// Remove a credential; its handles stop resolving immediately
    pub fn revoke(&self, name: &str) -> Result<(), VaultError> {
        match self.entries.remove(name) {
            Some((_, entry)) => {
                self.handles.remove(&entry.handle);
                tracing::info!(credential = name, "credential revoked");
                Ok(())
            }
            None => Err(VaultError::CredentialUnknown {
                name: name.to_string(),
            }),
        }
    }

    /// Names of sealed credentials, sorted; values are never returned
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Whether a credential is currently sealed under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Dereference a handle to its raw value
    ///
    /// Crate-private: only the gateway request builder may call this. A
    /// handle whose name was revoked or re-sealed fails without touching
    /// secret memory.
    pub(crate) fn resolve(
        &self,
        handle: &CredentialHandle,
    ) -> Result<Arc<SecretString>, VaultError> {
        let name = self
            .handles
            .get(&handle.0)
            .map(|n| n.value().clone())
            .ok_or(VaultError::CredentialSealed)?;
        let entry = self
            .entries
            .get(&name)
            .ok_or(VaultError::CredentialUnknown { name: name.clone() })?;
        if entry.handle != handle.0 {
            return Err(VaultError::CredentialSealed);
        }
        Ok(Arc::clone(&entry.secret))
    }
}

/// Read-only view of credential presence, used by admission checks
///
/// Checks see names only; they can never observe values.
pub trait CredentialView: Send + Sync {
    /// Whether a credential with this name is present
    fn contains(&self, name: &str) -> bool;
}

impl CredentialView for CredentialVault {
    fn contains(&self, name: &str) -> bool {
        CredentialVault::contains(self, name)
    }
}

impl CredentialView for std::collections::BTreeSet<String> {
    fn contains(&self, name: &str) -> bool {
        std::collections::BTreeSet::contains(self, name)
    }
}

#[cfg(test)]
pub(crate) fn expose_for_tests(secret: &SecretString) -> &str {
    use secrecy::ExposeSecret;
    secret.expose_secret()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> CredentialVault {
        CredentialVault::new(Arc::new(AuditLog::new(16)))
    }

    #[test]
    fn test_seal_and_resolve() {
        let vault = vault();
        let outcome = vault.seal("HF_TOKEN", "hf_abc123");
        assert!(!outcome.normalized);
        let secret = vault.resolve(&outcome.handle).unwrap();
        assert_eq!(expose_for_tests(&secret), "hf_abc123");
    }

    #[test]
    fn test_sanitizer_normalizes_input() {
        let vault = vault();
        let outcome = vault.seal("PORKBUN_KEY", "  pk1_\u{200B}secret\u{FF41}  ");
        assert!(outcome.normalized);
        let secret = vault.resolve(&outcome.handle).unwrap();
        assert_eq!(expose_for_tests(&secret), "pk1_secreta");
    }

    #[test]
    fn test_list_names_only_sorted() {
        let vault = vault();
        vault.seal("KAGGLE_KEY", "k");
        vault.seal("HF_TOKEN", "h");
        assert_eq!(vault.list(), vec!["HF_TOKEN", "KAGGLE_KEY"]);
    }

    #[test]
    fn test_revoked_handle_stops_resolving() {
        let vault = vault();
        let outcome = vault.seal("HF_TOKEN", "h");
        vault.revoke("HF_TOKEN").unwrap();
        assert!(!vault.contains("HF_TOKEN"));
        assert!(vault.resolve(&outcome.handle).is_err());
    }

    #[test]
    fn test_reseal_invalidates_old_handle() {
        let vault = vault();
        let old = vault.seal("HF_TOKEN", "one");
        let new = vault.seal("HF_TOKEN", "two");
        assert!(vault.resolve(&old.handle).is_err());
        let secret = vault.resolve(&new.handle).unwrap();
        assert_eq!(expose_for_tests(&secret), "two");
    }

    #[test]
    fn test_rotate_requires_existing_name() {
        let vault = vault();
        let err = vault.rotate("NOPE", "value").unwrap_err();
        assert_eq!(
            err,
            VaultError::CredentialUnknown {
                name: "NOPE".into()
            }
        );
    }

    #[test]
    fn test_rotate_audits() {
        let audit = Arc::new(AuditLog::new(16));
        let vault = CredentialVault::new(Arc::clone(&audit));
        vault.seal("HF_TOKEN", "one");
        vault.rotate("HF_TOKEN", "two").unwrap();
        let entries = audit.query(&crate::audit::AuditQuery {
            kind: Some(AuditKind::CredentialRotated),
            ..Default::default()
        });
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload["credential"], "HF_TOKEN");
    }

    #[test]
    fn test_credential_view_for_sets() {
        let mut set = std::collections::BTreeSet::new();
        set.insert("HF_TOKEN".to_string());
        let view: &dyn CredentialView = &set;
        assert!(view.contains("HF_TOKEN"));
        assert!(!view.contains("KAGGLE_KEY"));
    }
}
