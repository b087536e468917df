//! Append-only audit ring
//!
//! Every admission decision and gateway event lands here exactly once, in a
//! bounded ring. Entries carry endpoint/tool/feature identifiers only;
//! credential values are never logged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

/// Categories of audit entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// An operation was admitted
    Admission,
    /// An operation was refused
    Deny,
    /// A request hit the rate window
    RateLimited,
    /// A circuit tripped open
    CircuitOpen,
    /// A circuit closed after a successful probe
    CircuitClose,
    /// A tool was dispatched
    ToolExec,
    /// The effective tier moved
    TierChange,
    /// A credential was rotated
    CredentialRotated,
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admission => write!(f, "admission"),
            Self::Deny => write!(f, "deny"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::CircuitOpen => write!(f, "circuit_open"),
            Self::CircuitClose => write!(f, "circuit_close"),
            Self::ToolExec => write!(f, "tool_exec"),
            Self::TierChange => write!(f, "tier_change"),
            Self::CredentialRotated => write!(f, "credential_rotated"),
        }
    }
}

/// A single audit entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the entry was recorded
    pub timestamp: DateTime<Utc>,
    /// Entry category
    pub kind: AuditKind,
    /// Structured context (identifiers, reasons, outcomes)
    pub payload: serde_json::Value,
}

/// Query filters for [`AuditLog::query`]
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    /// Only entries of this kind
    pub kind: Option<AuditKind>,
    /// Only entries at or after this timestamp
    pub since: Option<DateTime<Utc>>,
    /// At most this many entries (most recent win)
    pub limit: Option<usize>,
}

/// Bounded append-only ring of audit entries
#[derive(Debug)]
pub struct AuditLog {
    max_logs: usize,
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl AuditLog {
    /// Create a ring bounded at `max_logs` entries
    pub fn new(max_logs: usize) -> Self {
        Self {
            max_logs: max_logs.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Append an entry, evicting the oldest beyond the bound
    pub fn record(&self, kind: AuditKind, payload: serde_json::Value) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            kind,
            payload,
        };
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.len() == self.max_logs {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Snapshot matching entries, oldest first
    pub fn query(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        let entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut matched: Vec<AuditEntry> = entries
            .iter()
            .filter(|e| query.kind.is_none_or(|k| e.kind == k))
            .filter(|e| query.since.is_none_or(|since| e.timestamp >= since))
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            let excess = matched.len().saturating_sub(limit);
            matched.drain(..excess);
        }
        matched
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        match self.entries.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Whether the ring is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_and_query() {
        let log = AuditLog::new(10);
        log.record(AuditKind::Admission, json!({"feature": "chat.basic"}));
        log.record(AuditKind::Deny, json!({"feature": "chat.mcp"}));

        let all = log.query(&AuditQuery::default());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].kind, AuditKind::Admission);

        let denies = log.query(&AuditQuery {
            kind: Some(AuditKind::Deny),
            ..Default::default()
        });
        assert_eq!(denies.len(), 1);
        assert_eq!(denies[0].payload["feature"], "chat.mcp");
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let log = AuditLog::new(3);
        for i in 0..5 {
            log.record(AuditKind::Admission, json!({"seq": i}));
        }
        let all = log.query(&AuditQuery::default());
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].payload["seq"], 2);
        assert_eq!(all[2].payload["seq"], 4);
    }

    #[test]
    fn test_limit_keeps_most_recent() {
        let log = AuditLog::new(10);
        for i in 0..5 {
            log.record(AuditKind::Admission, json!({"seq": i}));
        }
        let recent = log.query(&AuditQuery {
            limit: Some(2),
            ..Default::default()
        });
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].payload["seq"], 3);
        assert_eq!(recent[1].payload["seq"], 4);
    }

    #[test]
    fn test_since_filter() {
        let log = AuditLog::new(10);
        log.record(AuditKind::Admission, json!({"seq": 0}));
        let cutoff = Utc::now();
        log.record(AuditKind::Admission, json!({"seq": 1}));

        let after = log.query(&AuditQuery {
            since: Some(cutoff),
            ..Default::default()
        });
        assert!(after.iter().all(|e| e.timestamp >= cutoff));
        assert!(after.len() <= 2);
        assert_eq!(after.last().unwrap().payload["seq"], 1);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(AuditKind::RateLimited.to_string(), "rate_limited");
        assert_eq!(AuditKind::CredentialRotated.to_string(), "credential_rotated");
    }
}
