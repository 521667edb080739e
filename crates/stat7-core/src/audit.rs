use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::coordinate::Classification;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Recover,
    BoundaryRepair,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recover => "recover",
            Self::BoundaryRepair => "boundary_repair",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditResult {
    Success,
    Denied,
}

impl AuditResult {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Denied => "DENIED",
        }
    }
}

/// How much of a record a successful recovery releases. Ordered from least to most.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapabilityLevel {
    Compressed,
    Partial,
    Full,
}

impl CapabilityLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compressed => "COMPRESSED",
            Self::Partial => "PARTIAL",
            Self::Full => "FULL",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "COMPRESSED" => Some(Self::Compressed),
            "PARTIAL" => Some(Self::Partial),
            "FULL" => Some(Self::Full),
            _ => None,
        }
    }
}

/// Why a recovery was refused.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum DenialKind {
    NotFound,
    IntegrityFailure,
    ProvenanceFailure,
    AuthenticationFailure,
    IntentRequired,
    PolicyDenied,
    SecondFactorRequired,
    RateLimitExceeded,
}

impl DenialKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::IntegrityFailure => "IntegrityFailure",
            Self::ProvenanceFailure => "ProvenanceFailure",
            Self::AuthenticationFailure => "AuthenticationFailure",
            Self::IntentRequired => "IntentRequired",
            Self::PolicyDenied => "PolicyDenied",
            Self::SecondFactorRequired => "SecondFactorRequired",
            Self::RateLimitExceeded => "RateLimitExceeded",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub event_id: String,
    pub action: AuditAction,
    pub bitchain_id: String,
    pub requester_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_level: Option<CapabilityLevel>,
    pub result: AuditResult,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denial_kind: Option<DenialKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl AuditEvent {
    /// Fresh event stamped with a new ULID and the current UTC time.
    #[must_use]
    pub fn new(
        action: AuditAction,
        bitchain_id: impl Into<String>,
        requester_id: impl Into<String>,
        result: AuditResult,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Ulid::new().to_string(),
            action,
            bitchain_id: bitchain_id.into(),
            requester_id: requester_id.into(),
            timestamp: OffsetDateTime::now_utc(),
            classification: None,
            capability_level: None,
            result,
            reason: reason.into(),
            denial_kind: None,
            request_id: None,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("audit ledger io error: {0}")]
    Io(String),
    #[error("audit ledger serialization error: {0}")]
    Serialization(String),
    #[error("audit ledger is corrupted at line {line}: {detail}")]
    Corrupted { line: usize, detail: String },
    #[error("audit ledger backend error: {0}")]
    Backend(String),
}

/// Append-only sink for audit events. `append` returns only once the event is
/// durable; callers treat any error as "not recorded".
pub trait AuditLedger: Send + Sync {
    /// # Errors
    /// Returns `LedgerError` when the event could not be durably recorded.
    fn append(&self, event: &AuditEvent) -> Result<(), LedgerError>;

    /// # Errors
    /// Returns `LedgerError` when stored events cannot be read back.
    fn events(&self) -> Result<Vec<AuditEvent>, LedgerError>;
}

#[derive(Debug, Default)]
pub struct MemoryAuditLedger {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditLedger for MemoryAuditLedger {
    fn append(&self, event: &AuditEvent) -> Result<(), LedgerError> {
        self.events
            .lock()
            .map_err(|_| LedgerError::Backend("audit ledger lock poisoned".to_string()))?
            .push(event.clone());
        Ok(())
    }

    fn events(&self) -> Result<Vec<AuditEvent>, LedgerError> {
        Ok(self
            .events
            .lock()
            .map_err(|_| LedgerError::Backend("audit ledger lock poisoned".to_string()))?
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test IDs: TAUD-001
    #[test]
    fn audit_event_serializes_with_wire_names() {
        let mut event = AuditEvent::new(
            AuditAction::Recover,
            "a".repeat(64),
            "alice",
            AuditResult::Denied,
            "role not permitted",
        );
        event.denial_kind = Some(DenialKind::PolicyDenied);
        event.capability_level = Some(CapabilityLevel::Partial);
        event.classification = Some(Classification::Sensitive);

        let value = match serde_json::to_value(&event) {
            Ok(value) => value,
            Err(err) => panic!("serialization failed: {err}"),
        };
        assert_eq!(value["action"], "recover");
        assert_eq!(value["result"], "DENIED");
        assert_eq!(value["denial_kind"], "PolicyDenied");
        assert_eq!(value["capability_level"], "PARTIAL");
        assert_eq!(value["classification"], "SENSITIVE");
        assert!(value.get("request_id").is_none());
    }

    // Test IDs: TAUD-002
    #[test]
    fn memory_ledger_preserves_append_order() -> Result<(), LedgerError> {
        let ledger = MemoryAuditLedger::new();
        for requester in ["first", "second", "third"] {
            ledger.append(&AuditEvent::new(
                AuditAction::Recover,
                "b".repeat(64),
                requester,
                AuditResult::Success,
                "ok",
            ))?;
        }
        let requesters = ledger
            .events()?
            .into_iter()
            .map(|event| event.requester_id)
            .collect::<Vec<_>>();
        assert_eq!(requesters, vec!["first", "second", "third"]);
        Ok(())
    }

    // Test IDs: TAUD-003
    #[test]
    fn capability_levels_order_from_compressed_to_full() {
        assert!(CapabilityLevel::Compressed < CapabilityLevel::Partial);
        assert!(CapabilityLevel::Partial < CapabilityLevel::Full);
        assert_eq!(CapabilityLevel::parse("full"), Some(CapabilityLevel::Full));
    }
}
