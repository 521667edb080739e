use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stat7_core::{
    verify_signature, Address, AuditAction, AuditEvent, AuditLedger, AuditResult, CapabilityLevel,
    Classification, Coordinate, DenialKind, LedgerError, Payload, Record, RecordStore,
};
use time::OffsetDateTime;

use crate::identity::{Identity, IdentityProvider};
use crate::policy::{PolicySource, RecoveryPolicy, StaticPolicySource};
use crate::rate_limit::SlidingWindowLimiter;

const REDACTED: &str = "[REDACTED]";
const SIGNING_KEY_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct GateConfig {
    pub identity_timeout_ms: u64,
    pub identity_retry_backoff_ms: u64,
    pub rate_window_secs: u64,
    /// Hex-encoded HMAC-SHA256 key used to check record signatures.
    pub signing_key_hex: Option<String>,
    pub policies: BTreeMap<Classification, RecoveryPolicy>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            identity_timeout_ms: 2_000,
            identity_retry_backoff_ms: 100,
            rate_window_secs: 3_600,
            signing_key_hex: None,
            policies: BTreeMap::new(),
        }
    }
}

impl GateConfig {
    #[must_use]
    pub fn identity_timeout(&self) -> Duration {
        Duration::from_millis(self.identity_timeout_ms)
    }

    #[must_use]
    pub fn identity_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.identity_retry_backoff_ms)
    }

    #[must_use]
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    #[must_use]
    pub fn policy_source(&self) -> StaticPolicySource {
        StaticPolicySource::new(self.policies.clone())
    }

    /// # Errors
    /// Returns `GateError::InvalidConfig` when a timeout or window is zero or the
    /// signing key is not 32 bytes of hex.
    pub fn validate(&self) -> Result<(), GateError> {
        if self.identity_timeout_ms == 0 {
            return Err(GateError::InvalidConfig(
                "identity_timeout_ms must be positive".to_string(),
            ));
        }
        if self.rate_window_secs == 0 {
            return Err(GateError::InvalidConfig(
                "rate_window_secs must be positive".to_string(),
            ));
        }
        self.signing_key()?;
        Ok(())
    }

    /// # Errors
    /// Returns `GateError::InvalidConfig` when the configured key is malformed.
    pub fn signing_key(&self) -> Result<Option<Vec<u8>>, GateError> {
        let Some(raw) = self.signing_key_hex.as_deref() else {
            return Ok(None);
        };
        let key = hex::decode(raw.trim())
            .map_err(|err| GateError::InvalidConfig(format!("signing_key_hex is not hex: {err}")))?;
        if key.len() != SIGNING_KEY_LEN {
            return Err(GateError::InvalidConfig(format!(
                "signing_key_hex must decode to {SIGNING_KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        Ok(Some(key))
    }
}

/// The only errors `recover` returns. Policy outcomes are `RecoveryOutcome::Denied`.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum GateError {
    #[error("invalid gate config: {0}")]
    InvalidConfig(String),
    #[error("audit ledger unavailable, nothing released: {0}")]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RecoveryIntent {
    pub request_id: String,
    #[serde(default)]
    pub resources: Vec<String>,
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RecoveryRequest {
    pub bitchain_id: String,
    pub auth_token: String,
    pub requester_id: String,
    #[serde(default)]
    pub intent: Option<RecoveryIntent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second_factor: Option<String>,
}

impl Debug for RecoveryRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryRequest")
            .field("bitchain_id", &self.bitchain_id)
            .field("auth_token", &"<redacted>")
            .field("requester_id", &self.requester_id)
            .field("intent", &self.intent)
            .field("second_factor", &self.second_factor.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl RecoveryRequest {
    /// Request whose intent covers exactly `bitchain_id`.
    #[must_use]
    pub fn new(
        bitchain_id: impl Into<String>,
        auth_token: impl Into<String>,
        requester_id: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        let bitchain_id = bitchain_id.into();
        Self {
            intent: Some(RecoveryIntent {
                request_id: request_id.into(),
                resources: vec![bitchain_id.clone()],
            }),
            bitchain_id,
            auth_token: auth_token.into(),
            requester_id: requester_id.into(),
            second_factor: None,
        }
    }

    #[must_use]
    pub fn with_second_factor(mut self, code: impl Into<String>) -> Self {
        self.second_factor = Some(code.into());
        self
    }
}

/// What a release carries at each capability level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReleasedData {
    Metadata {
        coordinate: Coordinate,
        classification: Classification,
        payload_len: usize,
    },
    Redacted {
        payload: Value,
        redacted_fields: Vec<String>,
    },
    Full {
        payload: Payload,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryResponse {
    pub bitchain_id: Address,
    pub capability_level: CapabilityLevel,
    pub data: ReleasedData,
    pub audit_event_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryDenial {
    pub kind: DenialKind,
    pub reason: String,
    pub audit_event_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Released(RecoveryResponse),
    Denied(RecoveryDenial),
}

impl RecoveryOutcome {
    #[must_use]
    pub fn denial_kind(&self) -> Option<DenialKind> {
        match self {
            Self::Released(_) => None,
            Self::Denied(denial) => Some(denial.kind),
        }
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        matches!(self, Self::Released(_))
    }
}

/// Called with each audit event after it is durable and before the outcome
/// is returned.
pub type AuditObserver = Arc<dyn Fn(&AuditEvent) + Send + Sync>;

struct Denied {
    kind: DenialKind,
    reason: String,
    classification: Option<Classification>,
}

impl Denied {
    fn new(kind: DenialKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            classification: None,
        }
    }

    fn classified(mut self, classification: Classification) -> Self {
        self.classification = Some(classification);
        self
    }
}

/// Rate window slot taken for an attempt that has not been audited yet.
struct RateSlot {
    subject: String,
    taken_at: OffsetDateTime,
}

struct Granted {
    address: Address,
    classification: Classification,
    capability_level: CapabilityLevel,
    data: ReleasedData,
    slot: RateSlot,
}

/// Mediates every payload recovery: integrity, provenance, identity, policy,
/// rate limit, then one durable audit event before anything is released.
pub struct RecoveryGate {
    store: Arc<dyn RecordStore>,
    ledger: Arc<dyn AuditLedger>,
    identity: Arc<dyn IdentityProvider>,
    policies: Arc<dyn PolicySource>,
    limiter: SlidingWindowLimiter,
    signing_key: Option<Vec<u8>>,
    after_audit: Option<AuditObserver>,
}

impl RecoveryGate {
    /// # Errors
    /// Returns `GateError::InvalidConfig` when `config` fails validation.
    pub fn new(
        store: Arc<dyn RecordStore>,
        ledger: Arc<dyn AuditLedger>,
        identity: Arc<dyn IdentityProvider>,
        policies: Arc<dyn PolicySource>,
        config: &GateConfig,
    ) -> Result<Self, GateError> {
        config.validate()?;
        Ok(Self {
            store,
            ledger,
            identity,
            policies,
            limiter: SlidingWindowLimiter::new(config.rate_window()),
            signing_key: config.signing_key()?,
            after_audit: None,
        })
    }

    #[must_use]
    pub fn with_audit_observer(mut self, observer: AuditObserver) -> Self {
        self.after_audit = Some(observer);
        self
    }

    /// Replays successful recoveries still inside the rate window so a fresh
    /// gate enforces limits across process restarts. Returns the number replayed.
    pub fn restore_rate_window(&self, events: &[AuditEvent]) -> usize {
        let cutoff = OffsetDateTime::now_utc() - self.limiter.window();
        let mut replayed = 0;
        for event in events {
            if event.action == AuditAction::Recover
                && event.result == AuditResult::Success
                && event.timestamp > cutoff
            {
                self.limiter.record_at(&event.requester_id, event.timestamp);
                replayed += 1;
            }
        }
        replayed
    }

    /// Recoveries by `subject` counted in the current rate window.
    #[must_use]
    pub fn rate_window_usage(&self, subject: &str) -> u32 {
        self.limiter.in_window_at(subject, OffsetDateTime::now_utc())
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<dyn AuditLedger> {
        &self.ledger
    }

    /// Runs one recovery attempt to a terminal outcome. Exactly one audit event
    /// is appended per call; when that append fails nothing is released.
    ///
    /// # Errors
    /// Returns `GateError::Ledger` when the audit event could not be recorded.
    pub fn recover(&self, request: &RecoveryRequest) -> Result<RecoveryOutcome, GateError> {
        let evaluated = self.evaluate(request);
        let request_id = request
            .intent
            .as_ref()
            .map(|intent| intent.request_id.clone())
            .filter(|id| !id.is_empty());

        let mut event = match &evaluated {
            Ok(granted) => {
                let mut event = AuditEvent::new(
                    AuditAction::Recover,
                    request.bitchain_id.clone(),
                    request.requester_id.clone(),
                    AuditResult::Success,
                    format!("released at {}", granted.capability_level.as_str()),
                );
                event.classification = Some(granted.classification);
                event.capability_level = Some(granted.capability_level);
                event
            }
            Err(denied) => {
                let mut event = AuditEvent::new(
                    AuditAction::Recover,
                    request.bitchain_id.clone(),
                    request.requester_id.clone(),
                    AuditResult::Denied,
                    denied.reason.clone(),
                );
                event.classification = denied.classification;
                event.denial_kind = Some(denied.kind);
                event
            }
        };
        event.request_id = request_id;

        if let Err(err) = self.ledger.append(&event) {
            if let Ok(granted) = &evaluated {
                self.limiter
                    .release_at(&granted.slot.subject, granted.slot.taken_at);
            }
            tracing::error!(
                bitchain_id = %request.bitchain_id,
                error = %err,
                "audit append failed; recovery aborted"
            );
            return Err(GateError::Ledger(err));
        }

        if let Some(observer) = &self.after_audit {
            observer(&event);
        }

        match evaluated {
            Ok(granted) => {
                tracing::info!(
                    bitchain_id = %granted.address,
                    requester_id = %request.requester_id,
                    capability_level = granted.capability_level.as_str(),
                    "recovery released"
                );
                Ok(RecoveryOutcome::Released(RecoveryResponse {
                    bitchain_id: granted.address,
                    capability_level: granted.capability_level,
                    data: granted.data,
                    audit_event_id: event.event_id,
                }))
            }
            Err(denied) => {
                tracing::warn!(
                    bitchain_id = %request.bitchain_id,
                    requester_id = %request.requester_id,
                    kind = denied.kind.as_str(),
                    reason = %denied.reason,
                    "recovery denied"
                );
                Ok(RecoveryOutcome::Denied(RecoveryDenial {
                    kind: denied.kind,
                    reason: denied.reason,
                    audit_event_id: event.event_id,
                }))
            }
        }
    }

    fn evaluate(&self, request: &RecoveryRequest) -> Result<Granted, Denied> {
        let record = self.check_integrity(&request.bitchain_id)?;
        let classification = record.classification;

        self.check_provenance(&record)
            .map_err(|reason| Denied::new(DenialKind::ProvenanceFailure, reason).classified(classification))?;

        let identity = self
            .authenticate(request)
            .map_err(|denied| denied.classified(classification))?;

        let (policy, slot) = self
            .enforce_policy(request, &record, &identity)
            .map_err(|denied| denied.classified(classification))?;

        let (capability_level, data) = release(&record, &policy);
        Ok(Granted {
            address: record.address,
            classification,
            capability_level,
            data,
            slot,
        })
    }

    fn check_integrity(&self, bitchain_id: &str) -> Result<Record, Denied> {
        let address = Address::parse(bitchain_id).map_err(|_| {
            Denied::new(DenialKind::NotFound, "bitchain_id is not a valid address")
        })?;
        let record = match self.store.get(&address) {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(Denied::new(
                    DenialKind::NotFound,
                    format!("no record stored at {address}"),
                ));
            }
            Err(err) => {
                return Err(Denied::new(
                    DenialKind::IntegrityFailure,
                    format!("record could not be read for verification: {err}"),
                ));
            }
        };

        let classification = record.classification;
        if record.address != address {
            return Err(Denied::new(
                DenialKind::IntegrityFailure,
                "store returned a record under a different address",
            )
            .classified(classification));
        }
        record.verify_address().map_err(|err| {
            Denied::new(DenialKind::IntegrityFailure, err.to_string()).classified(classification)
        })?;

        match (record.signature.as_deref(), self.signing_key.as_deref()) {
            (None, _) => {}
            (Some(_), None) => {
                return Err(Denied::new(
                    DenialKind::IntegrityFailure,
                    "record is signed but no signing key is configured",
                )
                .classified(classification));
            }
            (Some(signature), Some(key)) => {
                verify_signature(key, &record.address, signature).map_err(|err| {
                    Denied::new(DenialKind::IntegrityFailure, err.to_string())
                        .classified(classification)
                })?;
            }
        }
        Ok(record)
    }

    /// Walks parent links back to a lineage-0 root. Lineage strictly decreases
    /// along a valid chain, so the walk terminates.
    fn check_provenance(&self, record: &Record) -> Result<(), String> {
        let mut current = record.clone();
        loop {
            let Some(parent_address) = current.parent.clone() else {
                if current.coordinate.lineage == 0 {
                    return Ok(());
                }
                return Err(format!(
                    "record {} has lineage {} but no parent link",
                    current.address, current.coordinate.lineage
                ));
            };

            let parent = match self.store.get(&parent_address) {
                Ok(Some(parent)) => parent,
                Ok(None) => return Err(format!("parent {parent_address} is not stored")),
                Err(err) => return Err(format!("parent {parent_address} could not be read: {err}")),
            };
            parent
                .verify_address()
                .map_err(|err| format!("parent {parent_address} failed verification: {err}"))?;
            if parent.coordinate.lineage.checked_add(1) != Some(current.coordinate.lineage) {
                return Err(format!(
                    "lineage {} of {} does not follow parent lineage {}",
                    current.coordinate.lineage, current.address, parent.coordinate.lineage
                ));
            }
            if parent.coordinate.realm != current.coordinate.realm {
                return Err(format!(
                    "realm of {} differs from parent {parent_address}",
                    current.address
                ));
            }
            current = parent;
        }
    }

    fn authenticate(&self, request: &RecoveryRequest) -> Result<Identity, Denied> {
        let identity = self.identity.verify(&request.auth_token).map_err(|err| {
            Denied::new(DenialKind::AuthenticationFailure, err.to_string())
        })?;
        if identity.subject != request.requester_id {
            return Err(Denied::new(
                DenialKind::AuthenticationFailure,
                "auth token does not belong to requester_id",
            ));
        }

        let Some(intent) = request.intent.as_ref() else {
            return Err(Denied::new(DenialKind::IntentRequired, "no intent declared"));
        };
        if intent.request_id.trim().is_empty() {
            return Err(Denied::new(
                DenialKind::IntentRequired,
                "intent is missing a request_id",
            ));
        }
        if !intent.resources.iter().any(|resource| resource == &request.bitchain_id) {
            return Err(Denied::new(
                DenialKind::IntentRequired,
                "declared intent does not cover the requested record",
            ));
        }
        Ok(identity)
    }

    fn enforce_policy(
        &self,
        request: &RecoveryRequest,
        record: &Record,
        identity: &Identity,
    ) -> Result<(RecoveryPolicy, RateSlot), Denied> {
        let Some(policy) = self.policies.get_policy(record.classification) else {
            return Err(Denied::new(
                DenialKind::PolicyDenied,
                format!("no policy configured for {}", record.classification.as_str()),
            ));
        };

        if !policy.permits_any_role(&identity.roles) {
            return Err(Denied::new(
                DenialKind::PolicyDenied,
                "requester holds none of the allowed roles",
            ));
        }
        if policy.owner_only && record.owner.as_deref() != Some(identity.subject.as_str()) {
            return Err(Denied::new(
                DenialKind::PolicyDenied,
                "policy restricts recovery to the record owner",
            ));
        }
        if policy.requires_second_factor {
            let Some(code) = request.second_factor.as_deref() else {
                return Err(Denied::new(
                    DenialKind::SecondFactorRequired,
                    "policy requires a second factor",
                ));
            };
            match self.identity.verify_second_factor(identity, code) {
                Ok(true) => {}
                Ok(false) => {
                    return Err(Denied::new(
                        DenialKind::SecondFactorRequired,
                        "second factor was not accepted",
                    ));
                }
                Err(err) => {
                    return Err(Denied::new(
                        DenialKind::SecondFactorRequired,
                        format!("second factor could not be checked: {err}"),
                    ));
                }
            }
        }

        let taken_at = OffsetDateTime::now_utc();
        let decision =
            self.limiter
                .check_and_record_at(&identity.subject, policy.rate_limit_per_hour, taken_at);
        if !decision.allowed {
            return Err(Denied::new(
                DenialKind::RateLimitExceeded,
                format!(
                    "{} of {} recoveries already used in the current window",
                    decision.in_window, decision.limit
                ),
            ));
        }
        let slot = RateSlot {
            subject: identity.subject.clone(),
            taken_at,
        };
        Ok((policy, slot))
    }
}

fn metadata(record: &Record) -> ReleasedData {
    ReleasedData::Metadata {
        coordinate: record.coordinate.clone(),
        classification: record.classification,
        payload_len: record.payload.len(),
    }
}

/// Masks the named top-level fields of a JSON object payload.
fn redact(payload: &[u8], fields: &[String]) -> Option<(Value, Vec<String>)> {
    let Ok(Value::Object(mut object)) = serde_json::from_slice::<Value>(payload) else {
        return None;
    };
    let mut redacted = Vec::new();
    for field in fields {
        if let Some(slot) = object.get_mut(field) {
            *slot = Value::String(REDACTED.to_string());
            redacted.push(field.clone());
        }
    }
    Some((Value::Object(object), redacted))
}

/// A `PARTIAL` release of a payload that is not a JSON object falls back to metadata.
fn release(record: &Record, policy: &RecoveryPolicy) -> (CapabilityLevel, ReleasedData) {
    match policy.default_capability {
        CapabilityLevel::Full => (
            CapabilityLevel::Full,
            ReleasedData::Full {
                payload: record.payload.clone(),
            },
        ),
        CapabilityLevel::Partial => match redact(record.payload.as_bytes(), &policy.redacted_fields) {
            Some((payload, redacted_fields)) => (
                CapabilityLevel::Partial,
                ReleasedData::Redacted {
                    payload,
                    redacted_fields,
                },
            ),
            None => (CapabilityLevel::Compressed, metadata(record)),
        },
        CapabilityLevel::Compressed => (CapabilityLevel::Compressed, metadata(record)),
    }
}
