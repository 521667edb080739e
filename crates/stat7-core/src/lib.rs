//! STAT7 core: the seven-field coordinate model, deterministic content
//! addressing, entanglement scoring and calibration, and the boundary
//! validator that guards derived coordinates before they are stored.

mod address;
mod audit;
mod boundary;
mod calibration;
mod coordinate;
mod entanglement;
mod store;
mod sweep;

pub use address::{
    canonical_coordinate, compute_address, sign_address, verify_signature,
    CANONICAL_FLOAT_PRECISION,
};
pub use audit::{
    AuditAction, AuditEvent, AuditLedger, AuditResult, CapabilityLevel, DenialKind, LedgerError,
    MemoryAuditLedger,
};
pub use boundary::{
    derive_coordinate, Admission, BoundaryConfig, BoundaryError, BoundaryValidator,
    DerivationRule, RepairEvent, Violation,
};
pub use calibration::{
    calibrate, synthetic_validation_set, CalibrationError, CalibrationOptions,
    CalibrationReport, ConfusionMatrix, LabeledPair, PairScore,
};
pub use coordinate::{
    Address, Classification, Coordinate, Horizon, Payload, Realm, Record,
    COORDINATE_SCHEMA_VERSION, POLARITY_LEN,
};
pub use entanglement::{
    default_realm_adjacency, EntanglementConfig, EntanglementDetector, ScoreBreakdown,
    ScoreComponents, ScoreWeights,
};
pub use store::{
    resolve_adjacency, AdjacencyLink, AdjacencyStatus, MemoryRecordStore, PutOutcome,
    RecordStore, StoreError,
};
pub use sweep::{sweep, CancellationToken, EntanglementEdge, SweepOptions, SweepReport};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum Stat7Error {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("integrity error: {0}")]
    Integrity(String),
}
