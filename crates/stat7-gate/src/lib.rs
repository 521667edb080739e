//! Recovery Gate: the audited boundary a record's payload crosses on its way
//! out. Identity, policy and ledger are injected collaborators; the rate
//! limiter is owned per gate instance.

mod gate;
mod identity;
mod ledger;
mod policy;
mod rate_limit;

pub use gate::{
    AuditObserver, GateConfig, GateError, RecoveryDenial, RecoveryGate, RecoveryIntent,
    RecoveryOutcome, RecoveryRequest, RecoveryResponse, ReleasedData,
};
pub use identity::{
    HttpIdentityConfig, HttpIdentityProvider, Identity, IdentityConfig, IdentityError,
    IdentityProvider, StaticIdentity, StaticIdentityProvider,
};
pub use ledger::JsonlAuditLedger;
pub use policy::{PolicySource, RecoveryPolicy, StaticPolicySource};
pub use rate_limit::{RateDecision, SlidingWindowLimiter};
