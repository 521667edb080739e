use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use stat7_core::{CapabilityLevel, Classification};

/// Access rules for one classification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RecoveryPolicy {
    pub allowed_roles: BTreeSet<String>,
    #[serde(default)]
    pub owner_only: bool,
    #[serde(default)]
    pub requires_second_factor: bool,
    pub rate_limit_per_hour: u32,
    pub default_capability: CapabilityLevel,
    /// Top-level JSON fields masked when releasing at `PARTIAL`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redacted_fields: Vec<String>,
}

impl RecoveryPolicy {
    #[must_use]
    pub fn new(
        allowed_roles: impl IntoIterator<Item = impl Into<String>>,
        rate_limit_per_hour: u32,
        default_capability: CapabilityLevel,
    ) -> Self {
        Self {
            allowed_roles: allowed_roles.into_iter().map(Into::into).collect(),
            owner_only: false,
            requires_second_factor: false,
            rate_limit_per_hour,
            default_capability,
            redacted_fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn owner_only(mut self) -> Self {
        self.owner_only = true;
        self
    }

    #[must_use]
    pub fn with_second_factor(mut self) -> Self {
        self.requires_second_factor = true;
        self
    }

    #[must_use]
    pub fn with_redacted_fields(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.redacted_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn permits_any_role<'a>(&self, roles: impl IntoIterator<Item = &'a String>) -> bool {
        roles.into_iter().any(|role| self.allowed_roles.contains(role))
    }
}

/// Where the gate looks up the policy for a classification. `None` means
/// no policy is configured, which the gate treats as a denial.
pub trait PolicySource: Send + Sync {
    fn get_policy(&self, classification: Classification) -> Option<RecoveryPolicy>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct StaticPolicySource {
    policies: BTreeMap<Classification, RecoveryPolicy>,
}

impl StaticPolicySource {
    #[must_use]
    pub fn new(policies: BTreeMap<Classification, RecoveryPolicy>) -> Self {
        Self { policies }
    }

    #[must_use]
    pub fn with_policy(mut self, classification: Classification, policy: RecoveryPolicy) -> Self {
        self.policies.insert(classification, policy);
        self
    }
}

impl PolicySource for StaticPolicySource {
    fn get_policy(&self, classification: Classification) -> Option<RecoveryPolicy> {
        self.policies.get(&classification).cloned()
    }
}
