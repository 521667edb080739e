use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::coordinate::{Address, Coordinate, Horizon, POLARITY_LEN};
use crate::Stat7Error;

const MAX_DIMENSIONALITY: u8 = 7;

/// Fixed rule a child coordinate is derived from its parent with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum DerivationRule {
    /// Summarize: luminosity and dimensionality may only shrink.
    Compaction { target_luminosity: f64 },
    /// Elaborate: luminosity and dimensionality may only grow.
    Expansion { target_luminosity: f64 },
    /// Retire: horizon moves to `archived`, everything else is kept.
    Archive,
}

impl DerivationRule {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compaction { .. } => "compaction",
            Self::Expansion { .. } => "expansion",
            Self::Archive => "archive",
        }
    }
}

fn check_target(target: f64) -> Result<f64, Stat7Error> {
    if target.is_finite() && (0.0..=1.0).contains(&target) {
        Ok(target)
    } else {
        Err(Stat7Error::Validation(format!(
            "target_luminosity must be in [0, 1], got {target}"
        )))
    }
}

/// Applies `rule` to `parent`. The result always lies inside the bounded
/// region `BoundaryValidator` accepts for that parent and rule.
///
/// # Errors
/// Returns `Stat7Error::Validation` when the parent is invalid, the lineage would
/// overflow, or the rule target is out of range.
pub fn derive_coordinate(parent: &Coordinate, rule: DerivationRule) -> Result<Coordinate, Stat7Error> {
    parent.validate()?;
    let lineage = parent
        .lineage
        .checked_add(1)
        .ok_or_else(|| Stat7Error::Validation("lineage overflow".to_string()))?;

    let mut child = parent.clone();
    child.lineage = lineage;
    match rule {
        DerivationRule::Compaction { target_luminosity } => {
            child.luminosity = check_target(target_luminosity)?.min(parent.luminosity);
        }
        DerivationRule::Expansion { target_luminosity } => {
            child.luminosity = check_target(target_luminosity)?.max(parent.luminosity);
        }
        DerivationRule::Archive => child.horizon = Horizon::Archived,
    }
    for component in child.polarity.iter_mut().skip(usize::from(child.dimensionality)) {
        *component = 0.0;
    }
    Ok(child)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BoundaryConfig {
    /// Largest per-component polarity change a derivation may make.
    pub max_polarity_drift: f64,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            max_polarity_drift: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Violation {
    pub field: String,
    pub detail: String,
}

impl Violation {
    fn new(field: &str, detail: String) -> Self {
        Self {
            field: field.to_string(),
            detail,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepairEvent {
    pub repair_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<DerivationRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Address>,
    pub original: Coordinate,
    pub repaired: Coordinate,
    pub violations: Vec<Violation>,
    #[serde(with = "time::serde::rfc3339")]
    pub repaired_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Clean(Coordinate),
    Repaired {
        coordinate: Coordinate,
        event: RepairEvent,
    },
}

impl Admission {
    #[must_use]
    pub fn coordinate(&self) -> &Coordinate {
        match self {
            Self::Clean(coordinate) | Self::Repaired { coordinate, .. } => coordinate,
        }
    }

    #[must_use]
    pub fn into_coordinate(self) -> Coordinate {
        match self {
            Self::Clean(coordinate) | Self::Repaired { coordinate, .. } => coordinate,
        }
    }

    #[must_use]
    pub fn repair_event(&self) -> Option<&RepairEvent> {
        match self {
            Self::Clean(_) => None,
            Self::Repaired { event, .. } => Some(event),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum BoundaryError {
    #[error("invalid boundary config: {0}")]
    InvalidConfig(String),
    #[error("parent coordinate is invalid: {0}")]
    InvalidParent(String),
    #[error("bounded repair failed; {} violation(s) remain", .violations.len())]
    RepairFailed { violations: Vec<Violation> },
}

enum Region<'a> {
    Root,
    Derived {
        parent: &'a Coordinate,
        rule: DerivationRule,
    },
}

/// Per-region inclusive bounds.
struct Bounds {
    lineage: u32,
    luminosity: (f64, f64),
    dimensionality: (u8, u8),
    polarity: [(f64, f64); POLARITY_LEN],
}

/// Accepts a coordinate only when it sits inside the region its provenance
/// implies, repairing once by projection when it does not.
#[derive(Debug, Clone, Default)]
pub struct BoundaryValidator {
    config: BoundaryConfig,
}

impl BoundaryValidator {
    /// # Errors
    /// Returns `BoundaryError::InvalidConfig` when the drift bound is negative or not finite.
    pub fn new(config: BoundaryConfig) -> Result<Self, BoundaryError> {
        if !config.max_polarity_drift.is_finite() || config.max_polarity_drift < 0.0 {
            return Err(BoundaryError::InvalidConfig(format!(
                "max_polarity_drift must be finite and non-negative, got {}",
                config.max_polarity_drift
            )));
        }
        Ok(Self { config })
    }

    #[must_use]
    pub fn config(&self) -> &BoundaryConfig {
        &self.config
    }

    /// Violations of a root coordinate.
    #[must_use]
    pub fn root_violations(&self, coordinate: &Coordinate) -> Vec<Violation> {
        self.violations(&Region::Root, coordinate)
    }

    /// Violations of a coordinate derived from `parent` under `rule`.
    ///
    /// # Errors
    /// Returns `BoundaryError::InvalidParent` when the parent itself is invalid.
    pub fn derived_violations(
        &self,
        coordinate: &Coordinate,
        parent: &Coordinate,
        rule: DerivationRule,
    ) -> Result<Vec<Violation>, BoundaryError> {
        parent
            .validate()
            .map_err(|err| BoundaryError::InvalidParent(err.to_string()))?;
        Ok(self.violations(&Region::Derived { parent, rule }, coordinate))
    }

    /// # Errors
    /// Returns `BoundaryError::RepairFailed` when one repair pass cannot bring the
    /// coordinate inside the root region.
    pub fn admit_root(&self, coordinate: Coordinate) -> Result<Admission, BoundaryError> {
        self.admit(&Region::Root, coordinate, None)
    }

    /// # Errors
    /// Returns `BoundaryError::InvalidParent` for an invalid parent and
    /// `BoundaryError::RepairFailed` when one repair pass is not enough.
    pub fn admit_derived(
        &self,
        coordinate: Coordinate,
        parent: &Coordinate,
        parent_address: &Address,
        rule: DerivationRule,
    ) -> Result<Admission, BoundaryError> {
        parent
            .validate()
            .map_err(|err| BoundaryError::InvalidParent(err.to_string()))?;
        self.admit(
            &Region::Derived { parent, rule },
            coordinate,
            Some(parent_address),
        )
    }

    fn admit(
        &self,
        region: &Region<'_>,
        coordinate: Coordinate,
        parent_address: Option<&Address>,
    ) -> Result<Admission, BoundaryError> {
        let violations = self.violations(region, &coordinate);
        if violations.is_empty() {
            return Ok(Admission::Clean(coordinate));
        }

        let repaired = self.project(region, &coordinate);
        let remaining = self.violations(region, &repaired);
        if !remaining.is_empty() {
            return Err(BoundaryError::RepairFailed {
                violations: remaining,
            });
        }

        let rule = match region {
            Region::Root => None,
            Region::Derived { rule, .. } => Some(*rule),
        };
        let event = RepairEvent {
            repair_id: Ulid::new().to_string(),
            rule,
            parent: parent_address.cloned(),
            original: coordinate,
            repaired: repaired.clone(),
            violations,
            repaired_at: OffsetDateTime::now_utc(),
        };
        Ok(Admission::Repaired {
            coordinate: repaired,
            event,
        })
    }

    fn bounds(&self, region: &Region<'_>) -> Bounds {
        match region {
            Region::Root => Bounds {
                lineage: 0,
                luminosity: (0.0, 1.0),
                dimensionality: (1, MAX_DIMENSIONALITY),
                polarity: [(-1.0, 1.0); POLARITY_LEN],
            },
            Region::Derived { parent, rule } => {
                let drift = self.config.max_polarity_drift;
                let polarity = parent
                    .polarity
                    .map(|value| ((value - drift).max(-1.0), (value + drift).min(1.0)));
                let (luminosity, dimensionality) = match rule {
                    DerivationRule::Compaction { .. } => {
                        ((0.0, parent.luminosity), (1, parent.dimensionality))
                    }
                    DerivationRule::Expansion { .. } => (
                        (parent.luminosity, 1.0),
                        (parent.dimensionality, MAX_DIMENSIONALITY),
                    ),
                    DerivationRule::Archive => (
                        (parent.luminosity, parent.luminosity),
                        (parent.dimensionality, parent.dimensionality),
                    ),
                };
                Bounds {
                    lineage: parent.lineage.saturating_add(1),
                    luminosity,
                    dimensionality,
                    polarity,
                }
            }
        }
    }

    fn violations(&self, region: &Region<'_>, coordinate: &Coordinate) -> Vec<Violation> {
        let bounds = self.bounds(region);
        let mut violations = Vec::new();

        if coordinate.lineage != bounds.lineage {
            violations.push(Violation::new(
                "lineage",
                format!("expected {}, got {}", bounds.lineage, coordinate.lineage),
            ));
        }

        if let Region::Derived { parent, rule } = region {
            if coordinate.realm != parent.realm {
                violations.push(Violation::new(
                    "realm",
                    format!(
                        "derived records stay in realm {}, got {}",
                        parent.realm.as_str(),
                        coordinate.realm.as_str()
                    ),
                ));
            }
            let horizon_ok = match rule {
                DerivationRule::Archive => coordinate.horizon == Horizon::Archived,
                _ => coordinate.horizon >= parent.horizon,
            };
            if !horizon_ok {
                violations.push(Violation::new(
                    "horizon",
                    format!(
                        "{} cannot follow parent horizon {} under {}",
                        coordinate.horizon.as_str(),
                        parent.horizon.as_str(),
                        rule.as_str()
                    ),
                ));
            }
        }

        let (low, high) = bounds.luminosity;
        if !(coordinate.luminosity.is_finite() && coordinate.luminosity >= low && coordinate.luminosity <= high) {
            violations.push(Violation::new(
                "luminosity",
                format!("{} outside [{low}, {high}]", coordinate.luminosity),
            ));
        }

        let (low, high) = bounds.dimensionality;
        if !(low..=high).contains(&coordinate.dimensionality) {
            violations.push(Violation::new(
                "dimensionality",
                format!("{} outside [{low}, {high}]", coordinate.dimensionality),
            ));
        }

        let active = usize::from(coordinate.dimensionality).min(POLARITY_LEN);
        for (index, value) in coordinate.polarity.iter().enumerate() {
            if index >= active {
                if *value != 0.0 {
                    violations.push(Violation::new(
                        "polarity",
                        format!("component {index} is beyond dimensionality and must be 0, got {value}"),
                    ));
                }
                continue;
            }
            let (low, high) = bounds.polarity[index];
            if !(value.is_finite() && *value >= low && *value <= high) {
                violations.push(Violation::new(
                    "polarity",
                    format!("component {index} = {value} outside [{low}, {high}]"),
                ));
            }
        }

        violations
    }

    /// One projection onto the region. Non-finite values survive projection and
    /// are reported by the re-check.
    fn project(&self, region: &Region<'_>, coordinate: &Coordinate) -> Coordinate {
        let bounds = self.bounds(region);
        let mut repaired = coordinate.clone();
        repaired.lineage = bounds.lineage;

        if let Region::Derived { parent, rule } = region {
            repaired.realm = parent.realm;
            repaired.horizon = match rule {
                DerivationRule::Archive => Horizon::Archived,
                _ => repaired.horizon.max(parent.horizon),
            };
        }

        let (low, high) = bounds.luminosity;
        repaired.luminosity = repaired.luminosity.clamp(low, high);
        let (low, high) = bounds.dimensionality;
        repaired.dimensionality = repaired.dimensionality.clamp(low, high);

        let active = usize::from(repaired.dimensionality);
        for (index, value) in repaired.polarity.iter_mut().enumerate() {
            if index >= active {
                *value = 0.0;
            } else {
                let (low, high) = bounds.polarity[index];
                *value = value.clamp(low, high);
            }
        }
        repaired
    }
}
