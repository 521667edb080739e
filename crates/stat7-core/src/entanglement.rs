use serde::{Deserialize, Serialize};

use crate::coordinate::{Coordinate, Realm, POLARITY_LEN};
use crate::Stat7Error;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ScoreWeights {
    pub polarity: f64,
    pub realm: f64,
    pub adjacency: f64,
    pub luminosity: f64,
    pub lineage: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            polarity: 0.50,
            realm: 0.15,
            adjacency: 0.20,
            luminosity: 0.10,
            lineage: 0.05,
        }
    }
}

impl ScoreWeights {
    #[must_use]
    pub fn total(&self) -> f64 {
        self.polarity + self.realm + self.adjacency + self.luminosity + self.lineage
    }
}

/// Realm pairs that score `adjacent_realm_affinity` instead of zero.
#[must_use]
pub fn default_realm_adjacency() -> Vec<(Realm, Realm)> {
    vec![
        (Realm::Data, Realm::System),
        (Realm::Data, Realm::Pattern),
        (Realm::Narrative, Realm::Event),
        (Realm::Narrative, Realm::Faculty),
        (Realm::Event, Realm::Pattern),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EntanglementConfig {
    pub weights: ScoreWeights,
    pub adjacent_realm_affinity: f64,
    pub realm_adjacency: Vec<(Realm, Realm)>,
    pub lineage_decay_base: f64,
    pub threshold: f64,
}

impl Default for EntanglementConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            adjacent_realm_affinity: 0.7,
            realm_adjacency: default_realm_adjacency(),
            lineage_decay_base: 0.9,
            threshold: 0.85,
        }
    }
}

impl EntanglementConfig {
    /// # Errors
    /// Returns `Stat7Error::Validation` when weights do not sum to 1, or when the
    /// affinity or threshold falls outside [0, 1] or the decay base outside (0, 1].
    pub fn validate(&self) -> Result<(), Stat7Error> {
        let weights = [
            ("polarity", self.weights.polarity),
            ("realm", self.weights.realm),
            ("adjacency", self.weights.adjacency),
            ("luminosity", self.weights.luminosity),
            ("lineage", self.weights.lineage),
        ];
        for (name, weight) in weights {
            if !weight.is_finite() || !(0.0..=1.0).contains(&weight) {
                return Err(Stat7Error::Validation(format!(
                    "weight {name} must be a finite value in [0, 1], got {weight}"
                )));
            }
        }
        let total = self.weights.total();
        if (total - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(Stat7Error::Validation(format!(
                "entanglement weights must sum to 1.0, got {total}"
            )));
        }

        for (name, value) in [
            ("adjacent_realm_affinity", self.adjacent_realm_affinity),
            ("lineage_decay_base", self.lineage_decay_base),
            ("threshold", self.threshold),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(Stat7Error::Validation(format!(
                    "{name} must be in [0, 1], got {value}"
                )));
            }
        }
        if self.lineage_decay_base == 0.0 {
            return Err(Stat7Error::Validation(
                "lineage_decay_base must be in (0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn realms_adjacent(&self, left: Realm, right: Realm) -> bool {
        self.realm_adjacency
            .iter()
            .any(|&(a, b)| (a == left && b == right) || (a == right && b == left))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScoreComponents {
    pub polarity: f64,
    pub realm: f64,
    pub adjacency: f64,
    pub luminosity: f64,
    pub lineage: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScoreBreakdown {
    pub score: f64,
    pub components: ScoreComponents,
}

fn unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub(crate) fn count_as_f64(count: usize) -> f64 {
    f64::from(u32::try_from(count).unwrap_or(u32::MAX))
}

fn polarity_resonance(left: &Coordinate, right: &Coordinate) -> f64 {
    let active = usize::from(left.dimensionality.min(right.dimensionality)).min(POLARITY_LEN);
    let (mut dot, mut left_norm, mut right_norm) = (0.0_f64, 0.0_f64, 0.0_f64);
    for index in 0..active {
        let (a, b) = (left.polarity[index], right.polarity[index]);
        dot += a * b;
        left_norm += a * a;
        right_norm += b * b;
    }
    // A zero vector has no direction to resonate with.
    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    unit(dot / (left_norm.sqrt() * right_norm.sqrt()))
}

fn realm_affinity(config: &EntanglementConfig, left: Realm, right: Realm) -> f64 {
    if left == right {
        1.0
    } else if config.realms_adjacent(left, right) {
        unit(config.adjacent_realm_affinity)
    } else {
        0.0
    }
}

fn adjacency_overlap(left: &Coordinate, right: &Coordinate) -> f64 {
    match (left.adjacency.is_empty(), right.adjacency.is_empty()) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.0,
        (false, false) => {
            let shared = left.adjacency.intersection(&right.adjacency).count();
            let union = left.adjacency.len() + right.adjacency.len() - shared;
            count_as_f64(shared) / count_as_f64(union)
        }
    }
}

fn luminosity_proximity(left: f64, right: f64) -> f64 {
    unit(1.0 - (left - right).abs())
}

fn lineage_affinity(config: &EntanglementConfig, left: u32, right: u32) -> f64 {
    let distance = i32::try_from(left.abs_diff(right)).unwrap_or(i32::MAX);
    unit(config.lineage_decay_base.powi(distance))
}

/// Pairwise scorer. Every component is symmetric and lies in [0, 1], so the
/// weighted score is symmetric and bounded for any inputs.
#[derive(Debug, Clone, Default)]
pub struct EntanglementDetector {
    config: EntanglementConfig,
}

impl EntanglementDetector {
    /// # Errors
    /// Returns `Stat7Error::Validation` when the config fails validation.
    pub fn new(config: EntanglementConfig) -> Result<Self, Stat7Error> {
        config.validate()?;
        Ok(Self { config })
    }

    #[must_use]
    pub fn config(&self) -> &EntanglementConfig {
        &self.config
    }

    #[must_use]
    pub fn breakdown(&self, left: &Coordinate, right: &Coordinate) -> ScoreBreakdown {
        let components = ScoreComponents {
            polarity: polarity_resonance(left, right),
            realm: realm_affinity(&self.config, left.realm, right.realm),
            adjacency: adjacency_overlap(left, right),
            luminosity: luminosity_proximity(left.luminosity, right.luminosity),
            lineage: lineage_affinity(&self.config, left.lineage, right.lineage),
        };
        let weights = &self.config.weights;
        let score = unit(
            weights.polarity * components.polarity
                + weights.realm * components.realm
                + weights.adjacency * components.adjacency
                + weights.luminosity * components.luminosity
                + weights.lineage * components.lineage,
        );
        ScoreBreakdown { score, components }
    }

    #[must_use]
    pub fn score(&self, left: &Coordinate, right: &Coordinate) -> f64 {
        self.breakdown(left, right).score
    }

    #[must_use]
    pub fn classify(&self, left: &Coordinate, right: &Coordinate, threshold: f64) -> bool {
        self.score(left, right) >= threshold
    }

    /// Classifies against the configured threshold.
    #[must_use]
    pub fn is_entangled(&self, left: &Coordinate, right: &Coordinate) -> bool {
        self.classify(left, right, self.config.threshold)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use proptest::prelude::*;

    use super::*;
    use crate::address::compute_address;
    use crate::coordinate::{Address, Horizon};

    fn detector() -> EntanglementDetector {
        EntanglementDetector::default()
    }

    fn neighbor(seed: u8) -> Address {
        compute_address(&Coordinate::genesis(Realm::Void, 0.0, 1), &[seed])
    }

    fn coordinate(realm: Realm, polarity: [f64; POLARITY_LEN], luminosity: f64, lineage: u32) -> Coordinate {
        Coordinate {
            realm,
            lineage,
            adjacency: BTreeSet::new(),
            horizon: Horizon::Emergence,
            luminosity,
            polarity,
            dimensionality: 7,
        }
    }

    fn realm_strategy() -> impl Strategy<Value = Realm> {
        proptest::sample::select(Realm::ALL.to_vec())
    }

    prop_compose! {
        fn arb_coordinate()(
            realm in realm_strategy(),
            lineage in 0_u32..50,
            luminosity in 0.0_f64..=1.0,
            polarity in proptest::array::uniform7(-1.0_f64..=1.0),
            dimensionality in 1_u8..=7,
            adjacency in proptest::collection::btree_set(0_u8..12, 0..6),
        ) -> Coordinate {
            Coordinate {
                realm,
                lineage,
                adjacency: adjacency.into_iter().map(neighbor).collect(),
                horizon: Horizon::Peak,
                luminosity,
                polarity,
                dimensionality,
            }
        }
    }

    // Test IDs: TENT-001
    #[test]
    fn default_config_validates_and_weights_sum_to_one() {
        let config = EntanglementConfig::default();
        assert!(config.validate().is_ok());
        assert!((config.weights.total() - 1.0).abs() < 1e-12);
    }

    // Test IDs: TENT-002
    #[test]
    fn config_rejects_weights_that_do_not_sum_to_one() {
        let mut config = EntanglementConfig::default();
        config.weights.polarity = 0.6;
        match EntanglementDetector::new(config) {
            Err(Stat7Error::Validation(message)) => assert!(message.contains("sum to 1.0")),
            other => panic!("expected weight-sum validation error, got {other:?}"),
        }
    }

    // Test IDs: TENT-003
    #[test]
    fn identical_coordinates_score_one() {
        let left = coordinate(Realm::Data, [0.3, 0.1, -0.2, 0.5, 0.0, 0.4, -0.1], 0.6, 2);
        let breakdown = detector().breakdown(&left, &left.clone());
        assert!((breakdown.score - 1.0).abs() < 1e-12);
        assert!(detector().is_entangled(&left, &left));
    }

    // Test IDs: TENT-004
    #[test]
    fn opposed_polarity_and_foreign_realm_score_low() {
        let polarity = [0.5, -0.5, 0.4, 0.3, -0.2, 0.1, 0.6];
        let inverted = polarity.map(|value| -value);
        let mut left = coordinate(Realm::Data, polarity, 0.9, 0);
        left.adjacency = [neighbor(1)].into_iter().collect();
        let mut right = coordinate(Realm::Narrative, inverted, 0.1, 30);
        right.adjacency = [neighbor(2)].into_iter().collect();

        let breakdown = detector().breakdown(&left, &right);
        assert_eq!(breakdown.components.polarity, 0.0);
        assert_eq!(breakdown.components.realm, 0.0);
        assert_eq!(breakdown.components.adjacency, 0.0);
        assert!(breakdown.score < 0.1, "score was {}", breakdown.score);
    }

    // Test IDs: TENT-005
    #[test]
    fn adjacency_overlap_handles_empty_sets() {
        let empty = coordinate(Realm::Data, [0.1; POLARITY_LEN], 0.5, 0);
        let mut populated = empty.clone();
        populated.adjacency = [neighbor(1), neighbor(2)].into_iter().collect();
        let mut partial = empty.clone();
        partial.adjacency = [neighbor(2), neighbor(3)].into_iter().collect();

        let detector = detector();
        assert_eq!(detector.breakdown(&empty, &empty).components.adjacency, 1.0);
        assert_eq!(detector.breakdown(&empty, &populated).components.adjacency, 0.0);
        let jaccard = detector.breakdown(&populated, &partial).components.adjacency;
        assert!((jaccard - 1.0 / 3.0).abs() < 1e-12);
    }

    // Test IDs: TENT-006
    #[test]
    fn adjacent_realms_use_configured_affinity() {
        let detector = detector();
        let data = coordinate(Realm::Data, [0.1; POLARITY_LEN], 0.5, 0);
        let system = coordinate(Realm::System, [0.1; POLARITY_LEN], 0.5, 0);
        let void = coordinate(Realm::Void, [0.1; POLARITY_LEN], 0.5, 0);
        assert!((detector.breakdown(&data, &system).components.realm - 0.7).abs() < 1e-12);
        assert_eq!(detector.breakdown(&system, &data).components.realm, detector.breakdown(&data, &system).components.realm);
        assert_eq!(detector.breakdown(&data, &void).components.realm, 0.0);
    }

    // Test IDs: TENT-007
    #[test]
    fn polarity_uses_only_shared_active_components() {
        let mut left = coordinate(Realm::Data, [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], 0.5, 0);
        left.dimensionality = 1;
        let mut right = coordinate(Realm::Data, [1.0, 0.9, -0.9, 0.9, 0.9, 0.9, 0.9], 0.5, 0);
        right.dimensionality = 7;
        let breakdown = detector().breakdown(&left, &right);
        assert!((breakdown.components.polarity - 1.0).abs() < 1e-12);

        let zero = coordinate(Realm::Data, [0.0; POLARITY_LEN], 0.5, 0);
        assert_eq!(detector().breakdown(&zero, &right).components.polarity, 0.0);
    }

    // Test IDs: TENT-008
    #[test]
    fn lineage_affinity_decays_with_distance() {
        let detector = detector();
        let root = coordinate(Realm::Data, [0.2; POLARITY_LEN], 0.5, 0);
        let near = coordinate(Realm::Data, [0.2; POLARITY_LEN], 0.5, 1);
        let far = coordinate(Realm::Data, [0.2; POLARITY_LEN], 0.5, 10);
        let near_affinity = detector.breakdown(&root, &near).components.lineage;
        let far_affinity = detector.breakdown(&root, &far).components.lineage;
        assert!((near_affinity - 0.9).abs() < 1e-12);
        assert!(far_affinity < near_affinity);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        // Test IDs: TENT-009
        #[test]
        fn score_is_exactly_symmetric(left in arb_coordinate(), right in arb_coordinate()) {
            let detector = detector();
            let forward = detector.breakdown(&left, &right);
            let backward = detector.breakdown(&right, &left);
            prop_assert_eq!(forward.score.to_bits(), backward.score.to_bits());
            prop_assert_eq!(forward.components, backward.components);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(1024))]

        // Test IDs: TENT-010
        #[test]
        fn score_and_components_stay_in_unit_interval(left in arb_coordinate(), right in arb_coordinate()) {
            let breakdown = detector().breakdown(&left, &right);
            let components = breakdown.components;
            for value in [
                breakdown.score,
                components.polarity,
                components.realm,
                components.adjacency,
                components.luminosity,
                components.lineage,
            ] {
                prop_assert!(value.is_finite());
                prop_assert!((0.0..=1.0).contains(&value));
            }
        }
    }
}
