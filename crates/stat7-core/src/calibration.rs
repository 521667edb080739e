use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::address::compute_address;
use crate::coordinate::{Address, Coordinate, Horizon, Realm, POLARITY_LEN};
use crate::entanglement::{EntanglementConfig, EntanglementDetector, ScoreComponents, ScoreWeights};

const MAX_THRESHOLD_STEPS: u32 = 100_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LabeledPair {
    pub pair_id: String,
    pub left: Coordinate,
    pub right: Coordinate,
    pub entangled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairScore {
    pub pair_id: String,
    pub entangled: bool,
    pub score: f64,
    pub components: ScoreComponents,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ConfusionMatrix {
    pub threshold: f64,
    pub true_positives: u64,
    pub false_positives: u64,
    pub false_negatives: u64,
    pub true_negatives: u64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
}

impl ConfusionMatrix {
    #[must_use]
    pub fn at_threshold(scores: &[PairScore], threshold: f64) -> Self {
        let (mut tp, mut fp, mut fn_, mut tn) = (0_u64, 0_u64, 0_u64, 0_u64);
        for pair in scores {
            match (pair.score >= threshold, pair.entangled) {
                (true, true) => tp += 1,
                (true, false) => fp += 1,
                (false, true) => fn_ += 1,
                (false, false) => tn += 1,
            }
        }
        let ratio = |numerator: u64, denominator: u64| {
            if denominator == 0 {
                0.0
            } else {
                to_f64(numerator) / to_f64(denominator)
            }
        };
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1_score = if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        };
        Self {
            threshold,
            true_positives: tp,
            false_positives: fp,
            false_negatives: fn_,
            true_negatives: tn,
            precision,
            recall,
            f1_score,
        }
    }

    #[must_use]
    pub fn meets(&self, min_precision: f64, min_recall: f64) -> bool {
        self.precision >= min_precision && self.recall >= min_recall
    }
}

fn to_f64(value: u64) -> f64 {
    f64::from(u32::try_from(value).unwrap_or(u32::MAX))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CalibrationOptions {
    pub start: f64,
    pub end: f64,
    pub step: f64,
    pub min_precision: f64,
    pub min_recall: f64,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        Self {
            start: 0.0,
            end: 1.0,
            step: 0.01,
            min_precision: 0.90,
            min_recall: 0.85,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalibrationReport {
    pub weights: ScoreWeights,
    pub options: CalibrationOptions,
    pub selected: ConfusionMatrix,
    pub thresholds: Vec<ConfusionMatrix>,
    pub pair_scores: Vec<PairScore>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum CalibrationError {
    #[error("calibration requires at least one entangled and one non-entangled labeled pair")]
    MissingLabels,
    #[error("invalid calibration options: {0}")]
    InvalidOptions(String),
    #[error(
        "no threshold satisfies precision >= {min_precision} and recall >= {min_recall}; best f1 was {best_f1}"
    )]
    NoThresholdMeetsFloors {
        min_precision: f64,
        min_recall: f64,
        best_f1: f64,
    },
}

fn validate_options(options: &CalibrationOptions) -> Result<(), CalibrationError> {
    let CalibrationOptions {
        start,
        end,
        step,
        min_precision,
        min_recall,
    } = *options;
    if !(start.is_finite() && end.is_finite() && step.is_finite()) {
        return Err(CalibrationError::InvalidOptions(
            "start, end and step must be finite".to_string(),
        ));
    }
    if step <= 0.0 || start > end || start < 0.0 || end > 1.0 {
        return Err(CalibrationError::InvalidOptions(format!(
            "expected 0 <= start <= end <= 1 and step > 0, got start={start} end={end} step={step}"
        )));
    }
    if (end - start) / step > f64::from(MAX_THRESHOLD_STEPS) {
        return Err(CalibrationError::InvalidOptions(format!(
            "step {step} yields more than {MAX_THRESHOLD_STEPS} thresholds"
        )));
    }
    for (name, floor) in [("min_precision", min_precision), ("min_recall", min_recall)] {
        if !(0.0..=1.0).contains(&floor) {
            return Err(CalibrationError::InvalidOptions(format!(
                "{name} must be in [0, 1], got {floor}"
            )));
        }
    }
    Ok(())
}

fn thresholds(options: &CalibrationOptions) -> Vec<f64> {
    let mut out = Vec::new();
    for step_index in 0..=MAX_THRESHOLD_STEPS {
        let raw = options.start + f64::from(step_index) * options.step;
        if raw > options.end + 1e-12 {
            break;
        }
        out.push((raw * 1e8).round() / 1e8);
    }
    out
}

/// Sweeps thresholds over scored labeled pairs and selects the one with the
/// highest F1 among those meeting both floors. Ties prefer higher precision,
/// then the higher threshold.
///
/// # Errors
/// Returns `CalibrationError` when either label class is missing, options are
/// invalid, or no threshold meets both floors.
pub fn calibrate(
    pairs: &[LabeledPair],
    detector: &EntanglementDetector,
    options: &CalibrationOptions,
) -> Result<CalibrationReport, CalibrationError> {
    validate_options(options)?;
    let positives = pairs.iter().filter(|pair| pair.entangled).count();
    if positives == 0 || positives == pairs.len() {
        return Err(CalibrationError::MissingLabels);
    }

    let pair_scores = pairs
        .iter()
        .map(|pair| {
            let breakdown = detector.breakdown(&pair.left, &pair.right);
            PairScore {
                pair_id: pair.pair_id.clone(),
                entangled: pair.entangled,
                score: breakdown.score,
                components: breakdown.components,
            }
        })
        .collect::<Vec<_>>();

    let sweep = thresholds(options)
        .into_iter()
        .map(|threshold| ConfusionMatrix::at_threshold(&pair_scores, threshold))
        .collect::<Vec<_>>();

    let selected = sweep
        .iter()
        .filter(|matrix| matrix.meets(options.min_precision, options.min_recall))
        .max_by(|a, b| {
            a.f1_score
                .total_cmp(&b.f1_score)
                .then(a.precision.total_cmp(&b.precision))
                .then(a.threshold.total_cmp(&b.threshold))
        })
        .copied();

    let Some(selected) = selected else {
        let best_f1 = sweep
            .iter()
            .map(|matrix| matrix.f1_score)
            .fold(0.0_f64, f64::max);
        return Err(CalibrationError::NoThresholdMeetsFloors {
            min_precision: options.min_precision,
            min_recall: options.min_recall,
            best_f1,
        });
    };

    Ok(CalibrationReport {
        weights: detector.config().weights,
        options: *options,
        selected,
        thresholds: sweep,
        pair_scores,
    })
}

struct SplitMix64(u64);

impl SplitMix64 {
    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut value = self.0;
        value = (value ^ (value >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        value = (value ^ (value >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        value ^ (value >> 31)
    }

    /// Uniform in [0, 1].
    fn unit(&mut self) -> f64 {
        f64::from(u32::try_from(self.next_u64() >> 32).unwrap_or(u32::MAX)) / f64::from(u32::MAX)
    }

    fn signed(&mut self, magnitude: f64) -> f64 {
        (self.unit() * 2.0 - 1.0) * magnitude
    }
}

fn synthetic_neighbor(seed: u64, pair: usize, slot: usize) -> Address {
    compute_address(
        &Coordinate::genesis(Realm::Void, 0.0, 1),
        format!("synthetic-neighbor-{seed}-{pair}-{slot}").as_bytes(),
    )
}

fn distinct_unrelated_realms(config: &EntanglementConfig) -> Vec<(Realm, Realm)> {
    let mut out = Vec::new();
    for left in Realm::ALL {
        for right in Realm::ALL {
            if left < right && !config.realms_adjacent(left, right) {
                out.push((left, right));
            }
        }
    }
    out
}

/// Generates a seeded validation set.
///
/// Entangled pairs share a realm, have polarity cosine above 0.99, adjacency
/// Jaccard overlap of 0.6, luminosity within 0.03 and lineage at most one step
/// apart. Non-entangled pairs sit in unrelated realms with polarity cosine below
/// -0.9, disjoint adjacency, luminosity within 0.05 and lineage 20 to 24 steps
/// apart.
#[must_use]
pub fn synthetic_validation_set(
    config: &EntanglementConfig,
    seed: u64,
    true_pairs: usize,
    false_pairs: usize,
) -> Vec<LabeledPair> {
    let mut rng = SplitMix64(seed);
    let mut pairs = Vec::with_capacity(true_pairs + false_pairs);

    for index in 0..true_pairs {
        let realm = Realm::ALL[index % Realm::ALL.len()];
        let mut polarity = [0.0; POLARITY_LEN];
        for component in &mut polarity {
            let magnitude = 0.3 + 0.6 * rng.unit();
            *component = if rng.next_u64() % 2 == 0 { magnitude } else { -magnitude };
        }
        let jittered = polarity.map(|value: f64| (value + rng.signed(0.02)).clamp(-1.0, 1.0));

        let shared = (0..3)
            .map(|slot| synthetic_neighbor(seed, index, slot))
            .collect::<BTreeSet<_>>();
        let mut left_adjacency = shared.clone();
        left_adjacency.insert(synthetic_neighbor(seed, index, 3));
        let mut right_adjacency = shared;
        right_adjacency.insert(synthetic_neighbor(seed, index, 4));

        let luminosity = 0.1 + 0.8 * rng.unit();
        let lineage = u32::try_from(index % 16).unwrap_or(0);
        let left = Coordinate {
            realm,
            lineage,
            adjacency: left_adjacency,
            horizon: Horizon::Emergence,
            luminosity,
            polarity,
            dimensionality: 7,
        };
        let right = Coordinate {
            realm,
            lineage: lineage + u32::from(index % 2 == 1),
            adjacency: right_adjacency,
            horizon: Horizon::Peak,
            luminosity: (luminosity + rng.signed(0.03)).clamp(0.0, 1.0),
            polarity: jittered,
            dimensionality: 7,
        };
        pairs.push(LabeledPair {
            pair_id: format!("true-{index:04}"),
            left,
            right,
            entangled: true,
        });
    }

    let unrelated = distinct_unrelated_realms(config);
    for index in 0..false_pairs {
        let (left_realm, right_realm) = unrelated
            .get(index % unrelated.len().max(1))
            .copied()
            .unwrap_or((Realm::Data, Realm::Void));
        let mut polarity = [0.0; POLARITY_LEN];
        for component in &mut polarity {
            let magnitude = 0.3 + 0.6 * rng.unit();
            *component = if rng.next_u64() % 2 == 0 { magnitude } else { -magnitude };
        }
        let opposed = polarity.map(|value: f64| (-value + rng.signed(0.05)).clamp(-1.0, 1.0));
        let lineage = u32::try_from(index % 8).unwrap_or(0);
        let offset = u32::try_from(20 + index % 5).unwrap_or(20);
        let luminosity = 0.05 + 0.9 * rng.unit();
        let right_luminosity = (luminosity + rng.signed(0.05)).clamp(0.0, 1.0);

        let left = Coordinate {
            realm: left_realm,
            lineage,
            adjacency: [synthetic_neighbor(seed, true_pairs + index, 0)].into_iter().collect(),
            horizon: Horizon::Genesis,
            luminosity,
            polarity,
            dimensionality: 7,
        };
        let right = Coordinate {
            realm: right_realm,
            lineage: lineage + offset,
            adjacency: [synthetic_neighbor(seed, true_pairs + index, 1)].into_iter().collect(),
            horizon: Horizon::Decay,
            luminosity: right_luminosity,
            polarity: opposed,
            dimensionality: 7,
        };
        pairs.push(LabeledPair {
            pair_id: format!("false-{index:04}"),
            left,
            right,
            entangled: false,
        });
    }

    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entanglement::count_as_f64;

    fn mean(values: impl IntoIterator<Item = f64>) -> f64 {
        let (sum, count) = values
            .into_iter()
            .fold((0.0, 0_usize), |(sum, count), value| (sum + value, count + 1));
        if count == 0 {
            0.0
        } else {
            sum / count_as_f64(count)
        }
    }

    fn scored(entangled: bool, score: f64) -> PairScore {
        PairScore {
            pair_id: format!("{entangled}-{score}"),
            entangled,
            score,
            components: ScoreComponents {
                polarity: 0.0,
                realm: 0.0,
                adjacency: 0.0,
                luminosity: 0.0,
                lineage: 0.0,
            },
        }
    }

    // Test IDs: TCAL-001
    #[test]
    fn confusion_matrix_counts_at_threshold() {
        let scores = vec![
            scored(true, 0.9),
            scored(true, 0.6),
            scored(false, 0.7),
            scored(false, 0.1),
        ];
        let matrix = ConfusionMatrix::at_threshold(&scores, 0.65);
        assert_eq!(matrix.true_positives, 1);
        assert_eq!(matrix.false_positives, 1);
        assert_eq!(matrix.false_negatives, 1);
        assert_eq!(matrix.true_negatives, 1);
        assert!((matrix.precision - 0.5).abs() < 1e-12);
        assert!((matrix.recall - 0.5).abs() < 1e-12);
    }

    // Test IDs: TCAL-002
    #[test]
    fn synthetic_true_pairs_outscore_false_pairs_by_a_wide_margin() {
        let detector = EntanglementDetector::default();
        let pairs = synthetic_validation_set(detector.config(), 7, 200, 200);
        let score = |pair: &LabeledPair| detector.score(&pair.left, &pair.right);

        let true_mean = mean(pairs.iter().filter(|pair| pair.entangled).map(score));
        let false_mean = mean(pairs.iter().filter(|pair| !pair.entangled).map(score));
        assert!(true_mean > 0.85, "true mean was {true_mean}");
        assert!(false_mean < 0.25, "false mean was {false_mean}");
        assert!(true_mean > 3.0 * false_mean);
    }

    // Test IDs: TCAL-003
    #[test]
    fn calibrate_selects_threshold_meeting_floors() {
        let detector = EntanglementDetector::default();
        let pairs = synthetic_validation_set(detector.config(), 42, 100, 100);
        let report = match calibrate(&pairs, &detector, &CalibrationOptions::default()) {
            Ok(report) => report,
            Err(err) => panic!("calibration failed: {err}"),
        };
        assert!(report.selected.precision >= 0.90);
        assert!(report.selected.recall >= 0.85);
        let lowest_true = report
            .pair_scores
            .iter()
            .filter(|pair| pair.entangled)
            .map(|pair| pair.score)
            .fold(f64::INFINITY, f64::min);
        let highest_false = report
            .pair_scores
            .iter()
            .filter(|pair| !pair.entangled)
            .map(|pair| pair.score)
            .fold(0.0_f64, f64::max);
        assert!(report.selected.threshold > highest_false);
        assert!(report.selected.threshold <= lowest_true);
        assert_eq!(report.thresholds.len(), 101);
        assert_eq!(report.pair_scores.len(), 200);
    }

    // Test IDs: TCAL-004
    #[test]
    fn calibrate_prefers_higher_threshold_on_full_ties() {
        let detector = EntanglementDetector::default();
        let pairs = synthetic_validation_set(detector.config(), 3, 20, 20);
        let report = match calibrate(
            &pairs,
            &detector,
            &CalibrationOptions {
                start: 0.4,
                end: 0.6,
                step: 0.1,
                ..CalibrationOptions::default()
            },
        ) {
            Ok(report) => report,
            Err(err) => panic!("calibration failed: {err}"),
        };
        // Perfectly separated data: every threshold in [0.4, 0.6] ties on f1 and precision.
        assert!((report.selected.threshold - 0.6).abs() < 1e-9);
    }

    // Test IDs: TCAL-005
    #[test]
    fn calibrate_rejects_single_class_and_bad_options() {
        let detector = EntanglementDetector::default();
        let only_true = synthetic_validation_set(detector.config(), 1, 5, 0);
        assert_eq!(
            calibrate(&only_true, &detector, &CalibrationOptions::default()),
            Err(CalibrationError::MissingLabels)
        );

        let pairs = synthetic_validation_set(detector.config(), 1, 5, 5);
        let bad = CalibrationOptions {
            step: 0.0,
            ..CalibrationOptions::default()
        };
        assert!(matches!(
            calibrate(&pairs, &detector, &bad),
            Err(CalibrationError::InvalidOptions(_))
        ));
    }

    // Test IDs: TCAL-006
    #[test]
    fn unreachable_floors_report_best_f1() {
        let detector = EntanglementDetector::default();
        let pairs = synthetic_validation_set(detector.config(), 9, 10, 10);
        let options = CalibrationOptions {
            start: 0.99,
            end: 1.0,
            step: 0.01,
            min_precision: 1.0,
            min_recall: 1.0,
        };
        assert!(matches!(
            calibrate(&pairs, &detector, &options),
            Err(CalibrationError::NoThresholdMeetsFloors { .. })
        ));
    }

    // Test IDs: TCAL-007
    #[test]
    fn synthetic_set_is_reproducible_per_seed() {
        let config = EntanglementConfig::default();
        assert_eq!(
            synthetic_validation_set(&config, 11, 4, 4),
            synthetic_validation_set(&config, 11, 4, 4)
        );
        assert_ne!(
            synthetic_validation_set(&config, 11, 4, 4),
            synthetic_validation_set(&config, 12, 4, 4)
        );
    }

    fn raw_cosine(left: &Coordinate, right: &Coordinate) -> f64 {
        let dot: f64 = left.polarity.iter().zip(&right.polarity).map(|(a, b)| a * b).sum();
        let left_norm: f64 = left.polarity.iter().map(|a| a * a).sum::<f64>().sqrt();
        let right_norm: f64 = right.polarity.iter().map(|b| b * b).sum::<f64>().sqrt();
        dot / (left_norm * right_norm)
    }

    fn jaccard(left: &Coordinate, right: &Coordinate) -> f64 {
        let shared = left.adjacency.intersection(&right.adjacency).count();
        let union = left.adjacency.union(&right.adjacency).count();
        count_as_f64(shared) / count_as_f64(union)
    }

    // Test IDs: TCAL-008
    #[test]
    fn twenty_by_twenty_fixture_has_declared_shape_and_separates() {
        let detector = EntanglementDetector::default();
        let pairs = synthetic_validation_set(detector.config(), 7, 20, 20);
        assert_eq!(pairs.len(), 40);

        for pair in pairs.iter().filter(|pair| pair.entangled) {
            let (left, right) = (&pair.left, &pair.right);
            assert_eq!(left.realm, right.realm, "{}", pair.pair_id);
            assert!(raw_cosine(left, right) > 0.99, "{}", pair.pair_id);
            assert!(jaccard(left, right) >= 0.4, "{}", pair.pair_id);
            assert!(left.lineage.abs_diff(right.lineage) <= 1, "{}", pair.pair_id);
        }
        for pair in pairs.iter().filter(|pair| !pair.entangled) {
            let (left, right) = (&pair.left, &pair.right);
            assert_ne!(left.realm, right.realm, "{}", pair.pair_id);
            assert!(!detector.config().realms_adjacent(left.realm, right.realm));
            assert!(raw_cosine(left, right) < -0.5, "{}", pair.pair_id);
            assert!(left.adjacency.is_disjoint(&right.adjacency), "{}", pair.pair_id);
            assert!(left.lineage.abs_diff(right.lineage) >= 20, "{}", pair.pair_id);
        }

        let score = |pair: &LabeledPair| detector.score(&pair.left, &pair.right);
        let true_mean = mean(pairs.iter().filter(|pair| pair.entangled).map(score));
        let false_mean = mean(pairs.iter().filter(|pair| !pair.entangled).map(score));
        assert!((true_mean - 0.91).abs() <= 0.02, "true mean was {true_mean}");
        // With P, R and A all zero only luminosity and lineage contribute, which caps
        // a false pair at 0.10 + 0.05 * 0.9^20.
        let false_ceiling = 0.10 + 0.05 * 0.9_f64.powi(20);
        assert!(false_mean <= false_ceiling, "false mean was {false_mean}");
        assert!(false_mean >= 0.09, "false mean was {false_mean}");
        assert!(true_mean >= 3.0 * false_mean);
    }
}
