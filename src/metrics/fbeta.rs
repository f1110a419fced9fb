//! F-beta score and the composite defect objective minimised by the optimizer.
//!
//! The objective blends `1 - F` (recall-heavy F-score over match/miss/wrong
//! counts) with the overkill rate.

use serde::{Deserialize, Serialize};

/// Beta of the defect F-score. `beta² = 4` weights recall four times precision.
pub const DEFECT_FBETA: f64 = 2.0;

/// Calculate precision from confusion counts: TP / (TP + FP), 0.0 when empty.
///
/// # Examples
///
/// ```
/// # use defect_eval::metrics::fbeta::calculate_precision;
/// assert_eq!(calculate_precision(80, 20), 0.8);
/// assert_eq!(calculate_precision(0, 0), 0.0);
/// ```
#[must_use]
pub fn calculate_precision(tp: usize, fp: usize) -> f64 {
    let denominator = tp + fp;
    if denominator == 0 {
        return 0.0;
    }

    #[allow(clippy::cast_precision_loss)]
    let precision = (tp as f64) / (denominator as f64);
    debug_assert!((0.0..=1.0).contains(&precision));
    precision
}

/// Calculate recall from confusion counts: TP / (TP + FN), 0.0 when empty.
#[must_use]
pub fn calculate_recall(tp: usize, fn_: usize) -> f64 {
    let denominator = tp + fn_;
    if denominator == 0 {
        return 0.0;
    }

    #[allow(clippy::cast_precision_loss)]
    let recall = (tp as f64) / (denominator as f64);
    debug_assert!((0.0..=1.0).contains(&recall));
    recall
}

/// Calculate the F-beta score from precision and recall.
///
/// F-beta = (1 + beta²) * precision * recall / ((beta² * precision) + recall)
///
/// # Panics
///
/// Panics if beta is not positive
///
/// # Examples
///
/// ```
/// # use defect_eval::metrics::fbeta::calculate_fbeta;
/// let f2 = calculate_fbeta(0.8, 0.9, 2.0);
/// assert!((f2 - 0.877).abs() < 0.001);
/// ```
#[must_use]
pub fn calculate_fbeta(precision: f64, recall: f64, beta: f64) -> f64 {
    assert!(beta > 0.0, "Beta must be positive, got {beta}");

    if precision + recall == 0.0 {
        return 0.0;
    }

    let beta_squared = beta * beta;
    let denominator = (beta_squared * precision) + recall;
    if denominator == 0.0 {
        return 0.0;
    }

    let fbeta = (1.0 + beta_squared) * precision * recall / denominator;
    debug_assert!(
        (0.0..=1.0).contains(&fbeta),
        "F-beta must be between 0 and 1, got {fbeta} (precision={precision}, recall={recall}, beta={beta})"
    );
    fbeta
}

/// Per-label defect outcome counts feeding the search objective.
///
/// Matches count as true positives, misses as false negatives and wrong
/// labels as false positives.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DefectScore {
    pub matched: usize,
    pub missed: usize,
    pub wrong: usize,
    /// Overkill rate as a fraction; 0.0 when undefined.
    pub overkill_rate: f64,
}

impl DefectScore {
    pub fn new(matched: usize, missed: usize, wrong: usize, overkill_rate: f64) -> Self {
        Self {
            matched,
            missed,
            wrong,
            overkill_rate,
        }
    }

    /// Recall-weighted F-score of the defect counts.
    #[must_use]
    pub fn fscore(&self) -> f64 {
        let precision = calculate_precision(self.matched, self.wrong);
        let recall = calculate_recall(self.matched, self.missed);
        calculate_fbeta(precision, recall, DEFECT_FBETA)
    }

    /// `(1 - w) * (1 - F) + w * overkill_rate`; smaller is better.
    ///
    /// `overkill_weight` must lie in (0, 1); the optimizer config validates it.
    #[must_use]
    pub fn objective(&self, overkill_weight: f64) -> f64 {
        debug_assert!(overkill_weight > 0.0 && overkill_weight < 1.0);
        let fscore = self.fscore();
        tracing::trace!(
            one_minus_fscore = 1.0 - fscore,
            overkill = self.overkill_rate,
            "defect objective terms"
        );
        (1.0 - overkill_weight) * (1.0 - fscore) + overkill_weight * self.overkill_rate
    }
}
