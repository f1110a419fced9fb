//! Image-level pass / NG verdicts.
//!
//! An image is "pass" when it carries no label at all, or only the pass
//! label. Anything else is NG.

use crate::metrics::calculator::format_rate;
use crate::types::{GroundTruthBox, Prediction};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Image-level accuracy, miss and overkill counts over the ground-truth images.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageMetrics {
    pub total_count: usize,
    pub gt_pass_count: usize,
    pub gt_ng_count: usize,
    pub acc_count: usize,
    pub miss_count: usize,
    pub overkill_count: usize,
    /// Images predicted pass whose annotation is NG.
    pub missed_image_ids: Vec<u64>,
    /// Images predicted NG whose annotation is pass.
    pub overkill_image_ids: Vec<u64>,
}

/// Exported row of [`ImageMetrics`]; rates are percent strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetricsRow {
    pub total_count: usize,
    pub gt_pass_count: usize,
    pub gt_ng_count: usize,
    pub acc_rate: String,
    pub acc_count: usize,
    pub miss_rate: String,
    pub miss_count: usize,
    pub overkill_rate: String,
    pub overkill_count: usize,
}

fn is_pass(labels: Option<&BTreeSet<u64>>, pass_label_id: u64) -> bool {
    match labels {
        None => true,
        Some(labels) => labels.iter().all(|&label| label == pass_label_id),
    }
}

impl ImageMetrics {
    /// Compare the image verdicts of `predictions` with the ground truth.
    ///
    /// Only images present in the ground truth are counted.
    pub fn compute<P: Prediction>(ground_truth: &[GroundTruthBox], predictions: &[P], pass_label_id: u64) -> Self {
        let mut gt_labels: BTreeMap<u64, BTreeSet<u64>> = BTreeMap::new();
        for gt in ground_truth {
            gt_labels.entry(gt.image_id).or_default().insert(gt.label_id);
        }
        let mut predicted_labels: BTreeMap<u64, BTreeSet<u64>> = BTreeMap::new();
        for p in predictions {
            predicted_labels.entry(p.image_id()).or_default().insert(p.label_id());
        }

        let mut metrics = ImageMetrics {
            total_count: gt_labels.len(),
            ..Self::default()
        };
        for (&image_id, labels) in &gt_labels {
            let gt_pass = is_pass(Some(labels), pass_label_id);
            let predicted_pass = is_pass(predicted_labels.get(&image_id), pass_label_id);
            if gt_pass {
                metrics.gt_pass_count += 1;
            } else {
                metrics.gt_ng_count += 1;
            }
            match (predicted_pass, gt_pass) {
                (true, true) | (false, false) => metrics.acc_count += 1,
                (true, false) => {
                    metrics.miss_count += 1;
                    metrics.missed_image_ids.push(image_id);
                }
                (false, true) => {
                    metrics.overkill_count += 1;
                    metrics.overkill_image_ids.push(image_id);
                }
            }
        }
        metrics
    }

    fn base(&self) -> usize {
        self.total_count.max(1)
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn acc_rate(&self) -> f64 {
        self.acc_count as f64 / self.base() as f64
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn miss_rate(&self) -> f64 {
        self.miss_count as f64 / self.base() as f64
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn overkill_rate(&self) -> f64 {
        self.overkill_count as f64 / self.base() as f64
    }

    pub fn to_row(&self) -> ImageMetricsRow {
        let rate = |count| format_rate(count, self.base()).unwrap_or_default();
        ImageMetricsRow {
            total_count: self.total_count,
            gt_pass_count: self.gt_pass_count,
            gt_ng_count: self.gt_ng_count,
            acc_rate: rate(self.acc_count),
            acc_count: self.acc_count,
            miss_rate: rate(self.miss_count),
            miss_count: self.miss_count,
            overkill_rate: rate(self.overkill_count),
            overkill_count: self.overkill_count,
        }
    }
}
