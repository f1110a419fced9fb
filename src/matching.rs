//! Ground-truth matching: a per-image full outer join of annotations and predictions.

use crate::metrics::iou::is_within_reach;
use crate::types::{group_by, Extent, GroundTruthBox, MatchRow, Prediction};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Full outer join of two box lists under the proximity predicate.
///
/// Every matching (GT, P) pair comes first, in GT-major order, followed by the
/// unmatched GT boxes and then the unmatched predictions. Every input box
/// appears in at least one output pair.
pub fn full_join<'a, G: Extent, P: Extent>(
    ground_truths: &'a [G],
    predictions: &'a [P],
) -> Vec<(Option<&'a G>, Option<&'a P>)> {
    let mut matched_gt = vec![false; ground_truths.len()];
    let mut matched_p = vec![false; predictions.len()];
    let mut pairs = Vec::new();

    for (gt_idx, gt) in ground_truths.iter().enumerate() {
        for (p_idx, pred) in predictions.iter().enumerate() {
            if !is_within_reach(gt, pred) {
                continue;
            }
            matched_gt[gt_idx] = true;
            matched_p[p_idx] = true;
            pairs.push((Some(gt), Some(pred)));
        }
    }

    pairs.extend(
        ground_truths
            .iter()
            .zip(&matched_gt)
            .filter(|(_, &matched)| !matched)
            .map(|(gt, _)| (Some(gt), None)),
    );
    pairs.extend(
        predictions
            .iter()
            .zip(&matched_p)
            .filter(|(_, &matched)| !matched)
            .map(|(pred, _)| (None, Some(pred))),
    );
    pairs
}

/// Matches prediction rows of any pipeline stage against one ground-truth set.
#[derive(Debug)]
pub struct GtMatcher<'a> {
    ground_truth: BTreeMap<u64, Vec<&'a GroundTruthBox>>,
}

impl<'a> GtMatcher<'a> {
    pub fn new(ground_truth: &'a [GroundTruthBox]) -> Self {
        Self {
            ground_truth: group_by(ground_truth.iter(), |gt| gt.image_id),
        }
    }

    /// Join the predictions against the ground truth, image by image.
    ///
    /// Predictions labelled `drop_label_id` are removed before joining. Images
    /// are visited in ascending id order over the union of both sides.
    pub fn run<P: Prediction>(&self, predictions: &[P], drop_label_id: Option<u64>) -> Vec<MatchRow> {
        let kept = predictions
            .iter()
            .filter(|p| drop_label_id.map_or(true, |drop| p.label_id() != drop));
        let predictions_by_image = group_by(kept, |p| p.image_id());

        let image_ids: BTreeSet<u64> = self
            .ground_truth
            .keys()
            .chain(predictions_by_image.keys())
            .copied()
            .collect();

        let mut rows = Vec::new();
        for image_id in image_ids {
            let gts = self.ground_truth.get(&image_id).map_or(&[][..], Vec::as_slice);
            let preds = predictions_by_image.get(&image_id).map_or(&[][..], Vec::as_slice);
            for (gt, pred) in full_join(gts, preds) {
                rows.push(MatchRow {
                    image_id,
                    gt_box_id: gt.map(|g| g.box_id),
                    gt_label_id: gt.map(|g| g.label_id),
                    p_box_id: pred.map(|p| p.box_id()),
                    p_label_id: pred.map(|p| p.label_id()),
                    p_label_index: pred.and_then(|p| p.label_index()),
                    confidence: pred.map(|p| p.confidence()),
                });
            }
        }
        debug!(rows = rows.len(), dropped_label = ?drop_label_id, "matched predictions with ground truth");
        rows
    }
}
