//! Label ranking inside merged boxes and the pass-label override rule.

use crate::types::{group_by, DetectionBox, RankedDetection};
use std::cmp::Ordering;
use tracing::warn;

/// Assigns every candidate label of a merged box its 1-based confidence rank.
#[derive(Debug, Default, Clone, Copy)]
pub struct RankAssigner;

impl RankAssigner {
    /// Rank the rows of merged boxes.
    ///
    /// Rows are first sorted by (image, box, confidence, label) ascending and
    /// numbered in that order. Inside each (image, box) group the most
    /// confident row gets rank 1; equal confidences rank the larger sequence
    /// id first. Output is grouped by (image, box) in ascending key order.
    pub fn assign(&self, mut rows: Vec<DetectionBox>) -> Vec<RankedDetection> {
        rows.sort_by(|a, b| {
            a.image_id
                .cmp(&b.image_id)
                .then(a.box_id.cmp(&b.box_id))
                .then(a.confidence.total_cmp(&b.confidence))
                .then(a.label_id.cmp(&b.label_id))
        });

        let numbered = rows.into_iter().enumerate().map(|(row_id, detection)| RankedDetection {
            row_id,
            label_index: 0,
            detection,
        });

        let mut ranked = Vec::new();
        for (_, mut group) in group_by(numbered, |r| (r.detection.image_id, r.detection.box_id)) {
            group.sort_by(|a, b| compare_rank(b, a));
            for (i, row) in group.iter_mut().enumerate() {
                row.label_index = u32::try_from(i + 1).unwrap_or(u32::MAX);
            }
            ranked.extend(group);
        }
        ranked
    }
}

fn compare_rank(a: &RankedDetection, b: &RankedDetection) -> Ordering {
    a.detection
        .confidence
        .total_cmp(&b.detection.confidence)
        .then(a.row_id.cmp(&b.row_id))
}

/// Lets a confident pass verdict suppress weaker candidates of the same box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassOverride {
    pass_label_id: Option<u64>,
    min_gap: f64,
}

impl PassOverride {
    /// A margin outside (0, 1) disables the rule.
    pub fn new(pass_label_id: Option<u64>, min_gap: f64) -> Self {
        if pass_label_id.is_some() && !is_valid_margin(min_gap) {
            warn!(min_gap, "pass override margin outside (0, 1), pass override disabled");
        }
        Self {
            pass_label_id,
            min_gap,
        }
    }

    pub fn disabled() -> Self {
        Self {
            pass_label_id: None,
            min_gap: 0.0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.pass_label_id.is_some() && is_valid_margin(self.min_gap)
    }

    /// Filter the candidates of one (image, box) group.
    ///
    /// The group is returned in ascending rank order. When rank 1 carries the
    /// pass label, candidates trailing it by strictly more than the margin are
    /// dropped.
    pub fn apply(&self, mut group: Vec<RankedDetection>) -> Vec<RankedDetection> {
        group.sort_by_key(|r| r.label_index);
        let Some(pass_label_id) = self.pass_label_id.filter(|_| self.is_enabled()) else {
            return group;
        };
        let Some(top) = group.first() else {
            return group;
        };
        if top.detection.label_id != pass_label_id {
            return group;
        }

        let top_confidence = top.detection.confidence;
        let mut kept = Vec::with_capacity(group.len());
        for (i, row) in group.into_iter().enumerate() {
            if i > 0 && top_confidence - row.detection.confidence > self.min_gap {
                continue;
            }
            kept.push(row);
        }
        kept
    }
}

fn is_valid_margin(min_gap: f64) -> bool {
    min_gap > 0.0 && min_gap < 1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(box_id: u64, label_id: u64, confidence: f64) -> DetectionBox {
        DetectionBox::new(1, label_id, confidence, 0.5, 0.5, 0.1, 0.1, box_id)
    }

    fn ranked_group(rows: &[(u64, f64)]) -> Vec<RankedDetection> {
        RankAssigner.assign(rows.iter().map(|&(label, conf)| row(1, label, conf)).collect())
    }

    #[test]
    fn test_ranks_follow_confidence() {
        let ranked = RankAssigner.assign(vec![row(1, 0, 0.2), row(1, 1, 0.9), row(1, 2, 0.5), row(2, 0, 0.1)]);
        let ranks: Vec<_> = ranked
            .iter()
            .map(|r| (r.detection.box_id, r.detection.label_id, r.label_index))
            .collect();
        assert_eq!(ranks, vec![(1, 1, 1), (1, 2, 2), (1, 0, 3), (2, 0, 1)]);
    }

    #[test]
    fn test_sequence_ids_follow_sorted_order() {
        let ranked = RankAssigner.assign(vec![row(2, 0, 0.1), row(1, 0, 0.9), row(1, 1, 0.2)]);
        let by_label: Vec<_> = ranked.iter().map(|r| (r.detection.box_id, r.row_id)).collect();
        assert_eq!(by_label, vec![(1, 1), (1, 0), (2, 2)]);
    }

    #[test]
    fn test_confidence_tie_ranks_larger_id_first() {
        let ranked = RankAssigner.assign(vec![row(1, 0, 0.5), row(1, 3, 0.5)]);
        assert_eq!(ranked[0].detection.label_id, 3);
        assert_eq!(ranked[0].label_index, 1);
        assert_eq!(ranked[1].detection.label_id, 0);
    }

    #[test]
    fn test_pass_override_boundary() {
        let rule = PassOverride::new(Some(3), 0.75);

        let kept = rule.apply(ranked_group(&[(3, 1.0), (0, 0.25)]));
        assert_eq!(kept.len(), 2);

        let kept = rule.apply(ranked_group(&[(3, 1.0), (0, 0.249)]));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].detection.label_id, 3);
    }

    #[test]
    fn test_pass_override_needs_pass_on_top() {
        let rule = PassOverride::new(Some(3), 0.5);
        let kept = rule.apply(ranked_group(&[(0, 0.95), (3, 0.9), (1, 0.01)]));
        assert_eq!(kept.len(), 3);
    }

    #[test]
    fn test_invalid_margin_disables_rule() {
        for margin in [0.0, 1.0, 1.5, -0.2] {
            let rule = PassOverride::new(Some(3), margin);
            assert!(!rule.is_enabled());
            let kept = rule.apply(ranked_group(&[(3, 1.0), (0, 0.0001)]));
            assert_eq!(kept.len(), 2);
        }
    }
}
