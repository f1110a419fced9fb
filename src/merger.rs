//! Two-phase geometric merging of the detections of one image.
//!
//! Phase 1 greedily pairs the most confident box with its nearest neighbour
//! as long as the merged extent stays under the size thresholds. Phase 2
//! clusters the survivors by overlap and expands every cluster into one row
//! per distinct label.

use crate::error::{DefectEvalError, Result};
use crate::metrics::iou::{calculate_iou, center_distance, is_coarse_overlap, outer_bounds};
use crate::types::{DetectionBox, RunState};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// Size and overlap bounds of the merge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MergeThresholds {
    /// A phase-1 merge is rejected when the merged area reaches this value.
    pub area_threshold: f64,
    /// A phase-1 merge is rejected when the merged length or width reaches this value.
    pub length_threshold: f64,
    /// Phase-2 clusters need an overlap ratio above this value.
    pub iou_threshold: f64,
}

impl Default for MergeThresholds {
    fn default() -> Self {
        Self {
            area_threshold: 0.05,
            length_threshold: 0.25,
            iou_threshold: 0.9,
        }
    }
}

impl MergeThresholds {
    pub fn validate(&self) -> Result<()> {
        let values = [
            ("area_threshold", self.area_threshold),
            ("length_threshold", self.length_threshold),
            ("iou_threshold", self.iou_threshold),
        ];
        for (name, value) in values {
            if !value.is_finite() || value < 0.0 {
                return Err(DefectEvalError::InvalidHyperParameter(format!(
                    "{name} must be a finite non-negative number, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Boxes of one merge run indexed by id, plus the id counter for new boxes.
#[derive(Debug)]
struct BoxArena {
    index: HashMap<u64, DetectionBox>,
    next_id: u64,
}

impl BoxArena {
    fn new(boxes: &[DetectionBox]) -> Self {
        let next_id = boxes.iter().map(|b| b.box_id).max().map_or(1, |max| max + 1);
        let index = boxes.iter().map(|b| (b.box_id, b.clone())).collect();
        Self { index, next_id }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn insert(&mut self, bbox: DetectionBox) {
        self.index.insert(bbox.box_id, bbox);
    }

    fn get(&self, box_id: u64) -> Option<&DetectionBox> {
        self.index.get(&box_id)
    }
}

/// Merge two boxes into their outer bounding box.
///
/// Returns the centre distance of the sources and the merged box. The merged
/// box keeps the higher confidence and the label of the strictly more
/// confident source (the second box on ties). Its id and lineage are left for
/// the caller to set.
pub fn merge_pair(a: &DetectionBox, b: &DetectionBox) -> (f64, DetectionBox) {
    let bounds = outer_bounds(a, b);
    let label_id = if a.confidence > b.confidence {
        a.label_id
    } else {
        b.label_id
    };
    let merged = DetectionBox::new(
        a.image_id,
        label_id,
        a.confidence.max(b.confidence),
        bounds.center_x(),
        bounds.center_y(),
        bounds.length(),
        bounds.width(),
        0,
    );
    (center_distance(a, b), merged)
}

/// Merges the boxes of a single image. Runs exactly once.
#[derive(Debug)]
pub struct BoxMerger {
    boxes: Vec<DetectionBox>,
    thresholds: MergeThresholds,
    arena: BoxArena,
    state: RunState,
}

impl BoxMerger {
    /// Create a merger over the boxes of one image.
    ///
    /// # Errors
    ///
    /// Returns an error if the boxes come from more than one image.
    pub fn new(boxes: Vec<DetectionBox>, thresholds: MergeThresholds) -> Result<Self> {
        if let Some(first) = boxes.first() {
            if let Some(other) = boxes.iter().find(|b| b.image_id != first.image_id) {
                return Err(DefectEvalError::InvalidConfig(format!(
                    "boxes from images {} and {} cannot be merged together",
                    first.image_id, other.image_id
                )));
            }
        }
        let arena = BoxArena::new(&boxes);
        Ok(Self {
            boxes,
            thresholds,
            arena,
            state: RunState::NotRun,
        })
    }

    /// Run both phases and return one row per (merged box, label).
    pub fn run(&mut self) -> Result<Vec<DetectionBox>> {
        self.state.begin("box merger")?;
        let boxes = std::mem::take(&mut self.boxes);
        let merged = self.merge_by_size(boxes);
        Ok(self.merge_by_iou(merged))
    }

    fn exceeds_size_bound(&self, bbox: &DetectionBox) -> bool {
        bbox.length >= self.thresholds.length_threshold
            || bbox.width >= self.thresholds.length_threshold
            || bbox.area >= self.thresholds.area_threshold
    }

    fn merge_by_size(&mut self, mut pool: Vec<DetectionBox>) -> Vec<DetectionBox> {
        let mut finished = Vec::new();
        while !pool.is_empty() {
            // Stable: equal confidences keep their pool order.
            pool.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));
            let anchor = pool.remove(0);

            let mut nearest: Option<(f64, usize, DetectionBox)> = None;
            for (idx, candidate) in pool.iter().enumerate() {
                let (distance, merged) = merge_pair(&anchor, candidate);
                if self.exceeds_size_bound(&merged) {
                    continue;
                }
                if nearest.as_ref().map_or(true, |(best, _, _)| distance < *best) {
                    nearest = Some((distance, idx, merged));
                }
            }

            match nearest {
                None => finished.push(anchor),
                Some((_, idx, mut merged)) => {
                    let partner = pool.remove(idx);
                    merged.box_id = self.arena.allocate_id();
                    merged.absorb_lineage(&anchor);
                    merged.absorb_lineage(&partner);
                    self.arena.insert(merged.clone());
                    pool.push(merged);
                }
            }
        }
        finished
    }

    fn is_cluster_member(&self, anchor: &DetectionBox, candidate: &DetectionBox) -> bool {
        is_coarse_overlap(anchor, candidate)
            && calculate_iou(anchor, anchor.area, candidate, candidate.area) > self.thresholds.iou_threshold
    }

    fn merge_by_iou(&mut self, mut pool: Vec<DetectionBox>) -> Vec<DetectionBox> {
        let mut rows = Vec::new();
        while !pool.is_empty() {
            let anchor = pool.remove(0);
            let mut cluster = anchor.clone();
            let mut merge_count = 0usize;
            let mut remaining = Vec::with_capacity(pool.len());

            for candidate in pool.drain(..) {
                if !self.is_cluster_member(&anchor, &candidate) {
                    remaining.push(candidate);
                    continue;
                }
                let (_, mut merged) = merge_pair(&cluster, &candidate);
                if merge_count == 0 {
                    merged.absorb_lineage(&cluster);
                } else {
                    // Intermediate cluster boxes carry no id of their own.
                    merged.merge_lineage.extend(cluster.merge_lineage.iter().copied());
                }
                merged.absorb_lineage(&candidate);
                cluster = merged;
                merge_count += 1;
            }
            pool = remaining;

            cluster.box_id = if merge_count == 0 {
                anchor.box_id
            } else {
                self.arena.allocate_id()
            };
            rows.extend(self.expand_labels(&cluster));
        }
        rows
    }

    /// One row per label seen among the cluster's sources, carrying that
    /// label's best confidence. Sources missing from the index are skipped.
    fn expand_labels(&self, cluster: &DetectionBox) -> Vec<DetectionBox> {
        let sources: Vec<u64> = if cluster.merge_lineage.is_empty() {
            vec![cluster.box_id]
        } else {
            cluster.merge_lineage.iter().copied().collect()
        };

        let mut best_by_label: BTreeMap<u64, f64> = BTreeMap::new();
        for source_id in sources {
            let source = if source_id == cluster.box_id {
                Some(cluster)
            } else {
                self.arena.get(source_id)
            };
            let Some(source) = source else {
                continue;
            };
            let best = best_by_label.entry(source.label_id).or_insert(-1.0);
            *best = best.max(source.confidence);
        }

        best_by_label
            .into_iter()
            .map(|(label_id, confidence)| {
                let mut row = cluster.clone();
                row.label_id = label_id;
                row.confidence = confidence;
                row
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(box_id: u64, label_id: u64, confidence: f64, cx: f64, cy: f64, size: f64) -> DetectionBox {
        DetectionBox::new(1, label_id, confidence, cx, cy, size, size, box_id)
    }

    fn thresholds(area: f64, length: f64, iou: f64) -> MergeThresholds {
        MergeThresholds {
            area_threshold: area,
            length_threshold: length,
            iou_threshold: iou,
        }
    }

    #[test]
    fn test_two_close_boxes_merge_into_one() {
        let boxes = vec![
            bbox(1, 0, 0.9, 0.50, 0.5, 0.1),
            bbox(2, 0, 0.6, 0.51, 0.5, 0.1),
        ];
        let mut merger = BoxMerger::new(boxes, thresholds(0.05, 0.25, 0.9)).unwrap();
        let rows = merger.run().unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].confidence, 0.9);
        assert_eq!(rows[0].box_id, 3);
        assert!(rows[0].merge_lineage.contains(&1));
        assert!(rows[0].merge_lineage.contains(&2));
        assert!((rows[0].length - 0.11).abs() < 1e-12);
    }

    #[test]
    fn test_merged_box_expands_per_label() {
        let boxes = vec![
            bbox(1, 2, 0.9, 0.50, 0.5, 0.1),
            bbox(2, 0, 0.6, 0.51, 0.5, 0.1),
        ];
        let mut merger = BoxMerger::new(boxes, MergeThresholds::default()).unwrap();
        let rows = merger.run().unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].label_id, rows[0].confidence), (0, 0.6));
        assert_eq!((rows[1].label_id, rows[1].confidence), (2, 0.9));
        assert_eq!(rows[0].box_id, rows[1].box_id);
    }

    #[test]
    fn test_size_bound_blocks_merge() {
        let boxes = vec![
            bbox(1, 0, 0.9, 0.1, 0.5, 0.1),
            bbox(2, 0, 0.6, 0.4, 0.5, 0.1),
        ];
        let mut merger = BoxMerger::new(boxes, MergeThresholds::default()).unwrap();
        let rows = merger.run().unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].box_id, 1);
        assert_eq!(rows[1].box_id, 2);
        assert!(rows.iter().all(|r| r.merge_lineage.is_empty()));
    }

    #[test]
    fn test_nearest_candidate_wins() {
        let boxes = vec![
            bbox(1, 0, 0.9, 0.50, 0.5, 0.05),
            bbox(2, 1, 0.8, 0.56, 0.5, 0.05),
            bbox(3, 2, 0.7, 0.52, 0.5, 0.05),
        ];
        let mut merger = BoxMerger::new(boxes, thresholds(0.0035, 0.25, 0.99)).unwrap();
        let rows = merger.run().unwrap();

        // 1 + 3 -> 4 (area 0.07 * 0.05); 4 + 2 would reach 0.11 * 0.05 >= 0.0035
        let merged: Vec<_> = rows.iter().filter(|r| r.box_id == 4).collect();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].merge_lineage.iter().copied().collect::<Vec<_>>(), vec![1, 3]);
        assert!(rows.iter().any(|r| r.box_id == 2));
    }

    #[test]
    fn test_overlap_cluster_merges_large_boxes() {
        let boxes = vec![
            bbox(1, 0, 0.9, 0.5, 0.5, 0.4),
            bbox(2, 1, 0.7, 0.5, 0.5, 0.41),
        ];
        let mut merger = BoxMerger::new(boxes, MergeThresholds::default()).unwrap();
        let rows = merger.run().unwrap();

        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.box_id == 3));
        assert_eq!(rows[0].merge_lineage.iter().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert!((rows[0].length - 0.41).abs() < 1e-12);
    }

    #[test]
    fn test_unmerged_box_keeps_stored_area() {
        let boxes = vec![bbox(5, 0, 0.9, 0.5, 0.5, 0.1).with_area(0.0123)];
        let mut merger = BoxMerger::new(boxes, MergeThresholds::default()).unwrap();
        let rows = merger.run().unwrap();
        assert_eq!(rows[0].area, 0.0123);
        assert_eq!(rows[0].box_id, 5);
    }

    #[test]
    fn test_run_twice_is_rejected() {
        let mut merger = BoxMerger::new(vec![bbox(1, 0, 0.9, 0.5, 0.5, 0.1)], MergeThresholds::default()).unwrap();
        merger.run().unwrap();
        assert!(matches!(merger.run(), Err(DefectEvalError::RanTwice(_))));
    }

    #[test]
    fn test_mixed_images_rejected() {
        let mut other = bbox(2, 0, 0.5, 0.5, 0.5, 0.1);
        other.image_id = 2;
        let result = BoxMerger::new(vec![bbox(1, 0, 0.9, 0.5, 0.5, 0.1), other], MergeThresholds::default());
        assert!(result.is_err());
    }
}
