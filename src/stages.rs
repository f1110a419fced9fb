//! Run-once pipeline stages: OP -> P -> PMB -> PMBDB -> PMBDBDL.

use crate::error::{DefectEvalError, Result};
use crate::merger::{BoxMerger, MergeThresholds};
use crate::ranking::{PassOverride, RankAssigner};
use crate::threshold::{Threshold, ThresholdSet};
use crate::types::{group_by, DetectionBox, Prediction, RankedDetection, RunState};
use std::collections::HashMap;
use tracing::info;

/// Result slot shared by the stages.
#[derive(Debug)]
struct StageOutput<T> {
    name: &'static str,
    state: RunState,
    rows: Option<Vec<T>>,
}

impl<T> StageOutput<T> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            state: RunState::NotRun,
            rows: None,
        }
    }

    fn begin(&mut self) -> Result<()> {
        self.state.begin(self.name)
    }

    fn store(&mut self, rows: Vec<T>) -> &[T] {
        info!(stage = self.name, rows = rows.len(), "stage finished");
        self.rows.insert(rows).as_slice()
    }

    fn get(&self) -> Result<&[T]> {
        self.rows.as_deref().ok_or(DefectEvalError::RanTooEarly(self.name))
    }

    fn take(self) -> Result<Vec<T>> {
        self.rows.ok_or(DefectEvalError::RanTooEarly(self.name))
    }
}

fn accepts<P: Prediction>(index: &HashMap<u64, &Threshold>, row: &P) -> Result<bool> {
    index
        .get(&row.label_id())
        .map(|threshold| threshold.accepts(row))
        .ok_or(DefectEvalError::UnknownLabelId(row.label_id()))
}

/// OP -> P: keeps rows above their label's stage-1 cutoff.
#[derive(Debug)]
pub struct ConfidenceFilterStage {
    input: Vec<DetectionBox>,
    thresholds: ThresholdSet,
    output: StageOutput<DetectionBox>,
}

impl ConfidenceFilterStage {
    pub fn new(input: Vec<DetectionBox>, thresholds: ThresholdSet) -> Self {
        Self {
            input,
            thresholds,
            output: StageOutput::new("OP -> P"),
        }
    }

    /// # Errors
    ///
    /// Fails on a second run, or when a row's label has no threshold.
    pub fn run(&mut self) -> Result<&[DetectionBox]> {
        self.output.begin()?;
        let index = self.thresholds.by_label_id()?;
        let mut kept = Vec::new();
        for row in std::mem::take(&mut self.input) {
            if accepts(&index, &row)? {
                kept.push(row);
            }
        }
        Ok(self.output.store(kept))
    }

    pub fn result(&self) -> Result<&[DetectionBox]> {
        self.output.get()
    }

    pub fn into_result(self) -> Result<Vec<DetectionBox>> {
        self.output.take()
    }
}

/// P -> PMB: merges the boxes of every image.
#[derive(Debug)]
pub struct MergeStage {
    input: Vec<DetectionBox>,
    thresholds: MergeThresholds,
    output: StageOutput<DetectionBox>,
}

impl MergeStage {
    pub fn new(input: Vec<DetectionBox>, thresholds: MergeThresholds) -> Self {
        Self {
            input,
            thresholds,
            output: StageOutput::new("P -> PMB"),
        }
    }

    pub fn run(&mut self) -> Result<&[DetectionBox]> {
        self.output.begin()?;
        let mut merged = Vec::new();
        for (_, boxes) in group_by(std::mem::take(&mut self.input), |b| b.image_id) {
            merged.extend(BoxMerger::new(boxes, self.thresholds)?.run()?);
        }
        Ok(self.output.store(merged))
    }

    pub fn result(&self) -> Result<&[DetectionBox]> {
        self.output.get()
    }

    pub fn into_result(self) -> Result<Vec<DetectionBox>> {
        self.output.take()
    }
}

/// PMB -> PMBDB: ranks the labels of each merged box.
#[derive(Debug)]
pub struct RankStage {
    input: Vec<DetectionBox>,
    output: StageOutput<RankedDetection>,
}

impl RankStage {
    pub fn new(input: Vec<DetectionBox>) -> Self {
        Self {
            input,
            output: StageOutput::new("PMB -> PMBDB"),
        }
    }

    pub fn run(&mut self) -> Result<&[RankedDetection]> {
        self.output.begin()?;
        let ranked = RankAssigner.assign(std::mem::take(&mut self.input));
        Ok(self.output.store(ranked))
    }

    pub fn result(&self) -> Result<&[RankedDetection]> {
        self.output.get()
    }

    pub fn into_result(self) -> Result<Vec<RankedDetection>> {
        self.output.take()
    }
}

/// PMBDB -> PMBDBDL: pass override, then the stage-2 cutoffs.
///
/// Output rows are ordered by sequence id.
#[derive(Debug)]
pub struct RankedFilterStage {
    input: Vec<RankedDetection>,
    thresholds: ThresholdSet,
    pass_override: PassOverride,
    output: StageOutput<RankedDetection>,
}

impl RankedFilterStage {
    pub fn new(input: Vec<RankedDetection>, thresholds: ThresholdSet, pass_override: PassOverride) -> Self {
        Self {
            input,
            thresholds,
            pass_override,
            output: StageOutput::new("PMBDB -> PMBDBDL"),
        }
    }

    pub fn run(&mut self) -> Result<&[RankedDetection]> {
        self.output.begin()?;
        let index = self.thresholds.by_label_id()?;
        let groups = group_by(std::mem::take(&mut self.input), |r| {
            (r.detection.image_id, r.detection.box_id)
        });

        let mut kept = Vec::new();
        for (_, group) in groups {
            for row in self.pass_override.apply(group) {
                if accepts(&index, &row)? {
                    kept.push(row);
                }
            }
        }
        kept.sort_by_key(|r| r.row_id);
        Ok(self.output.store(kept))
    }

    pub fn result(&self) -> Result<&[RankedDetection]> {
        self.output.get()
    }

    pub fn into_result(self) -> Result<Vec<RankedDetection>> {
        self.output.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threshold::MinConfidence;
    use crate::types::LabelMap;

    fn labels() -> LabelMap {
        LabelMap::from_pairs([(0, "DZ_CM"), (3, "DZ_PASS")]).unwrap()
    }

    fn row(box_id: u64, label_id: u64, confidence: f64) -> DetectionBox {
        DetectionBox::new(1, label_id, confidence, 0.5, 0.5, 0.1, 0.1, box_id)
    }

    #[test]
    fn test_confidence_filter_is_strict() {
        let thresholds = ThresholdSet::uniform(&labels(), 0.5);
        let mut stage = ConfidenceFilterStage::new(vec![row(1, 0, 0.5), row(2, 0, 0.51)], thresholds);
        let kept = stage.run().unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].box_id, 2);
    }

    #[test]
    fn test_unknown_label_is_data_error() {
        let thresholds = ThresholdSet::uniform(&labels(), 0.0);
        let mut stage = ConfidenceFilterStage::new(vec![row(1, 9, 0.5)], thresholds);
        assert!(matches!(stage.run(), Err(DefectEvalError::UnknownLabelId(9))));
    }

    #[test]
    fn test_result_before_run_is_too_early() {
        let stage = RankStage::new(vec![row(1, 0, 0.5)]);
        assert!(matches!(stage.result(), Err(DefectEvalError::RanTooEarly(_))));
        assert!(matches!(stage.into_result(), Err(DefectEvalError::RanTooEarly(_))));
    }

    #[test]
    fn test_second_run_is_rejected() {
        let mut stage = MergeStage::new(vec![row(1, 0, 0.5)], MergeThresholds::default());
        stage.run().unwrap();
        assert!(matches!(stage.run(), Err(DefectEvalError::RanTwice(_))));
        assert_eq!(stage.result().unwrap().len(), 1);
    }

    #[test]
    fn test_ranked_filter_applies_pass_override_then_cutoffs() {
        let ranked = RankAssigner.assign(vec![row(1, 3, 0.95), row(1, 0, 0.1), row(2, 0, 0.4)]);
        let mut thresholds = ThresholdSet::default();
        thresholds.insert(Threshold::new(0, "DZ_CM", MinConfidence::Ranked([(1, 0.3), (2, 0.0)].into())));
        thresholds.insert(Threshold::new(3, "DZ_PASS", MinConfidence::Uniform(0.0)));

        let mut stage = RankedFilterStage::new(ranked, thresholds, PassOverride::new(Some(3), 0.75));
        let kept = stage.run().unwrap();

        let ids: Vec<_> = kept.iter().map(|r| (r.detection.box_id, r.detection.label_id)).collect();
        assert_eq!(ids, vec![(1, 3), (2, 0)]);
        assert!(kept.windows(2).all(|w| w[0].row_id < w[1].row_id));
    }
}
