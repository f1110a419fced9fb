//! End-to-end post-processing runs over one ground-truth / detector-output pair.
//!
//! Every run rebuilds its stages from the raw detections, so box ids and
//! merge lineage never leak from one run into the next.

use crate::analysis::ThresholdAnalyzer;
use crate::config::{PostProcessConfig, DEFAULT_PASS_OVERRIDE_MIN};
use crate::error::{DefectEvalError, Result};
use crate::export::export_run;
use crate::loader::{load_ground_truth, load_predictions};
use crate::matching::GtMatcher;
use crate::merger::MergeThresholds;
use crate::metrics::calculator::MetricRow;
use crate::metrics::image::ImageMetrics;
use crate::optimizer::ThresholdOptimizer;
use crate::ranking::PassOverride;
use crate::report::{ReportBuilder, StageEvaluation};
use crate::stages::{ConfidenceFilterStage, MergeStage, RankStage, RankedFilterStage};
use crate::stats::PipelineStats;
use crate::threshold::{ThresholdConfig, ThresholdSet};
use crate::types::{DetectionBox, GroundTruthBox, LabelMap, Prediction, RankedDetection, Stage};
use std::collections::{BTreeSet, HashSet};
use tracing::info;

/// Rows of every stage of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutputs {
    pub op: Vec<DetectionBox>,
    pub p: Vec<DetectionBox>,
    pub pmb: Vec<DetectionBox>,
    pub pmbdb: Vec<RankedDetection>,
    pub pmbdbdl: Vec<RankedDetection>,
}

impl StageOutputs {
    /// Row count of a stage; `None` for a stage this pipeline does not produce.
    pub fn row_count(&self, stage: Stage) -> Option<usize> {
        match stage {
            Stage::Op => Some(self.op.len()),
            Stage::P => Some(self.p.len()),
            Stage::Pmb => Some(self.pmb.len()),
            Stage::Pmbdb => Some(self.pmbdb.len()),
            Stage::Pmbdbdl => Some(self.pmbdbdl.len()),
            Stage::Filtered => None,
        }
    }
}

/// Thresholds, stage rows, report and counters of one evaluated run.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub thresholds: ThresholdConfig,
    pub outputs: StageOutputs,
    pub report: Vec<MetricRow>,
    pub stats: PipelineStats,
}

#[derive(Debug, Clone)]
pub struct PostProcessor {
    labels: LabelMap,
    merge: MergeThresholds,
    pass_label: Option<(u64, String)>,
    pass_override_min: f64,
    ground_truth: Vec<GroundTruthBox>,
    detections: Vec<DetectionBox>,
    stats: PipelineStats,
}

impl PostProcessor {
    /// A processor with default merge thresholds and no pass label.
    pub fn new(labels: LabelMap, ground_truth: Vec<GroundTruthBox>, detections: Vec<DetectionBox>) -> Self {
        let mut stats = PipelineStats::new();
        stats.loaded_predictions = detections.len();
        stats.ground_truth_boxes = ground_truth.len();
        stats.images = ground_truth
            .iter()
            .map(|g| g.image_id)
            .chain(detections.iter().map(|d| d.image_id))
            .collect::<BTreeSet<_>>()
            .len();
        Self {
            labels,
            merge: MergeThresholds::default(),
            pass_label: None,
            pass_override_min: DEFAULT_PASS_OVERRIDE_MIN,
            ground_truth,
            detections,
            stats,
        }
    }

    pub fn with_merge_thresholds(mut self, merge: MergeThresholds) -> Result<Self> {
        merge.validate()?;
        self.merge = merge;
        Ok(self)
    }

    /// Designate the pass label and the margin of its override.
    pub fn with_pass_label(mut self, name: &str, pass_override_min: f64) -> Result<Self> {
        let id = self
            .labels
            .id(name)
            .map_err(|_| DefectEvalError::UnknownPassLabel(name.to_string()))?;
        self.pass_label = Some((id, name.to_string()));
        self.pass_override_min = pass_override_min;
        Ok(self)
    }

    /// Load both tables named by `config` and apply its settings.
    pub fn from_config(config: &PostProcessConfig) -> Result<Self> {
        config.validate()?;
        let mut stats = PipelineStats::new();
        let ground_truth = load_ground_truth(&config.gt_csv_path, &mut stats)?;
        let detections = load_predictions(&config.op_csv_path, &mut stats)?;

        let mut processor = Self::new(config.label_id_name_dict.clone(), ground_truth, detections)
            .with_merge_thresholds(config.merge)?;
        if let Some(pass) = &config.pass_label_name {
            processor = processor.with_pass_label(pass, config.pass_override_min)?;
        }
        processor.stats.loaded_predictions = stats.loaded_predictions;
        processor.stats.dropped_zero_area = stats.dropped_zero_area;
        Ok(processor)
    }

    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }

    pub fn pass_label_name(&self) -> Option<&str> {
        self.pass_label.as_ref().map(|(_, name)| name.as_str())
    }

    pub fn pass_label_id(&self) -> Option<u64> {
        self.pass_label.as_ref().map(|(id, _)| *id)
    }

    pub fn ground_truth(&self) -> &[GroundTruthBox] {
        &self.ground_truth
    }

    pub fn detections(&self) -> &[DetectionBox] {
        &self.detections
    }

    fn pass_override(&self) -> PassOverride {
        PassOverride::new(self.pass_label_id(), self.pass_override_min)
    }

    /// OP -> P -> PMB -> PMBDB -> PMBDBDL with fresh stage objects.
    pub fn run_stages(&self, stage1: &ThresholdSet, stage2: &ThresholdSet) -> Result<StageOutputs> {
        let mut filter = ConfidenceFilterStage::new(self.detections.clone(), stage1.clone());
        filter.run()?;
        let p = filter.into_result()?;

        let mut merge = MergeStage::new(p.clone(), self.merge);
        merge.run()?;
        let pmb = merge.into_result()?;

        let mut rank = RankStage::new(pmb.clone());
        rank.run()?;
        let pmbdb = rank.into_result()?;

        let mut ranked_filter = RankedFilterStage::new(pmbdb.clone(), stage2.clone(), self.pass_override());
        ranked_filter.run()?;
        let pmbdbdl = ranked_filter.into_result()?;

        Ok(StageOutputs {
            op: self.detections.clone(),
            p,
            pmb,
            pmbdb,
            pmbdbdl,
        })
    }

    fn run_stats(&self, outputs: &StageOutputs) -> PipelineStats {
        let mut stats = self.stats.clone();
        for stage in [Stage::Op, Stage::P, Stage::Pmb, Stage::Pmbdb, Stage::Pmbdbdl] {
            if let Some(rows) = outputs.row_count(stage) {
                stats.record_stage(stage, rows);
            }
        }
        stats
    }

    fn build_report(&self, evaluations: Vec<StageEvaluation>) -> Result<Vec<MetricRow>> {
        let mut builder = ReportBuilder::new(&self.labels, self.pass_label_name(), evaluations)?;
        builder.run()?;
        builder.into_rows()
    }

    /// Run every stage and report each one against the ground truth.
    ///
    /// Pass-label predictions are dropped before matching.
    pub fn run_with_thresholds(&self, thresholds: &ThresholdConfig) -> Result<PipelineRun> {
        let outputs = self.run_stages(&thresholds.stage1, &thresholds.stage2)?;
        let matcher = GtMatcher::new(&self.ground_truth);
        let drop = self.pass_label_id();
        let evaluations = vec![
            StageEvaluation::evaluate(Stage::Op, &outputs.op, &matcher, drop),
            StageEvaluation::evaluate(Stage::P, &outputs.p, &matcher, drop),
            StageEvaluation::evaluate(Stage::Pmb, &outputs.pmb, &matcher, drop),
            StageEvaluation::evaluate(Stage::Pmbdb, &outputs.pmbdb, &matcher, drop),
            StageEvaluation::evaluate(Stage::Pmbdbdl, &outputs.pmbdbdl, &matcher, drop),
        ];
        let report = self.build_report(evaluations)?;
        let stats = self.run_stats(&outputs);
        stats.log_summary();
        Ok(PipelineRun {
            thresholds: thresholds.clone(),
            outputs,
            report,
            stats,
        })
    }

    /// Derive thresholds from a zero-threshold run.
    pub fn analyze_thresholds(&self) -> Result<ThresholdConfig> {
        let zero = ThresholdSet::uniform(&self.labels, 0.0);
        let outputs = self.run_stages(&zero, &zero)?;
        let matcher = GtMatcher::new(&self.ground_truth);
        let op_matches = matcher.run(&outputs.op, None);
        let ranked_matches = matcher.run(&outputs.pmbdb, None);

        let mut analyzer = ThresholdAnalyzer::new(&self.labels, &op_matches, &ranked_matches);
        analyzer.run()?;
        analyzer.into_result()
    }

    /// Derive thresholds, then run and report with them.
    pub fn run_auto(&self) -> Result<PipelineRun> {
        let thresholds = self.analyze_thresholds()?;
        info!("running with derived thresholds");
        self.run_with_thresholds(&thresholds)
    }

    /// Prediction-only run; returns the PMBDBDL rows.
    pub fn run_without_gt(&self, thresholds: &ThresholdConfig) -> Result<Vec<RankedDetection>> {
        let outputs = self.run_stages(&thresholds.stage1, &thresholds.stage2)?;
        self.run_stats(&outputs).log_summary();
        Ok(outputs.pmbdbdl)
    }

    /// Report externally filtered final rows as a single stage.
    ///
    /// Areas are recomputed from the extent, rows without area are dropped
    /// and box ids are renumbered per image by distinct location.
    pub fn report_from_filtered(&self, rows: Vec<RankedDetection>) -> Result<Vec<MetricRow>> {
        let rows = renumber_filtered(rows);
        let matcher = GtMatcher::new(&self.ground_truth);
        let evaluation = StageEvaluation::evaluate(Stage::Filtered, &rows, &matcher, self.pass_label_id());
        self.build_report(vec![evaluation])
    }

    /// Image-level verdicts of `predictions`. Needs a pass label.
    pub fn image_metrics<P: Prediction>(&self, predictions: &[P]) -> Result<ImageMetrics> {
        let pass_label_id = self.pass_label_id().ok_or_else(|| {
            DefectEvalError::InvalidConfig("image metrics need a pass label".to_string())
        })?;
        Ok(ImageMetrics::compute(&self.ground_truth, predictions, pass_label_id))
    }
}

/// Evaluate the run `config` describes and export it to `export_dir`.
///
/// Thresholds are derived from the data, tuned when `auto_optimize` is set,
/// then used for the reported run. Image metrics are exported when a pass
/// label is configured.
pub fn run_from_config(config: &PostProcessConfig) -> Result<PipelineRun> {
    let processor = PostProcessor::from_config(config)?;
    let mut thresholds = processor.analyze_thresholds()?;
    if config.auto_optimize {
        let mut optimizer = ThresholdOptimizer::new(&processor, thresholds, config.optimizer)?;
        optimizer.run()?;
        thresholds = optimizer.into_result()?.thresholds;
    }

    let run = processor.run_with_thresholds(&thresholds)?;
    let image_metrics = match processor.pass_label_id() {
        Some(_) => Some(processor.image_metrics(&run.outputs.pmbdbdl)?),
        None => None,
    };
    export_run(&config.export_dir, &run, image_metrics.as_ref())?;
    Ok(run)
}

fn renumber_filtered(rows: Vec<RankedDetection>) -> Vec<RankedDetection> {
    let before = rows.len();
    let mut rows: Vec<RankedDetection> = rows
        .into_iter()
        .map(|mut row| {
            row.detection.area = row.detection.length * row.detection.width;
            row
        })
        .filter(|row| row.detection.area > 0.0)
        .collect();
    if rows.len() < before {
        info!(dropped = before - rows.len(), "dropped filtered rows without area");
    }

    rows.sort_by(|a, b| {
        let (a, b) = (&a.detection, &b.detection);
        a.image_id
            .cmp(&b.image_id)
            .then(a.center_x.total_cmp(&b.center_x))
            .then(a.center_y.total_cmp(&b.center_y))
            .then(a.width.total_cmp(&b.width))
            .then(a.length.total_cmp(&b.length))
    });

    let mut image = None;
    let mut seen = HashSet::new();
    for row in &mut rows {
        let d = &mut row.detection;
        if image != Some(d.image_id) {
            image = Some(d.image_id);
            seen.clear();
        }
        seen.insert((
            d.center_x.to_bits(),
            d.center_y.to_bits(),
            d.width.to_bits(),
            d.length.to_bits(),
        ));
        d.box_id = seen.len() as u64;
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    const CM: u64 = 0;
    const PASS: u64 = 3;

    fn labels() -> LabelMap {
        LabelMap::from_pairs([(CM, "DZ_CM"), (PASS, "DZ_PASS")]).unwrap()
    }

    fn processor() -> PostProcessor {
        let gt = vec![
            GroundTruthBox::new(1, CM, 0.3, 0.3, 0.1, 0.1, 1),
            GroundTruthBox::new(2, PASS, 0.5, 0.5, 0.1, 0.1, 1),
        ];
        let op = vec![
            DetectionBox::new(1, CM, 0.9, 0.3, 0.3, 0.1, 0.1, 1),
            DetectionBox::new(1, CM, 0.6, 0.31, 0.3, 0.1, 0.1, 2),
            DetectionBox::new(2, PASS, 0.95, 0.5, 0.5, 0.1, 0.1, 1),
            DetectionBox::new(2, CM, 0.1, 0.5, 0.5, 0.1, 0.1, 2),
        ];
        PostProcessor::new(labels(), gt, op).with_pass_label("DZ_PASS", 0.75).unwrap()
    }

    #[test]
    fn test_unknown_pass_label() {
        let result = PostProcessor::new(labels(), vec![], vec![]).with_pass_label("OK", 0.75);
        assert!(matches!(result, Err(DefectEvalError::UnknownPassLabel(_))));
    }

    #[test]
    fn test_stages_are_rebuilt_per_run() {
        let processor = processor();
        let zero = ThresholdSet::uniform(processor.labels(), 0.0);
        let first = processor.run_stages(&zero, &zero).unwrap();
        let second = processor.run_stages(&zero, &zero).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.op.len(), 4);
        assert!(first.pmb.len() < first.p.len());
    }

    #[test]
    fn test_pass_override_in_final_stage() {
        let processor = processor();
        let zero = ThresholdSet::uniform(processor.labels(), 0.0);
        let outputs = processor.run_stages(&zero, &zero).unwrap();
        let image2: Vec<_> = outputs
            .pmbdbdl
            .iter()
            .filter(|r| r.detection.image_id == 2)
            .map(|r| r.detection.label_id)
            .collect();
        assert_eq!(image2, vec![PASS]);
    }

    #[test]
    fn test_run_auto_reports_every_stage() {
        let processor = processor();
        let run = processor.run_auto().unwrap();
        // five stages times (all, all but other, one per label)
        assert_eq!(run.report.len(), 5 * 4);
        assert_eq!(run.report[0].stage, Stage::Op);
        assert_eq!(run.report[16].stage, Stage::Pmbdbdl);
        assert_eq!(run.stats.stage_rows.get(&Stage::Op), Some(&4));
        let cm = run.thresholds.stage1.get("DZ_CM").unwrap();
        assert!(cm.is_row_ok(CM, 0.9, None));
    }

    #[test]
    fn test_renumber_filtered_by_location() {
        let row = |row_id, x: f64, label_id, label_index| RankedDetection {
            row_id,
            label_index,
            detection: DetectionBox::new(1, label_id, 0.9, x, 0.5, 0.1, 0.1, 0),
        };
        let mut empty = row(3, 0.9, CM, 1);
        empty.detection.length = 0.0;
        let rows = renumber_filtered(vec![row(0, 0.7, CM, 1), row(1, 0.2, CM, 1), row(2, 0.2, PASS, 2), empty]);

        let ids: Vec<_> = rows.iter().map(|r| (r.detection.center_x, r.detection.box_id)).collect();
        assert_eq!(ids, vec![(0.2, 1), (0.2, 1), (0.7, 2)]);
    }

    #[test]
    fn test_image_metrics_need_pass_label() {
        let processor = PostProcessor::new(labels(), vec![], vec![]);
        let result = processor.image_metrics::<DetectionBox>(&[]);
        assert!(matches!(result, Err(DefectEvalError::InvalidConfig(_))));
    }
}
