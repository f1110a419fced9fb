//! Error handling and validation tests.

use defect_eval::error::DefectEvalError;
use defect_eval::loader::{load_ground_truth, read_predictions};
use defect_eval::metrics::calculator::LabelSelection;
use defect_eval::report::{ReportBuilder, StageEvaluation};
use defect_eval::stages::{ConfidenceFilterStage, RankStage, RankedFilterStage};
use defect_eval::stats::PipelineStats;
use defect_eval::{
    BoxMerger, DetectionBox, GtMatcher, LabelMap, MergeThresholds, MetricsCalculator, OptimizerConfig,
    PassOverride, PostProcessConfig, PostProcessor, Stage, ThresholdAnalyzer, ThresholdConfig, ThresholdSet,
};

fn labels() -> LabelMap {
    LabelMap::from_pairs([(0, "DZ_CM"), (3, "DZ_PASS")]).unwrap()
}

fn detection(box_id: u64, label_id: u64) -> DetectionBox {
    DetectionBox::new(1, label_id, 0.9, 0.5, 0.5, 0.1, 0.1, box_id)
}

// ============================================================================
// CONFIGURATION ERRORS
// ============================================================================

#[test]
fn test_invalid_config_json() {
    let result = PostProcessConfig::from_json_str("{ invalid json");
    assert!(matches!(result, Err(DefectEvalError::JsonError(_))));
}

#[test]
fn test_duplicate_label_names() {
    let result = LabelMap::from_pairs([(0, "DZ_CM"), (1, "DZ_CM")]);
    assert!(matches!(result, Err(DefectEvalError::InvalidConfig(_))));
}

#[test]
fn test_optimizer_hyperparameters() {
    for (weight, samples, ratio) in [(0.0, 50, 20), (1.0, 50, 20), (-0.5, 50, 20), (0.14, 19, 20), (0.14, 50, 1)] {
        let result = OptimizerConfig::new(weight, samples, ratio, 10, 42);
        assert!(
            matches!(result, Err(DefectEvalError::InvalidHyperParameter(_))),
            "accepted weight={weight} samples={samples} ratio={ratio}"
        );
    }
    assert!(OptimizerConfig::new(0.5, 20, 2, 1, 0).is_ok());
}

#[test]
fn test_negative_merge_threshold() {
    let merge = MergeThresholds {
        area_threshold: -0.1,
        ..MergeThresholds::default()
    };
    let result = PostProcessor::new(labels(), vec![], vec![]).with_merge_thresholds(merge);
    assert!(matches!(result, Err(DefectEvalError::InvalidHyperParameter(_))));
}

#[test]
fn test_label_selection_needs_exactly_one_list() {
    assert!(matches!(
        LabelSelection::from_lists(Some(vec!["DZ_CM".into()]), Some(vec!["DZ_PASS".into()])),
        Err(DefectEvalError::InvalidLabelSelection(_))
    ));
    assert!(matches!(
        LabelSelection::from_lists(None, None),
        Err(DefectEvalError::InvalidLabelSelection(_))
    ));
}

#[test]
fn test_malformed_threshold_document() {
    let json = r#"{"stage-1": {"DZ_CM": {"label_id": 0, "min_confidence": "high"}}, "stage-2": {}}"#;
    assert!(matches!(ThresholdConfig::from_json_str(json), Err(DefectEvalError::JsonError(_))));
}

#[test]
fn test_missing_file() {
    let result = load_ground_truth("/nonexistent/gt.csv", &mut PipelineStats::new());
    assert!(matches!(result, Err(DefectEvalError::IoError(_))));
}

#[test]
fn test_missing_prediction_columns() {
    let csv = "center_x,center_y,length,width,image_id,label_id,area,box_id\n0.5,0.5,0.1,0.1,1,0,0.01,1\n";
    match read_predictions(csv.as_bytes(), &mut PipelineStats::new()) {
        Err(DefectEvalError::MissingColumns { table, columns }) => {
            assert_eq!(table, "predictions");
            assert_eq!(columns, vec!["confidence".to_string()]);
        }
        other => panic!("expected missing columns, got {other:?}"),
    }
}

// ============================================================================
// SEQUENCING ERRORS
// ============================================================================

#[test]
fn test_stage_result_before_run() {
    let stage = ConfidenceFilterStage::new(vec![detection(1, 0)], ThresholdSet::uniform(&labels(), 0.0));
    assert!(matches!(stage.result(), Err(DefectEvalError::RanTooEarly(_))));
}

#[test]
fn test_stage_runs_once() {
    let mut stage = RankStage::new(vec![detection(1, 0)]);
    stage.run().unwrap();
    assert!(matches!(stage.run(), Err(DefectEvalError::RanTwice(_))));
    assert_eq!(stage.result().unwrap().len(), 1);
}

#[test]
fn test_merger_runs_once() {
    let mut merger = BoxMerger::new(vec![detection(1, 0)], MergeThresholds::default()).unwrap();
    merger.run().unwrap();
    assert!(matches!(merger.run(), Err(DefectEvalError::RanTwice(_))));
}

#[test]
fn test_analyzer_runs_once() {
    let labels = labels();
    let mut analyzer = ThresholdAnalyzer::new(&labels, &[], &[]);
    analyzer.run().unwrap();
    assert!(matches!(analyzer.run(), Err(DefectEvalError::RanTwice(_))));
}

#[test]
fn test_report_builder_runs_once() {
    let labels = labels();
    let gts = vec![];
    let matcher = GtMatcher::new(&gts);
    let evaluation = StageEvaluation::evaluate(Stage::Op, &[detection(1, 0)], &matcher, None);
    let mut builder = ReportBuilder::new(&labels, None, vec![evaluation]).unwrap();
    assert!(matches!(builder.result(), Err(DefectEvalError::RanTooEarly(_))));
    builder.run().unwrap();
    assert!(matches!(builder.run(), Err(DefectEvalError::RanTwice(_))));
}

// ============================================================================
// DATA ERRORS
// ============================================================================

#[test]
fn test_unknown_label_id_in_rows() {
    let processor = PostProcessor::new(labels(), vec![], vec![detection(1, 7)]);
    let zero = ThresholdSet::uniform(processor.labels(), 0.0);
    let result = processor.run_stages(&zero, &zero);
    assert!(matches!(result, Err(DefectEvalError::UnknownLabelId(7))));
}

#[test]
fn test_ranked_filter_unknown_label() {
    let mut ranked = RankStage::new(vec![detection(1, 5)]);
    ranked.run().unwrap();
    let mut stage = RankedFilterStage::new(
        ranked.into_result().unwrap(),
        ThresholdSet::uniform(&labels(), 0.0),
        PassOverride::disabled(),
    );
    assert!(matches!(stage.run(), Err(DefectEvalError::UnknownLabelId(5))));
}

#[test]
fn test_unknown_label_in_selection() {
    let labels = labels();
    let calculator = MetricsCalculator::new(&labels, &[], &[]);
    let result = calculator.run(Stage::Op, &LabelSelection::only("DZ_XX"));
    assert!(matches!(result, Err(DefectEvalError::UnknownLabelName(_))));
}

#[test]
fn test_unknown_pass_label_in_report() {
    let labels = labels();
    let gts = vec![];
    let matcher = GtMatcher::new(&gts);
    let evaluation = StageEvaluation::evaluate(Stage::Op, &[detection(1, 0)], &matcher, None);
    let mut builder = ReportBuilder::new(&labels, Some("OK"), vec![evaluation]).unwrap();
    assert!(matches!(builder.run(), Err(DefectEvalError::UnknownPassLabel(_))));
}

#[test]
fn test_error_messages() {
    assert_eq!(DefectEvalError::RanTwice("box merger").to_string(), "box merger may only run once");
    assert_eq!(DefectEvalError::UnknownLabelId(9).to_string(), "Unknown label id: 9");
}
