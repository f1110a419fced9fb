//! Integration tests for the complete post-processing pipeline.

use defect_eval::export::{export_report, export_stages, export_thresholds, load_thresholds};
use defect_eval::loader::read_filtered;
use defect_eval::{
    run_from_config, DetectionBox, GroundTruthBox, LabelMap, OptimizerConfig, PostProcessConfig, PostProcessor, Stage,
    ThresholdConfig, ThresholdOptimizer, ThresholdSet,
};
use std::fs;
use std::path::{Path, PathBuf};

const CM: u64 = 0;
const FM: u64 = 1;
const PASS: u64 = 3;

const GT_CSV: &str = "center_x,center_y,length,width,image_id,label_id,area,box_id
0.3,0.3,0.1,0.1,1,0,0.01,1
0.6,0.6,0.1,0.1,2,1,0.01,1
0.5,0.5,0.1,0.1,3,3,0.01,1
";

const OP_CSV: &str = "image_id,box_id,label_id,confidence,center_x,center_y,length,width,area
1,1,0,0.9,0.3,0.3,0.1,0.1,0.01
1,2,0,0.6,0.31,0.3,0.1,0.1,0.01
1,3,0,0.8,0.7,0.7,0.0,0.1,0.0
2,1,1,0.7,0.6,0.6,0.1,0.1,0.01
2,2,0,0.3,0.6,0.6,0.1,0.1,0.01
3,1,3,0.95,0.5,0.5,0.1,0.1,0.01
3,2,0,0.1,0.5,0.5,0.1,0.1,0.01
4,1,1,0.2,0.2,0.8,0.1,0.1,0.01
";

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("defect-eval-{name}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_config(dir: &Path) -> PathBuf {
    fs::write(dir.join("gt.csv"), GT_CSV).unwrap();
    fs::write(dir.join("op.csv"), OP_CSV).unwrap();
    let config = serde_json::json!({
        "label_id_name_dict": {"0": "DZ_CM", "1": "DZ_FM", "3": "DZ_PASS"},
        "gt_csv_path": dir.join("gt.csv"),
        "op_csv_path": dir.join("op.csv"),
        "export_dir": dir.join("out"),
        "pass_label_name": "DZ_PASS"
    });
    let path = dir.join("config.json");
    fs::write(&path, config.to_string()).unwrap();
    path
}

fn labels() -> LabelMap {
    LabelMap::from_pairs([(CM, "DZ_CM"), (FM, "DZ_FM"), (PASS, "DZ_PASS")]).unwrap()
}

#[test]
fn test_auto_run_from_config() {
    let dir = scratch_dir("auto");
    let config = PostProcessConfig::load_json(write_config(&dir)).unwrap();
    let processor = PostProcessor::from_config(&config).unwrap();
    let run = processor.run_auto().unwrap();

    assert_eq!(run.stats.loaded_predictions, 8);
    assert_eq!(run.stats.dropped_zero_area, 1);
    assert_eq!(run.outputs.op.len(), 7);
    assert_eq!(run.outputs.p.len(), 4);
    assert_eq!(run.outputs.pmbdbdl.len(), 3);

    // five stages times (all, all but "other", one row per label)
    assert_eq!(run.report.len(), 25);
    let final_all = &run.report[20];
    assert_eq!(final_all.stage, Stage::Pmbdbdl);
    assert_eq!(final_all.defect_type, "all");
    assert_eq!(final_all.pass_label, "pass label: DZ_PASS");
    assert_eq!(final_all.gt_count, 3);
    assert_eq!(final_all.match_rate.as_deref(), Some("100.00%"));
    assert_eq!(final_all.overkill_count, 0);

    let raw_all = &run.report[0];
    assert_eq!(raw_all.stage, Stage::Op);
    assert!(raw_all.overkill_count > 0);
}

#[test]
fn test_exports_round_trip() {
    let dir = scratch_dir("export");
    let config = PostProcessConfig::load_json(write_config(&dir)).unwrap();
    let processor = PostProcessor::from_config(&config).unwrap();
    let run = processor.run_auto().unwrap();

    let (stage1, stage2) = export_thresholds(&config.export_dir, &run.thresholds).unwrap();
    assert!(stage1.ends_with("op2p_parameters.json"));
    assert!(stage2.ends_with("pmbdb2pmbdbdl_parameters.json"));
    assert_eq!(load_thresholds(&config.export_dir).unwrap(), run.thresholds);

    export_stages(&config.export_dir, &run.outputs).unwrap();
    export_report(config.export_dir.join("report.csv"), &run.report).unwrap();
    for name in ["OP.csv", "P.csv", "PMB.csv", "PMBDB.csv", "PMBDBDL.csv", "report.csv"] {
        assert!(config.export_dir.join(name).exists(), "{name} missing");
    }
    let report = fs::read_to_string(config.export_dir.join("report.csv")).unwrap();
    assert_eq!(report.lines().count(), 26);
}

#[test]
fn test_rerun_with_exported_thresholds_is_identical() {
    let dir = scratch_dir("rerun");
    let config = PostProcessConfig::load_json(write_config(&dir)).unwrap();
    let processor = PostProcessor::from_config(&config).unwrap();
    let first = processor.run_auto().unwrap();

    let json = first.thresholds.to_json_string().unwrap();
    let second = processor
        .run_with_thresholds(&ThresholdConfig::from_json_str(&json).unwrap())
        .unwrap();
    assert_eq!(first.outputs, second.outputs);
    assert_eq!(first.report, second.report);
}

#[test]
fn test_close_boxes_merge_into_one() {
    let labels = LabelMap::from_pairs([(CM, "DZ_CM")]).unwrap();
    let detections = vec![
        DetectionBox::new(1, CM, 0.9, 0.50, 0.5, 0.1, 0.1, 1),
        DetectionBox::new(1, CM, 0.6, 0.51, 0.5, 0.1, 0.1, 2),
    ];
    let processor = PostProcessor::new(labels.clone(), vec![], detections);
    let zero = ThresholdSet::uniform(&labels, 0.0);
    let outputs = processor.run_stages(&zero, &zero).unwrap();

    assert_eq!(outputs.pmb.len(), 1);
    assert_eq!(outputs.pmb[0].confidence, 0.9);
    assert!(outputs.pmb[0].merge_lineage.contains(&1));
    assert!(outputs.pmb[0].merge_lineage.contains(&2));
}

#[test]
fn test_pass_override_margin_boundary() {
    let labels = LabelMap::from_pairs([(CM, "DZ_CM"), (PASS, "DZ_PASS")]).unwrap();
    let run = |defect_confidence: f64, margin: f64| {
        let detections = vec![
            DetectionBox::new(1, PASS, 1.0, 0.5, 0.5, 0.1, 0.1, 1),
            DetectionBox::new(1, CM, defect_confidence, 0.5, 0.5, 0.1, 0.1, 2),
        ];
        let processor = PostProcessor::new(labels.clone(), vec![], detections)
            .with_pass_label("DZ_PASS", margin)
            .unwrap();
        let zero = ThresholdSet::uniform(&labels, 0.0);
        processor
            .run_without_gt(&ThresholdConfig::new(zero.clone(), zero))
            .unwrap()
            .len()
    };

    assert_eq!(run(0.25, 0.75), 2, "gap equal to the margin is kept");
    assert_eq!(run(0.249, 0.75), 1, "gap above the margin is dropped");
    assert_eq!(run(0.01, 1.0), 2, "margin of 1 disables the rule");
    assert_eq!(run(0.01, 0.0), 2, "margin of 0 disables the rule");
}

#[test]
fn test_filtered_rows_report() {
    let ground_truth = vec![
        GroundTruthBox::new(1, CM, 0.3, 0.3, 0.1, 0.1, 1),
        GroundTruthBox::new(2, FM, 0.6, 0.6, 0.1, 0.1, 1),
    ];
    let filtered = "center_x,center_y,length,width,image_id,label_id,confidence,label_index
0.3,0.3,0.1,0.1,1,0,0.9,1
0.3,0.3,0.1,0.1,1,1,0.4,2
0.6,0.6,0.1,0.1,2,0,0.8,1
0.9,0.9,0.0,0.1,2,1,0.8,1
";
    let rows = read_filtered(filtered.as_bytes()).unwrap();
    let processor = PostProcessor::new(labels(), ground_truth, vec![])
        .with_pass_label("DZ_PASS", 0.75)
        .unwrap();
    let report = processor.report_from_filtered(rows).unwrap();

    assert_eq!(report.len(), 5);
    assert!(report.iter().all(|row| row.stage == Stage::Filtered));
    let all = &report[0];
    assert_eq!(all.gt_count, 2);
    assert_eq!(all.pred_label_count, 3);
    assert_eq!(all.pred_box_count, 2);
    assert_eq!(all.match_count, 1);
    assert_eq!(all.wrong_count, 1);
}

#[test]
fn test_image_metrics_on_final_rows() {
    let dir = scratch_dir("image");
    let config = PostProcessConfig::load_json(write_config(&dir)).unwrap();
    let processor = PostProcessor::from_config(&config).unwrap();
    let run = processor.run_auto().unwrap();

    let metrics = processor.image_metrics(&run.outputs.pmbdbdl).unwrap();
    assert_eq!(metrics.total_count, 3);
    assert_eq!((metrics.gt_pass_count, metrics.gt_ng_count), (1, 2));
    assert_eq!(metrics.acc_count, 3);
    assert!(metrics.missed_image_ids.is_empty());
}

#[test]
fn test_optimizer_keeps_saturated_thresholds() {
    let dir = scratch_dir("optimize");
    let config = PostProcessConfig::load_json(write_config(&dir)).unwrap();
    let processor = PostProcessor::from_config(&config).unwrap();
    let thresholds = processor.analyze_thresholds().unwrap();

    let mut optimizer =
        ThresholdOptimizer::new(&processor, thresholds.clone(), OptimizerConfig::new(0.14, 20, 20, 5, 42).unwrap())
            .unwrap();
    let result = optimizer.run().unwrap();
    // every derived stage-2 cutoff is above 0.5, so nothing can be doubled
    assert!(result.ratios.is_empty());
    assert_eq!(result.thresholds, thresholds);
    assert_eq!(result.metric_after, result.metric_before);
}

#[test]
fn test_run_from_config_exports_everything() {
    let dir = scratch_dir("from-config");
    let config = PostProcessConfig::load_json(write_config(&dir)).unwrap();
    let run = run_from_config(&config).unwrap();

    assert_eq!(run.outputs.pmbdbdl.len(), 3);
    for name in [
        "op2p_parameters.json",
        "pmbdb2pmbdbdl_parameters.json",
        "PMBDBDL.csv",
        "ratio_report.csv",
        "image_metrics.csv",
    ] {
        assert!(config.export_dir.join(name).exists(), "{name} missing");
    }
    let image_metrics = fs::read_to_string(config.export_dir.join("image_metrics.csv")).unwrap();
    assert_eq!(image_metrics.lines().count(), 2);
}
