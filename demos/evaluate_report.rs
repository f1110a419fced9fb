//! Example: evaluate every pipeline stage and print the ratio report.
//!
//! With a path argument the run is read from a JSON configuration (see
//! `defect_eval::config`) and exported to its `export_dir`. Without one a
//! small in-memory dataset is used.
//!
//! ```text
//! RUST_LOG=defect_eval=info cargo run --example evaluate_report -- config.json
//! ```

use defect_eval::{
    run_from_config, DetectionBox, GroundTruthBox, LabelMap, MetricRow, PostProcessConfig, PostProcessor,
};
use tracing_subscriber::EnvFilter;

const CM: u64 = 0;
const FM: u64 = 1;
const PASS: u64 = 3;

fn print_report(rows: &[MetricRow]) {
    println!(
        "   {:<8} | {:<16} | {:>3} | {:>8} | {:>8} | {:>8} | {:>8}",
        "stage", "defect type", "gt", "match", "miss", "wrong", "overkill"
    );
    println!("   ---------|------------------|-----|----------|----------|----------|---------");
    for row in rows {
        let rate = |r: &Option<String>| r.clone().unwrap_or_else(|| "-".to_string());
        println!(
            "   {:<8} | {:<16} | {:>3} | {:>8} | {:>8} | {:>8} | {:>8}",
            row.stage.to_string(),
            row.defect_type,
            row.gt_count,
            rate(&row.match_rate),
            rate(&row.miss_rate),
            rate(&row.wrong_rate),
            rate(&row.overkill_rate),
        );
    }
}

fn in_memory_processor() -> Result<PostProcessor, Box<dyn std::error::Error>> {
    let labels = LabelMap::from_pairs([(CM, "DZ_CM"), (FM, "DZ_FM"), (PASS, "DZ_PASS")])?;
    let ground_truth = vec![
        GroundTruthBox::new(1, CM, 0.30, 0.30, 0.10, 0.10, 1),
        GroundTruthBox::new(2, FM, 0.60, 0.60, 0.08, 0.12, 1),
        GroundTruthBox::new(3, PASS, 0.50, 0.50, 0.20, 0.20, 1),
    ];
    let detections = vec![
        // two overlapping CM boxes that merge into one
        DetectionBox::new(1, CM, 0.92, 0.30, 0.30, 0.10, 0.10, 1),
        DetectionBox::new(1, CM, 0.55, 0.31, 0.30, 0.10, 0.10, 2),
        // FM hit with a weaker CM candidate at the same spot
        DetectionBox::new(2, FM, 0.71, 0.60, 0.60, 0.08, 0.12, 1),
        DetectionBox::new(2, CM, 0.33, 0.60, 0.60, 0.08, 0.12, 2),
        // confident pass verdict suppressing a faint defect
        DetectionBox::new(3, PASS, 0.97, 0.50, 0.50, 0.20, 0.20, 1),
        DetectionBox::new(3, FM, 0.12, 0.50, 0.50, 0.20, 0.20, 2),
        // unannotated image
        DetectionBox::new(4, FM, 0.20, 0.20, 0.80, 0.05, 0.05, 1),
    ];
    Ok(PostProcessor::new(labels, ground_truth, detections).with_pass_label("DZ_PASS", 0.75)?)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
        .init();

    println!("=== Defect Evaluation Report ===\n");

    if let Some(path) = std::env::args().nth(1) {
        println!("1. Loading configuration from {path}");
        let config = PostProcessConfig::load_json(&path)?;
        let run = run_from_config(&config)?;
        println!("   {}", run.stats.summary_string());
        println!();

        println!("2. Ratio Report");
        print_report(&run.report);
        println!();
        println!("   Exported to {}", config.export_dir.display());
        return Ok(());
    }

    println!("1. Building in-memory dataset");
    let processor = in_memory_processor()?;
    println!(
        "   {} annotations, {} detections",
        processor.ground_truth().len(),
        processor.detections().len()
    );
    println!();

    println!("2. Deriving thresholds from true positives");
    let run = processor.run_auto()?;
    println!("{}", run.thresholds.to_json_string()?);
    println!();

    println!("3. Stage sizes");
    println!(
        "   OP={} P={} PMB={} PMBDB={} PMBDBDL={}",
        run.outputs.op.len(),
        run.outputs.p.len(),
        run.outputs.pmb.len(),
        run.outputs.pmbdb.len(),
        run.outputs.pmbdbdl.len()
    );
    println!();

    println!("4. Ratio Report");
    print_report(&run.report);
    println!();

    println!("5. Image-level verdicts");
    let images = processor.image_metrics(&run.outputs.pmbdbdl)?;
    let row = images.to_row();
    println!("   images:   {}", row.total_count);
    println!("   accuracy: {} ({})", row.acc_rate, row.acc_count);
    println!("   missed:   {} {:?}", row.miss_rate, images.missed_image_ids);
    println!("   overkill: {} {:?}", row.overkill_rate, images.overkill_image_ids);

    Ok(())
}
