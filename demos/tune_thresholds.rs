//! Example: tune the stage-2 cutoffs of derived thresholds.
//!
//! Generates a seeded synthetic dataset where weak detector hits share their
//! confidence range with unannotated noise, derives cold-start thresholds,
//! then searches per-rank scale ratios that trade misses against overkill.

use defect_eval::{DetectionBox, GroundTruthBox, LabelMap, OptimizerConfig, PostProcessor, Stage, ThresholdOptimizer};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

fn synthetic_dataset(images: u64, seed: u64) -> (Vec<GroundTruthBox>, Vec<DetectionBox>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ground_truth = Vec::new();
    let mut detections = Vec::new();

    for image_id in 1..=images {
        let label = rng.random_range(0..2u64);
        let (cx, cy) = (rng.random_range(0.1..0.4), rng.random_range(0.1..0.9));
        ground_truth.push(GroundTruthBox::new(image_id, label, cx, cy, 0.05, 0.05, 1));
        detections.push(DetectionBox::new(image_id, label, rng.random_range(0.15..0.9), cx, cy, 0.05, 0.05, 1));

        // noise on the right half of the image
        for box_id in 2..=rng.random_range(2..5u64) {
            detections.push(DetectionBox::new(
                image_id,
                rng.random_range(0..2u64),
                rng.random_range(0.15..0.5),
                rng.random_range(0.6..0.95),
                rng.random_range(0.1..0.9),
                0.04,
                0.04,
                box_id,
            ));
        }
    }
    (ground_truth, detections)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    println!("=== Stage-2 Threshold Tuning Example ===\n");

    let labels = LabelMap::from_pairs([(0, "DZ_CM"), (1, "DZ_FM")])?;
    let (ground_truth, detections) = synthetic_dataset(150, 7);
    let processor = PostProcessor::new(labels, ground_truth, detections);

    println!("1. Cold-start thresholds");
    let base = processor.analyze_thresholds()?;
    for (name, threshold) in base.stage2.iter() {
        println!("   {name}: {:?}", threshold.min_confidence);
    }
    println!();

    println!("2. Searching scale ratios");
    let config = OptimizerConfig::new(0.14, 30, 20, 8, 42)?;
    let mut optimizer = ThresholdOptimizer::new(&processor, base, config)?;
    for cutoff in optimizer.search_space() {
        println!(
            "   {} rank {}: base {:.4}, ratio 1..={}",
            cutoff.label_name, cutoff.rank, cutoff.base_cutoff, cutoff.max_ratio
        );
    }
    let result = optimizer.run()?.clone();
    println!();

    println!("3. Result after {} evaluations", result.evaluations);
    println!("   metric before: {:.4}", result.metric_before);
    println!("   metric after:  {:.4}", result.metric_after);
    for (cutoff, ratio) in &result.ratios {
        println!(
            "   {} rank {}: x{} -> {:.4}",
            cutoff.label_name,
            cutoff.rank,
            ratio,
            cutoff.base_cutoff * f64::from(*ratio)
        );
    }
    println!();

    println!("4. Final stage with tuned thresholds");
    let run = processor.run_with_thresholds(&result.thresholds)?;
    for row in run.report.iter().filter(|row| row.stage == Stage::Pmbdbdl) {
        println!(
            "   {:<12} match {:>8}  overkill {:>8}",
            row.defect_type,
            row.match_rate.as_deref().unwrap_or("-"),
            row.overkill_rate.as_deref().unwrap_or("-"),
        );
    }

    Ok(())
}
