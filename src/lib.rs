//! # defect-eval
//!
//! Post-processing, evaluation and threshold tuning for industrial defect
//! detection.
//!
//! Raw detector output (OP) flows through four stages:
//!
//! - **P**: per-label confidence filter (stage-1 thresholds)
//! - **PMB**: geometric merging of nearby boxes, one row per merged box and label
//! - **PMBDB**: labels of every merged box ranked by confidence
//! - **PMBDBDL**: pass-label override, then per-rank cutoffs (stage-2 thresholds)
//!
//! Every stage can be matched against ground truth and reported as
//! match / miss / wrong / overkill counts and rates.
//!
//! ## Features
//!
//! - CSV loading with strict column validation
//! - Two-phase box merging with explicit merge lineage
//! - Ratio reports with or without a designated pass label
//! - Image-level pass / NG verdicts
//! - Cold-start thresholds derived from true positives
//! - Stage-2 cutoff tuning with a seeded Gaussian-process search
//!
//! ## Quick Start
//!
//! ```rust
//! use defect_eval::{DetectionBox, GroundTruthBox, LabelMap, PostProcessor};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let labels = LabelMap::from_pairs([(0, "DZ_CM"), (3, "DZ_PASS")])?;
//! let ground_truth = vec![GroundTruthBox::new(1, 0, 0.5, 0.5, 0.1, 0.1, 1)];
//! let detections = vec![
//!     DetectionBox::new(1, 0, 0.9, 0.50, 0.5, 0.1, 0.1, 1),
//!     DetectionBox::new(1, 0, 0.6, 0.51, 0.5, 0.1, 0.1, 2),
//! ];
//!
//! let processor = PostProcessor::new(labels, ground_truth, detections)
//!     .with_pass_label("DZ_PASS", 0.75)?;
//! let run = processor.run_auto()?;
//!
//! for row in &run.report {
//!     println!("{} {}: {:?}", row.stage, row.defect_type, row.match_rate);
//! }
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod config;
pub mod error;
pub mod export;
pub mod loader;
pub mod matching;
pub mod merger;
pub mod metrics;
pub mod optimizer;
pub mod pipeline;
pub mod ranking;
pub mod report;
pub mod search;
pub mod stages;
pub mod stats;
pub mod threshold;
pub mod types;

// Re-export commonly used types and functions
pub use analysis::ThresholdAnalyzer;
pub use config::PostProcessConfig;
pub use error::{DefectEvalError, Result};
pub use loader::{load_filtered, load_ground_truth, load_predictions};
pub use matching::GtMatcher;
pub use merger::{BoxMerger, MergeThresholds};
pub use metrics::{BasicMetrics, ImageMetrics, LabelSelection, MetricRow, MetricsCalculator};
pub use optimizer::{OptimizationResult, OptimizerConfig, ThresholdOptimizer};
pub use pipeline::{run_from_config, PipelineRun, PostProcessor, StageOutputs};
pub use ranking::{PassOverride, RankAssigner};
pub use report::ReportBuilder;
pub use stats::PipelineStats;
pub use threshold::{MinConfidence, Threshold, ThresholdConfig, ThresholdSet};
pub use types::{DetectionBox, GroundTruthBox, LabelMap, MatchRow, RankedDetection, Stage};
