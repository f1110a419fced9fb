//! Geometry, scoring and ratio metrics.

pub mod calculator;
pub mod fbeta;
pub mod image;
pub mod iou;

pub use calculator::{format_rate, BasicMetrics, LabelSelection, MetricRow, MetricsCalculator, MetricsMode};
pub use fbeta::{calculate_fbeta, calculate_precision, calculate_recall, DefectScore, DEFECT_FBETA};
pub use image::{ImageMetrics, ImageMetricsRow};
pub use iou::calculate_iou;
