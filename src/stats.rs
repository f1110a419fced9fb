/// Row counts collected along one pipeline run.
///
/// Filled in by the loader and the pipeline, and summarised through `tracing`
/// at the end of a run.
use crate::types::Stage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Statistics collected while loading and post-processing detections
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Rows read from the prediction table, before any filtering
    pub loaded_predictions: usize,

    /// Predictions dropped at load time for a non-positive area
    pub dropped_zero_area: usize,

    /// Ground-truth boxes loaded
    pub ground_truth_boxes: usize,

    /// Distinct images over predictions and ground truth
    pub images: usize,

    /// Rows produced by every stage that ran
    pub stage_rows: BTreeMap<Stage, usize>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a prediction dropped because its area is not positive
    pub fn drop_zero_area(&mut self) {
        self.dropped_zero_area += 1;
    }

    pub fn record_stage(&mut self, stage: Stage, rows: usize) {
        self.stage_rows.insert(stage, rows);
    }

    /// Predictions that survived loading
    pub fn kept_predictions(&self) -> usize {
        self.loaded_predictions.saturating_sub(self.dropped_zero_area)
    }

    /// Fraction of the loaded predictions that reached `stage`.
    pub fn retention(&self, stage: Stage) -> Option<f64> {
        let rows = *self.stage_rows.get(&stage)?;
        if self.loaded_predictions == 0 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        Some(rows as f64 / self.loaded_predictions as f64)
    }

    pub fn summary_string(&self) -> String {
        let stages = self
            .stage_rows
            .iter()
            .map(|(stage, rows)| format!("{stage}: {rows}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "PipelineStats {{ loaded: {}, kept: {}, zero_area: {}, gt: {}, images: {}, stages: [{}] }}",
            self.loaded_predictions,
            self.kept_predictions(),
            self.dropped_zero_area,
            self.ground_truth_boxes,
            self.images,
            stages
        )
    }

    /// Emit the summary at info level
    pub fn log_summary(&self) {
        info!("{}", self.summary_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_stats_are_zero() {
        let stats = PipelineStats::new();
        assert_eq!(stats.loaded_predictions, 0);
        assert_eq!(stats.kept_predictions(), 0);
        assert!(stats.stage_rows.is_empty());
    }

    #[test]
    fn test_kept_predictions() {
        let mut stats = PipelineStats::new();
        stats.loaded_predictions = 10;
        stats.drop_zero_area();
        stats.drop_zero_area();
        assert_eq!(stats.kept_predictions(), 8);
    }

    #[test]
    fn test_retention() {
        let mut stats = PipelineStats::new();
        stats.loaded_predictions = 8;
        stats.record_stage(Stage::P, 6);
        assert_eq!(stats.retention(Stage::P), Some(0.75));
        assert_eq!(stats.retention(Stage::Pmb), None);
    }

    #[test]
    fn test_summary_string() {
        let mut stats = PipelineStats::new();
        stats.loaded_predictions = 50;
        stats.images = 10;
        stats.record_stage(Stage::Pmbdbdl, 12);

        let summary = stats.summary_string();
        assert!(summary.contains("loaded: 50"));
        assert!(summary.contains("images: 10"));
        assert!(summary.contains("PMBDBDL: 12"));
    }
}
