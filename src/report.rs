//! Ratio report over the evaluated pipeline stages.

use crate::error::{DefectEvalError, Result};
use crate::matching::GtMatcher;
use crate::metrics::calculator::{LabelSelection, MetricRow, MetricsCalculator};
use crate::types::{LabelMap, MatchRow, Prediction, PredictionKey, RunState, Stage};
use std::collections::BTreeSet;
use tracing::info;

/// Label subset excluded by the second report condition.
pub const OTHER_LABEL: &str = "other";

/// Prediction keys and match rows of one pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageEvaluation {
    pub stage: Stage,
    pub predictions: Vec<PredictionKey>,
    pub matches: Vec<MatchRow>,
}

impl StageEvaluation {
    /// Match the rows of one stage against the ground truth.
    pub fn evaluate<P: Prediction>(
        stage: Stage,
        rows: &[P],
        matcher: &GtMatcher<'_>,
        drop_label_id: Option<u64>,
    ) -> Self {
        Self {
            stage,
            predictions: rows.iter().map(PredictionKey::of).collect(),
            matches: matcher.run(rows, drop_label_id),
        }
    }
}

/// Label selections of every stage, in report order: every label, every
/// label but "other", then each label alone in id order.
pub fn report_conditions(labels: &LabelMap) -> Vec<LabelSelection> {
    let mut conditions = vec![
        LabelSelection::all(),
        LabelSelection::BlackList(vec![OTHER_LABEL.to_string()]),
    ];
    conditions.extend(labels.names().map(LabelSelection::only));
    conditions
}

/// Builds the report rows of a set of stage evaluations. Runs exactly once.
#[derive(Debug)]
pub struct ReportBuilder<'a> {
    labels: &'a LabelMap,
    pass_label_name: Option<String>,
    evaluations: Vec<StageEvaluation>,
    rows: Option<Vec<MetricRow>>,
    state: RunState,
}

impl<'a> ReportBuilder<'a> {
    /// # Errors
    ///
    /// Returns an error if two evaluations cover the same stage.
    pub fn new(
        labels: &'a LabelMap,
        pass_label_name: Option<&str>,
        evaluations: Vec<StageEvaluation>,
    ) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for evaluation in &evaluations {
            if !seen.insert(evaluation.stage) {
                return Err(DefectEvalError::StageMismatch(format!(
                    "stage {} evaluated more than once",
                    evaluation.stage
                )));
            }
        }
        Ok(Self {
            labels,
            pass_label_name: pass_label_name.map(str::to_string),
            evaluations,
            rows: None,
            state: RunState::NotRun,
        })
    }

    pub fn run(&mut self) -> Result<&[MetricRow]> {
        self.state.begin("report builder")?;
        let conditions = report_conditions(self.labels);
        let mut rows = Vec::with_capacity(self.evaluations.len() * conditions.len());
        for evaluation in &self.evaluations {
            let calculator = MetricsCalculator::for_mode(
                self.labels,
                self.pass_label_name.as_deref(),
                &evaluation.predictions,
                &evaluation.matches,
            )?;
            for selection in &conditions {
                rows.push(calculator.run(evaluation.stage, selection)?);
            }
            info!(stage = %evaluation.stage, "report rows computed");
        }
        Ok(self.rows.insert(rows).as_slice())
    }

    pub fn result(&self) -> Result<&[MetricRow]> {
        self.rows
            .as_deref()
            .ok_or(DefectEvalError::RanTooEarly("report builder"))
    }

    pub fn into_rows(self) -> Result<Vec<MetricRow>> {
        self.rows.ok_or(DefectEvalError::RanTooEarly("report builder"))
    }
}
