//! Match / miss / wrong / overkill accounting over matched rows.
//!
//! One calculator serves both report flavours: [`MetricsMode::Plain`] counts
//! every selected label as a defect, while [`MetricsMode::WithPassLabel`]
//! treats the pass label as "no defect" and adds the implicit pass verdicts of
//! images where nothing but pass was predicted.

use crate::error::{DefectEvalError, Result};
use crate::types::{group_by, LabelMap, MatchRow, PredictionKey, Stage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Labels a metric row is computed over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelSelection {
    /// Exactly these labels.
    WhiteList(Vec<String>),
    /// Every label except these. An empty list selects every label.
    BlackList(Vec<String>),
}

impl LabelSelection {
    pub fn all() -> Self {
        LabelSelection::BlackList(Vec::new())
    }

    pub fn only(name: impl Into<String>) -> Self {
        LabelSelection::WhiteList(vec![name.into()])
    }

    /// Build a selection from optional white and black lists; exactly one must be given.
    pub fn from_lists(white: Option<Vec<String>>, black: Option<Vec<String>>) -> Result<Self> {
        match (white, black) {
            (Some(white), None) if white.is_empty() => Err(DefectEvalError::InvalidLabelSelection(
                "white list must name at least one label".to_string(),
            )),
            (Some(white), None) => Ok(LabelSelection::WhiteList(white)),
            (None, Some(black)) => Ok(LabelSelection::BlackList(black)),
            _ => Err(DefectEvalError::InvalidLabelSelection(
                "exactly one of white list and black list must be given".to_string(),
            )),
        }
    }

    /// Selected label ids. White lists keep their order, black lists follow id order.
    pub fn resolve(&self, labels: &LabelMap) -> Result<Vec<u64>> {
        match self {
            LabelSelection::WhiteList(names) => names.iter().map(|name| labels.id(name)).collect(),
            LabelSelection::BlackList(names) => Ok(labels
                .iter()
                .filter(|(_, name)| !names.iter().any(|n| n.as_str() == *name))
                .map(|(id, _)| id)
                .collect()),
        }
    }

    fn ignored(&self) -> &[String] {
        match self {
            LabelSelection::WhiteList(_) => &[],
            LabelSelection::BlackList(names) => names,
        }
    }
}

/// How the pass label takes part in the counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricsMode {
    Plain,
    WithPassLabel { label_id: u64, label_name: String },
}

/// Raw counts of one label selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicMetrics {
    pub gt_box_count: usize,
    pub p_box_count: usize,
    pub p_box_distinct_count: usize,
    pub matched: usize,
    pub missed: usize,
    pub wrong: usize,
    pub overkill: usize,
}

#[allow(clippy::cast_precision_loss)]
fn ratio(count: usize, base: usize) -> Option<f64> {
    (base > 0).then(|| count as f64 / base as f64)
}

/// Percent string with two decimals, `None` for a zero base.
pub fn format_rate(count: usize, base: usize) -> Option<String> {
    ratio(count, base).map(|r| format!("{:.2}%", 100.0 * r))
}

impl BasicMetrics {
    pub fn match_rate(&self) -> Option<f64> {
        ratio(self.matched, self.gt_box_count)
    }

    pub fn miss_rate(&self) -> Option<f64> {
        ratio(self.missed, self.gt_box_count)
    }

    pub fn wrong_rate(&self) -> Option<f64> {
        ratio(self.wrong, self.gt_box_count)
    }

    pub fn overkill_rate(&self) -> Option<f64> {
        ratio(self.overkill, self.p_box_count)
    }
}

/// One report row. Field order is the column order of the exported report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub stage: Stage,
    pub defect_type: String,
    pub ignored_labels: String,
    pub pass_label: String,
    pub gt_count: usize,
    pub pred_label_count: usize,
    pub pred_box_count: usize,
    pub match_count: usize,
    pub match_rate: Option<String>,
    pub miss_count: usize,
    pub miss_rate: Option<String>,
    pub wrong_count: usize,
    pub wrong_rate: Option<String>,
    pub overkill_count: usize,
    pub overkill_rate: Option<String>,
}

fn is_missed(group: &[&MatchRow]) -> bool {
    group.len() == 1 && group[0].is_unpredicted()
}

fn is_matched(group: &[&MatchRow]) -> bool {
    group.iter().any(|row| row.labels_agree())
}

fn is_wrong(group: &[&MatchRow]) -> bool {
    !is_missed(group) && !is_matched(group)
}

/// Metric engine over the prediction rows and match rows of one stage.
#[derive(Debug)]
pub struct MetricsCalculator<'a> {
    labels: &'a LabelMap,
    mode: MetricsMode,
    predictions: &'a [PredictionKey],
    matches_by_image: BTreeMap<u64, Vec<&'a MatchRow>>,
    pass_box_count: usize,
    pass_match_count: usize,
}

impl<'a> MetricsCalculator<'a> {
    pub fn new(labels: &'a LabelMap, predictions: &'a [PredictionKey], matches: &'a [MatchRow]) -> Self {
        Self {
            labels,
            mode: MetricsMode::Plain,
            predictions,
            matches_by_image: group_by(matches.iter(), |row| row.image_id),
            pass_box_count: 0,
            pass_match_count: 0,
        }
    }

    /// Calculator treating `pass_label_name` as the "no defect" verdict.
    pub fn with_pass_label(
        labels: &'a LabelMap,
        pass_label_name: &str,
        predictions: &'a [PredictionKey],
        matches: &'a [MatchRow],
    ) -> Result<Self> {
        let pass_label_id = labels
            .id(pass_label_name)
            .map_err(|_| DefectEvalError::UnknownPassLabel(pass_label_name.to_string()))?;
        let mut calculator = Self::new(labels, predictions, matches);
        calculator.mode = MetricsMode::WithPassLabel {
            label_id: pass_label_id,
            label_name: pass_label_name.to_string(),
        };
        calculator.count_pass_verdicts(pass_label_id);
        Ok(calculator)
    }

    /// Pick the mode from an optional pass label.
    pub fn for_mode(
        labels: &'a LabelMap,
        pass_label_name: Option<&str>,
        predictions: &'a [PredictionKey],
        matches: &'a [MatchRow],
    ) -> Result<Self> {
        match pass_label_name {
            Some(name) => Self::with_pass_label(labels, name, predictions, matches),
            None => Ok(Self::new(labels, predictions, matches)),
        }
    }

    pub fn mode(&self) -> &MetricsMode {
        &self.mode
    }

    // Every image without a non-pass prediction counts one implicit pass
    // prediction per ground-truth key, matched when the annotation is pass.
    fn count_pass_verdicts(&mut self, pass_label_id: u64) {
        for rows in self.matches_by_image.values() {
            let has_defect = rows
                .iter()
                .any(|row| row.p_label_id.is_some_and(|label| label != pass_label_id));
            if has_defect {
                continue;
            }
            for group in group_by(rows.iter(), |row| row.gt_box_id).values() {
                self.pass_box_count += 1;
                if group[0].gt_label_id == Some(pass_label_id) {
                    self.pass_match_count += 1;
                }
            }
        }
    }

    /// Counts over the given label ids.
    pub fn compute(&self, label_ids: &[u64]) -> BasicMetrics {
        let selected: BTreeSet<u64> = label_ids.iter().copied().collect();
        let pass_label_id = match &self.mode {
            MetricsMode::Plain => None,
            MetricsMode::WithPassLabel { label_id, .. } => Some(*label_id),
        };
        let defects: BTreeSet<u64> = selected
            .iter()
            .copied()
            .filter(|id| Some(*id) != pass_label_id)
            .collect();
        let is_defect = |label: Option<u64>| label.is_some_and(|l| defects.contains(&l));

        let mut metrics = BasicMetrics::default();

        let mut distinct_boxes = HashSet::new();
        for key in self.predictions.iter().filter(|k| defects.contains(&k.label_id)) {
            metrics.p_box_count += 1;
            distinct_boxes.insert((key.image_id, key.box_id));
        }
        metrics.p_box_distinct_count = distinct_boxes.len();

        let mut gt_keys = HashSet::new();
        for (&image_id, rows) in &self.matches_by_image {
            for row in rows {
                if row.gt_label_id.is_some_and(|l| selected.contains(&l)) {
                    gt_keys.insert((image_id, row.gt_box_id));
                }
            }

            let defect_rows = rows.iter().copied().filter(|row| is_defect(row.gt_label_id));
            for group in group_by(defect_rows, |row| row.gt_box_id).values() {
                metrics.missed += usize::from(is_missed(group));
                metrics.matched += usize::from(is_matched(group));
                metrics.wrong += usize::from(is_wrong(group));
            }

            for row in rows {
                let unexpected = row.gt_label_id.is_none() || row.gt_label_id == pass_label_id;
                if unexpected && is_defect(row.p_label_id) {
                    metrics.overkill += 1;
                }
            }
        }
        metrics.gt_box_count = gt_keys.len();

        if let Some(pass) = pass_label_id {
            if selected.contains(&pass) {
                metrics.p_box_count += self.pass_box_count;
                metrics.p_box_distinct_count += self.pass_box_count;
                metrics.matched += self.pass_match_count;
            }
        }
        metrics
    }

    /// Compute one report row for a stage and label selection.
    pub fn run(&self, stage: Stage, selection: &LabelSelection) -> Result<MetricRow> {
        let label_ids = selection.resolve(self.labels)?;
        let metrics = self.compute(&label_ids);

        let defect_type = if label_ids.len() == self.labels.len() {
            "all".to_string()
        } else {
            label_ids
                .iter()
                .map(|&id| self.labels.name(id))
                .collect::<Result<Vec<_>>>()?
                .join("+")
        };
        let ignored = selection.ignored();
        let ignored_labels = if ignored.is_empty() {
            "none".to_string()
        } else {
            format!("excluding: {}", ignored.join("+"))
        };
        let pass_label = match &self.mode {
            MetricsMode::Plain => "no pass label".to_string(),
            MetricsMode::WithPassLabel { label_name, .. } => format!("pass label: {label_name}"),
        };

        Ok(MetricRow {
            stage,
            defect_type,
            ignored_labels,
            pass_label,
            gt_count: metrics.gt_box_count,
            pred_label_count: metrics.p_box_count,
            pred_box_count: metrics.p_box_distinct_count,
            match_count: metrics.matched,
            match_rate: format_rate(metrics.matched, metrics.gt_box_count),
            miss_count: metrics.missed,
            miss_rate: format_rate(metrics.missed, metrics.gt_box_count),
            wrong_count: metrics.wrong,
            wrong_rate: format_rate(metrics.wrong, metrics.gt_box_count),
            overkill_count: metrics.overkill,
            overkill_rate: format_rate(metrics.overkill, metrics.p_box_count),
        })
    }
}
