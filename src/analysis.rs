//! Cold-start thresholds derived from the true positives of a zero-threshold run.

use crate::error::{DefectEvalError, Result};
use crate::threshold::{MinConfidence, Threshold, ThresholdConfig, ThresholdSet};
use crate::types::{LabelMap, MatchRow, RunState};
use std::collections::BTreeMap;
use tracing::info;

/// Cutoff of a label that never produced a true positive.
pub const UNREACHABLE_CUTOFF: f64 = 1.0;

/// Offset keeping the least confident true positive just above its cutoff.
pub const MIN_CONFIDENCE_OFFSET: f64 = 1e-4;

/// (label, rank, confidence) of every row whose predicted label agrees with the annotation.
fn true_positives(rows: &[MatchRow]) -> impl Iterator<Item = (u64, Option<u32>, f64)> + '_ {
    rows.iter().filter(|row| row.labels_agree()).filter_map(|row| {
        let label = row.gt_label_id?;
        let confidence = row.confidence?;
        Some((label, row.p_label_index, confidence))
    })
}

/// Derives stage-1 and stage-2 thresholds. Runs exactly once.
#[derive(Debug)]
pub struct ThresholdAnalyzer<'a> {
    labels: &'a LabelMap,
    op_matches: &'a [MatchRow],
    ranked_matches: &'a [MatchRow],
    result: Option<ThresholdConfig>,
    state: RunState,
}

impl<'a> ThresholdAnalyzer<'a> {
    /// `op_matches` are the raw detections matched against ground truth,
    /// `ranked_matches` the ranked (PMBDB) rows. Neither should have had the
    /// pass label dropped.
    pub fn new(labels: &'a LabelMap, op_matches: &'a [MatchRow], ranked_matches: &'a [MatchRow]) -> Self {
        Self {
            labels,
            op_matches,
            ranked_matches,
            result: None,
            state: RunState::NotRun,
        }
    }

    pub fn run(&mut self) -> Result<&ThresholdConfig> {
        self.state.begin("threshold analyzer")?;
        let config = ThresholdConfig::new(self.uniform_thresholds()?, self.ranked_thresholds()?);
        info!(
            stage1 = config.stage1.len(),
            stage2 = config.stage2.len(),
            "derived thresholds from true positives"
        );
        Ok(self.result.insert(config))
    }

    pub fn result(&self) -> Result<&ThresholdConfig> {
        self.result
            .as_ref()
            .ok_or(DefectEvalError::RanTooEarly("threshold analyzer"))
    }

    pub fn into_result(self) -> Result<ThresholdConfig> {
        self.result.ok_or(DefectEvalError::RanTooEarly("threshold analyzer"))
    }

    fn uniform_thresholds(&self) -> Result<ThresholdSet> {
        let mut cutoffs: BTreeMap<u64, f64> = self.labels.iter().map(|(id, _)| (id, UNREACHABLE_CUTOFF)).collect();
        for (label, _, confidence) in true_positives(self.op_matches) {
            let cutoff = cutoffs.get_mut(&label).ok_or(DefectEvalError::UnknownLabelId(label))?;
            *cutoff = cutoff.min(confidence - MIN_CONFIDENCE_OFFSET);
        }

        let mut set = ThresholdSet::default();
        for (id, cutoff) in cutoffs {
            set.insert(Threshold::new(id, self.labels.name(id)?, MinConfidence::Uniform(cutoff)));
        }
        Ok(set)
    }

    fn ranked_thresholds(&self) -> Result<ThresholdSet> {
        let mut cutoffs: BTreeMap<u64, BTreeMap<u32, f64>> =
            self.labels.iter().map(|(id, _)| (id, BTreeMap::new())).collect();
        for (label, rank, confidence) in true_positives(self.ranked_matches) {
            let rank = rank.ok_or_else(|| {
                DefectEvalError::StageMismatch("ranked thresholds need rows with a label rank".to_string())
            })?;
            let by_rank = cutoffs.get_mut(&label).ok_or(DefectEvalError::UnknownLabelId(label))?;
            let cutoff = by_rank.entry(rank).or_insert(UNREACHABLE_CUTOFF);
            *cutoff = cutoff.min(confidence - MIN_CONFIDENCE_OFFSET);
        }

        let mut set = ThresholdSet::default();
        for (id, by_rank) in cutoffs {
            set.insert(Threshold::new(id, self.labels.name(id)?, MinConfidence::Ranked(by_rank)));
        }
        Ok(set)
    }
}
