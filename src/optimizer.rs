//! Tunes the ranked stage-2 cutoffs by integer scaling.
//!
//! Every eligible (label, rank) cutoff becomes one search dimension holding an
//! integer ratio. A trial multiplies the base cutoffs by their ratios, runs the
//! whole pipeline and scores the final stage per label with
//! `(1 - w)(1 - F) + w * overkill_rate`, averaged with the ground-truth box
//! count of each label as weight.

use crate::error::{DefectEvalError, Result};
use crate::matching::GtMatcher;
use crate::metrics::calculator::MetricsCalculator;
use crate::metrics::fbeta::DefectScore;
use crate::pipeline::PostProcessor;
use crate::search::{BayesianSearch, IntegerDimension, SearchConfig};
use crate::threshold::{MinConfidence, ThresholdConfig};
use crate::types::{PredictionKey, RunState};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Smallest evaluation budget accepted.
pub const MIN_SAMPLE_TIMES: usize = 20;

/// Smallest scaling ratio bound accepted.
pub const MIN_MAX_RATIO: u32 = 2;

/// Search hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Weight of the overkill rate against `1 - F`, in (0, 1).
    pub overkill_weight: f64,
    /// Number of pipeline evaluations.
    pub sample_times: usize,
    /// Largest integer ratio a cutoff may be scaled by.
    pub max_ratio: u32,
    pub n_initial_points: usize,
    pub seed: u64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            overkill_weight: 0.14,
            sample_times: 50,
            max_ratio: 20,
            n_initial_points: 10,
            seed: 42,
        }
    }
}

impl OptimizerConfig {
    pub fn new(
        overkill_weight: f64,
        sample_times: usize,
        max_ratio: u32,
        n_initial_points: usize,
        seed: u64,
    ) -> Result<Self> {
        let config = Self {
            overkill_weight,
            sample_times,
            max_ratio,
            n_initial_points,
            seed,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.overkill_weight > 0.0 && self.overkill_weight < 1.0) {
            return Err(DefectEvalError::InvalidHyperParameter(format!(
                "overkill_weight must lie in (0, 1), got {}",
                self.overkill_weight
            )));
        }
        if self.sample_times < MIN_SAMPLE_TIMES {
            return Err(DefectEvalError::InvalidHyperParameter(format!(
                "sample_times must be at least {MIN_SAMPLE_TIMES}, got {}",
                self.sample_times
            )));
        }
        if self.max_ratio < MIN_MAX_RATIO {
            return Err(DefectEvalError::InvalidHyperParameter(format!(
                "max_ratio must be at least {MIN_MAX_RATIO}, got {}",
                self.max_ratio
            )));
        }
        if self.n_initial_points == 0 {
            return Err(DefectEvalError::InvalidHyperParameter(
                "n_initial_points must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// One tunable cutoff: a (label, rank) entry of the stage-2 set.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaledCutoff {
    pub label_name: String,
    pub rank: u32,
    pub base_cutoff: f64,
    /// Largest ratio keeping the scaled cutoff below 1.
    pub max_ratio: u32,
}

/// Outcome of a tuning run. Metrics are percentages; smaller is better.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationResult {
    pub thresholds: ThresholdConfig,
    pub metric_before: f64,
    pub metric_after: f64,
    /// Chosen ratio of every cutoff, in search-space order.
    pub ratios: Vec<(ScaledCutoff, u32)>,
    pub evaluations: usize,
}

/// Largest `i` in `1..=max_ratio` with `cutoff * i < 1`, 0 when none.
fn max_scale(cutoff: f64, max_ratio: u32) -> u32 {
    (1..=max_ratio)
        .take_while(|&i| cutoff * f64::from(i) < 1.0)
        .last()
        .unwrap_or(0)
}

/// Tunes the stage-2 cutoffs of a threshold pair. Runs exactly once.
#[derive(Debug)]
pub struct ThresholdOptimizer<'a> {
    processor: &'a PostProcessor,
    base: ThresholdConfig,
    config: OptimizerConfig,
    result: Option<OptimizationResult>,
    state: RunState,
}

impl<'a> ThresholdOptimizer<'a> {
    pub fn new(processor: &'a PostProcessor, base: ThresholdConfig, config: OptimizerConfig) -> Result<Self> {
        config.validate()?;
        base.stage1.validate()?;
        base.stage2.validate()?;
        Ok(Self {
            processor,
            base,
            config,
            result: None,
            state: RunState::NotRun,
        })
    }

    /// Eligible cutoffs: ranked, not the pass label, scalable by at least 2.
    pub fn search_space(&self) -> Vec<ScaledCutoff> {
        let pass = self.processor.pass_label_name();
        let mut space = Vec::new();
        for (name, threshold) in self.base.stage2.iter() {
            if Some(name) == pass {
                continue;
            }
            let MinConfidence::Ranked(cutoffs) = &threshold.min_confidence else {
                continue;
            };
            for (&rank, &cutoff) in cutoffs {
                let max_ratio = max_scale(cutoff, self.config.max_ratio);
                if max_ratio <= 1 {
                    continue;
                }
                space.push(ScaledCutoff {
                    label_name: name.to_string(),
                    rank,
                    base_cutoff: cutoff,
                    max_ratio,
                });
            }
        }
        space
    }

    /// Base thresholds with every cutoff of `space` multiplied by its ratio.
    pub fn scaled_thresholds(&self, space: &[ScaledCutoff], ratios: &[i64]) -> Result<ThresholdConfig> {
        let mut thresholds = self.base.clone();
        for (cutoff, &ratio) in space.iter().zip(ratios) {
            let threshold = thresholds
                .stage2
                .get_mut(&cutoff.label_name)
                .ok_or_else(|| DefectEvalError::UnknownLabelName(cutoff.label_name.clone()))?;
            if let MinConfidence::Ranked(by_rank) = &mut threshold.min_confidence {
                #[allow(clippy::cast_precision_loss)]
                by_rank.insert(cutoff.rank, cutoff.base_cutoff * ratio as f64);
            }
        }
        Ok(thresholds)
    }

    /// GT-weighted mean defect metric of the final stage, in percent.
    pub fn evaluate(&self, thresholds: &ThresholdConfig) -> Result<f64> {
        let outputs = self.processor.run_stages(&thresholds.stage1, &thresholds.stage2)?;
        let matcher = GtMatcher::new(self.processor.ground_truth());
        let matches = matcher.run(&outputs.pmbdbdl, self.processor.pass_label_id());
        let predictions: Vec<PredictionKey> = outputs.pmbdbdl.iter().map(PredictionKey::of).collect();
        let labels = self.processor.labels();
        let calculator =
            MetricsCalculator::for_mode(labels, self.processor.pass_label_name(), &predictions, &matches)?;

        let mut weighted = 0.0;
        let mut weight_sum = 0.0;
        for (label_id, _) in labels.iter() {
            if Some(label_id) == self.processor.pass_label_id() {
                continue;
            }
            let metrics = calculator.compute(&[label_id]);
            let score = DefectScore::new(
                metrics.matched,
                metrics.missed,
                metrics.wrong,
                metrics.overkill_rate().unwrap_or(0.0),
            );
            #[allow(clippy::cast_precision_loss)]
            let weight = metrics.gt_box_count as f64;
            weighted += weight * score.objective(self.config.overkill_weight);
            weight_sum += weight;
        }
        let weight_sum = if weight_sum > 0.0 { weight_sum } else { 1.0 };
        Ok(weighted / weight_sum * 100.0)
    }

    pub fn run(&mut self) -> Result<&OptimizationResult> {
        self.state.begin("threshold optimizer")?;
        let metric_before = self.evaluate(&self.base)?;
        info!(metric = metric_before, "metric before tuning");

        let space = self.search_space();
        if space.is_empty() {
            info!("no tunable cutoffs, keeping the base thresholds");
            let result = OptimizationResult {
                thresholds: self.base.clone(),
                metric_before,
                metric_after: metric_before,
                ratios: Vec::new(),
                evaluations: 1,
            };
            return Ok(self.result.insert(result));
        }

        let dimensions = space
            .iter()
            .map(|c| IntegerDimension::new(1, i64::from(c.max_ratio)))
            .collect::<Result<Vec<_>>>()?;
        let search_config = SearchConfig {
            n_calls: self.config.sample_times,
            n_initial_points: self.config.n_initial_points,
            seed: self.config.seed,
            ..SearchConfig::default()
        };
        let mut search = BayesianSearch::new(dimensions, search_config)?;
        let mut evaluations = 1;
        let found = search.minimize(|ratios| {
            evaluations += 1;
            let thresholds = self.scaled_thresholds(&space, ratios)?;
            let value = self.evaluate(&thresholds)?;
            debug!(?ratios, value, "optimizer trial");
            Ok(value)
        })?;

        let (thresholds, metric_after, chosen) = if found.best_value < metric_before {
            (
                self.scaled_thresholds(&space, &found.best_point)?,
                found.best_value,
                found.best_point,
            )
        } else {
            (self.base.clone(), metric_before, vec![1; space.len()])
        };
        info!(metric = metric_after, evaluations, "metric after tuning");

        let ratios = space
            .into_iter()
            .zip(chosen)
            .map(|(cutoff, ratio)| (cutoff, u32::try_from(ratio).unwrap_or(1)))
            .collect();
        let result = OptimizationResult {
            thresholds,
            metric_before,
            metric_after,
            ratios,
            evaluations,
        };
        Ok(self.result.insert(result))
    }

    pub fn result(&self) -> Result<&OptimizationResult> {
        self.result
            .as_ref()
            .ok_or(DefectEvalError::RanTooEarly("threshold optimizer"))
    }

    pub fn into_result(self) -> Result<OptimizationResult> {
        self.result.ok_or(DefectEvalError::RanTooEarly("threshold optimizer"))
    }
}
