//! Per-label confidence thresholds, uniform or keyed by label rank.

use crate::error::{DefectEvalError, Result};
use crate::types::{LabelMap, Prediction};
use serde::de::{self, MapAccess, Unexpected, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::Path;

/// Cutoff of one label: a single value, or one value per rank.
///
/// In documents a uniform cutoff is a bare number and a ranked one an object
/// keyed by rank.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MinConfidence {
    Uniform(f64),
    Ranked(BTreeMap<u32, f64>),
}

impl MinConfidence {
    /// Cutoff applying to a row of the given confidence and rank.
    ///
    /// In ranked mode an unranked row, or a rank with no cutoff, gets
    /// `1 + confidence` so that it can never pass.
    pub fn cutoff_for(&self, confidence: f64, label_index: Option<u32>) -> f64 {
        match self {
            MinConfidence::Uniform(cutoff) => *cutoff,
            MinConfidence::Ranked(cutoffs) => label_index
                .and_then(|rank| cutoffs.get(&rank).copied())
                .unwrap_or(1.0 + confidence),
        }
    }
}

// Rank keys arrive as JSON strings, which an untagged derive rejects.
impl<'de> Deserialize<'de> for MinConfidence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(MinConfidenceVisitor)
    }
}

struct MinConfidenceVisitor;

impl<'de> Visitor<'de> for MinConfidenceVisitor {
    type Value = MinConfidence;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a cutoff or a map from rank to cutoff")
    }

    fn visit_f64<E: de::Error>(self, value: f64) -> std::result::Result<Self::Value, E> {
        Ok(MinConfidence::Uniform(value))
    }

    #[allow(clippy::cast_precision_loss)]
    fn visit_u64<E: de::Error>(self, value: u64) -> std::result::Result<Self::Value, E> {
        Ok(MinConfidence::Uniform(value as f64))
    }

    #[allow(clippy::cast_precision_loss)]
    fn visit_i64<E: de::Error>(self, value: i64) -> std::result::Result<Self::Value, E> {
        Ok(MinConfidence::Uniform(value as f64))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
        let mut cutoffs = BTreeMap::new();
        while let Some((rank, cutoff)) = map.next_entry::<String, f64>()? {
            let rank = rank
                .trim()
                .parse::<u32>()
                .map_err(|_| <A::Error as de::Error>::invalid_value(Unexpected::Str(&rank), &"a label rank"))?;
            cutoffs.insert(rank, cutoff);
        }
        Ok(MinConfidence::Ranked(cutoffs))
    }
}

/// Confidence threshold of a single label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub label_id: u64,
    #[serde(default)]
    pub label_name: String,
    pub min_confidence: MinConfidence,
}

impl Threshold {
    pub fn new(label_id: u64, label_name: impl Into<String>, min_confidence: MinConfidence) -> Self {
        Self {
            label_id,
            label_name: label_name.into(),
            min_confidence,
        }
    }

    /// True when the row carries this label and its confidence strictly
    /// exceeds the applicable cutoff.
    pub fn is_row_ok(&self, label_id: u64, confidence: f64, label_index: Option<u32>) -> bool {
        label_id == self.label_id && confidence > self.min_confidence.cutoff_for(confidence, label_index)
    }

    pub fn accepts<P: Prediction>(&self, prediction: &P) -> bool {
        self.is_row_ok(prediction.label_id(), prediction.confidence(), prediction.label_index())
    }
}

/// Thresholds of every label, keyed by label name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Threshold>", into = "BTreeMap<String, Threshold>")]
pub struct ThresholdSet {
    thresholds: BTreeMap<String, Threshold>,
}

impl From<BTreeMap<String, Threshold>> for ThresholdSet {
    fn from(mut thresholds: BTreeMap<String, Threshold>) -> Self {
        for (name, threshold) in &mut thresholds {
            if threshold.label_name.is_empty() {
                threshold.label_name.clone_from(name);
            }
        }
        Self { thresholds }
    }
}

impl From<ThresholdSet> for BTreeMap<String, Threshold> {
    fn from(value: ThresholdSet) -> Self {
        value.thresholds
    }
}

impl ThresholdSet {
    /// The same uniform cutoff for every label of the map.
    pub fn uniform(labels: &LabelMap, cutoff: f64) -> Self {
        labels
            .iter()
            .map(|(id, name)| (name.to_string(), Threshold::new(id, name, MinConfidence::Uniform(cutoff))))
            .collect::<BTreeMap<_, _>>()
            .into()
    }

    pub fn insert(&mut self, threshold: Threshold) {
        self.thresholds.insert(threshold.label_name.clone(), threshold);
    }

    pub fn get(&self, label_name: &str) -> Option<&Threshold> {
        self.thresholds.get(label_name)
    }

    pub fn get_mut(&mut self, label_name: &str) -> Option<&mut Threshold> {
        self.thresholds.get_mut(label_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Threshold)> {
        self.thresholds.iter().map(|(name, t)| (name.as_str(), t))
    }

    pub fn len(&self) -> usize {
        self.thresholds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }

    /// Index the thresholds by label id.
    ///
    /// # Errors
    ///
    /// Returns an error if two entries share a label id.
    pub fn by_label_id(&self) -> Result<HashMap<u64, &Threshold>> {
        let mut index = HashMap::with_capacity(self.thresholds.len());
        for threshold in self.thresholds.values() {
            if let Some(previous) = index.insert(threshold.label_id, threshold) {
                return Err(DefectEvalError::InvalidThreshold(format!(
                    "labels {} and {} share label id {}",
                    previous.label_name, threshold.label_name, threshold.label_id
                )));
            }
        }
        Ok(index)
    }

    /// Check every cutoff is finite and every label id is unique.
    pub fn validate(&self) -> Result<()> {
        self.by_label_id()?;
        for threshold in self.thresholds.values() {
            let finite = match &threshold.min_confidence {
                MinConfidence::Uniform(cutoff) => cutoff.is_finite(),
                MinConfidence::Ranked(cutoffs) => cutoffs.values().all(|c| c.is_finite()),
            };
            if !finite {
                return Err(DefectEvalError::InvalidThreshold(format!(
                    "label {} has a non-finite cutoff",
                    threshold.label_name
                )));
            }
        }
        Ok(())
    }
}

/// The two threshold sets of a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// OP -> P cutoffs.
    #[serde(rename = "stage-1")]
    pub stage1: ThresholdSet,
    /// PMBDB -> PMBDBDL cutoffs.
    #[serde(rename = "stage-2")]
    pub stage2: ThresholdSet,
}

impl ThresholdConfig {
    pub fn new(stage1: ThresholdSet, stage2: ThresholdSet) -> Self {
        Self { stage1, stage2 }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.stage1.validate()?;
        config.stage2.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_json_string()?)?;
        Ok(())
    }
}
