//! Core data types for detections, ground truth and match rows.

use crate::error::{DefectEvalError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Axis-aligned extent described by a centre and a size.
///
/// `length` runs along the x axis and `width` along the y axis.
pub trait Extent {
    fn center_x(&self) -> f64;
    fn center_y(&self) -> f64;
    fn length(&self) -> f64;
    fn width(&self) -> f64;

    /// Left edge (centre_x - length / 2).
    fn left(&self) -> f64 {
        self.center_x() - self.length() / 2.0
    }

    /// Right edge (centre_x + length / 2).
    fn right(&self) -> f64 {
        self.center_x() + self.length() / 2.0
    }

    /// Top edge (centre_y + width / 2).
    fn top(&self) -> f64 {
        self.center_y() + self.width() / 2.0
    }

    /// Bottom edge (centre_y - width / 2).
    fn bottom(&self) -> f64 {
        self.center_y() - self.width() / 2.0
    }
}

/// A predicted row as seen by the matcher and the metrics engine.
pub trait Prediction: Extent {
    fn image_id(&self) -> u64;
    fn box_id(&self) -> u64;
    fn label_id(&self) -> u64;
    fn confidence(&self) -> f64;

    /// Rank of this label within its merged box, when ranks were assigned.
    fn label_index(&self) -> Option<u32> {
        None
    }
}

impl<T: Extent + ?Sized> Extent for &T {
    fn center_x(&self) -> f64 {
        (**self).center_x()
    }
    fn center_y(&self) -> f64 {
        (**self).center_y()
    }
    fn length(&self) -> f64 {
        (**self).length()
    }
    fn width(&self) -> f64 {
        (**self).width()
    }
}

impl<T: Prediction + ?Sized> Prediction for &T {
    fn image_id(&self) -> u64 {
        (**self).image_id()
    }
    fn box_id(&self) -> u64 {
        (**self).box_id()
    }
    fn label_id(&self) -> u64 {
        (**self).label_id()
    }
    fn confidence(&self) -> f64 {
        (**self).confidence()
    }
    fn label_index(&self) -> Option<u32> {
        (**self).label_index()
    }
}

/// A detection box.
///
/// `area` is kept as a field rather than derived: raw detector output stores a
/// separately rounded area, and recomputing it from `length * width` drifts far
/// enough to move the reported ratios.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub image_id: u64,
    pub label_id: u64,
    pub confidence: f64,
    pub center_x: f64,
    pub center_y: f64,
    pub length: f64,
    pub width: f64,
    pub box_id: u64,
    pub area: f64,
    /// Box ids absorbed into this box by merging. Empty for raw boxes.
    #[serde(skip)]
    pub merge_lineage: BTreeSet<u64>,
}

impl DetectionBox {
    /// Create a new box whose area is `length * width`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        image_id: u64,
        label_id: u64,
        confidence: f64,
        center_x: f64,
        center_y: f64,
        length: f64,
        width: f64,
        box_id: u64,
    ) -> Self {
        Self {
            image_id,
            label_id,
            confidence,
            center_x,
            center_y,
            length,
            width,
            box_id,
            area: length * width,
            merge_lineage: BTreeSet::new(),
        }
    }

    /// Replace the derived area with a stored one.
    pub fn with_area(mut self, area: f64) -> Self {
        self.area = area;
        self
    }

    /// Record `other` (its id and its own lineage) as absorbed into this box.
    pub fn absorb_lineage(&mut self, other: &DetectionBox) {
        self.merge_lineage.insert(other.box_id);
        self.merge_lineage.extend(other.merge_lineage.iter().copied());
    }
}

impl Extent for DetectionBox {
    fn center_x(&self) -> f64 {
        self.center_x
    }
    fn center_y(&self) -> f64 {
        self.center_y
    }
    fn length(&self) -> f64 {
        self.length
    }
    fn width(&self) -> f64 {
        self.width
    }
}

impl Prediction for DetectionBox {
    fn image_id(&self) -> u64 {
        self.image_id
    }
    fn box_id(&self) -> u64 {
        self.box_id
    }
    fn label_id(&self) -> u64 {
        self.label_id
    }
    fn confidence(&self) -> f64 {
        self.confidence
    }
}

/// A ground-truth annotation box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthBox {
    pub image_id: u64,
    pub label_id: u64,
    pub center_x: f64,
    pub center_y: f64,
    pub length: f64,
    pub width: f64,
    pub box_id: u64,
    pub area: f64,
}

impl GroundTruthBox {
    /// Create a new annotation whose area is `length * width`.
    pub fn new(
        image_id: u64,
        label_id: u64,
        center_x: f64,
        center_y: f64,
        length: f64,
        width: f64,
        box_id: u64,
    ) -> Self {
        Self {
            image_id,
            label_id,
            center_x,
            center_y,
            length,
            width,
            box_id,
            area: length * width,
        }
    }
}

impl Extent for GroundTruthBox {
    fn center_x(&self) -> f64 {
        self.center_x
    }
    fn center_y(&self) -> f64 {
        self.center_y
    }
    fn length(&self) -> f64 {
        self.length
    }
    fn width(&self) -> f64 {
        self.width
    }
}

/// A merged-box candidate label with its 1-based rank inside the merged box.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedDetection {
    /// Sequence id assigned when the merged rows were flattened and sorted.
    pub row_id: usize,
    /// 1 = most confident candidate within the merged box.
    pub label_index: u32,
    pub detection: DetectionBox,
}

impl Extent for RankedDetection {
    fn center_x(&self) -> f64 {
        self.detection.center_x
    }
    fn center_y(&self) -> f64 {
        self.detection.center_y
    }
    fn length(&self) -> f64 {
        self.detection.length
    }
    fn width(&self) -> f64 {
        self.detection.width
    }
}

impl Prediction for RankedDetection {
    fn image_id(&self) -> u64 {
        self.detection.image_id
    }
    fn box_id(&self) -> u64 {
        self.detection.box_id
    }
    fn label_id(&self) -> u64 {
        self.detection.label_id
    }
    fn confidence(&self) -> f64 {
        self.detection.confidence
    }
    fn label_index(&self) -> Option<u32> {
        Some(self.label_index)
    }
}

/// One ground-truth box joined against one predicted box. At least one side is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRow {
    pub image_id: u64,
    pub gt_box_id: Option<u64>,
    pub gt_label_id: Option<u64>,
    pub p_box_id: Option<u64>,
    pub p_label_id: Option<u64>,
    pub p_label_index: Option<u32>,
    pub confidence: Option<f64>,
}

impl MatchRow {
    /// True when the predicted side is empty.
    pub fn is_unpredicted(&self) -> bool {
        self.p_box_id.is_none()
    }

    /// True when both sides carry the same label.
    pub fn labels_agree(&self) -> bool {
        matches!((self.gt_label_id, self.p_label_id), (Some(gt), Some(p)) if gt == p)
    }
}

/// Predicted-side key used for box counting: (image, box, label).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PredictionKey {
    pub image_id: u64,
    pub box_id: u64,
    pub label_id: u64,
}

impl PredictionKey {
    pub fn of<P: Prediction>(prediction: &P) -> Self {
        Self {
            image_id: prediction.image_id(),
            box_id: prediction.box_id(),
            label_id: prediction.label_id(),
        }
    }
}

/// Processing stages of the post-processing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    /// Raw detector output.
    #[serde(rename = "OP")]
    Op,
    /// Confidence-filtered.
    #[serde(rename = "P")]
    P,
    /// Merged.
    #[serde(rename = "PMB")]
    Pmb,
    /// Merged and ranked.
    #[serde(rename = "PMBDB")]
    Pmbdb,
    /// Merged, ranked and rank-filtered.
    #[serde(rename = "PMBDBDL")]
    Pmbdbdl,
    /// Externally filtered final rows evaluated directly.
    #[serde(rename = "PMBDBDL_FILTERED")]
    Filtered,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Op => "OP",
            Stage::P => "P",
            Stage::Pmb => "PMB",
            Stage::Pmbdb => "PMBDB",
            Stage::Pmbdbdl => "PMBDBDL",
            Stage::Filtered => "PMBDBDL_FILTERED",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bidirectional label id / name mapping, iterated in ascending id order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<u64, String>", into = "BTreeMap<u64, String>")]
pub struct LabelMap {
    id_to_name: BTreeMap<u64, String>,
    name_to_id: HashMap<String, u64>,
}

impl LabelMap {
    /// Build a label map, rejecting empty maps and duplicate names.
    pub fn new(id_to_name: BTreeMap<u64, String>) -> Result<Self> {
        if id_to_name.is_empty() {
            return Err(DefectEvalError::InvalidConfig(
                "label map must contain at least one label".to_string(),
            ));
        }
        let mut name_to_id = HashMap::with_capacity(id_to_name.len());
        for (&id, name) in &id_to_name {
            if name_to_id.insert(name.clone(), id).is_some() {
                return Err(DefectEvalError::InvalidConfig(format!(
                    "duplicate label name {name}"
                )));
            }
        }
        Ok(Self {
            id_to_name,
            name_to_id,
        })
    }

    /// Convenience constructor from `(id, name)` pairs.
    pub fn from_pairs<S: Into<String>>(pairs: impl IntoIterator<Item = (u64, S)>) -> Result<Self> {
        Self::new(pairs.into_iter().map(|(id, name)| (id, name.into())).collect())
    }

    pub fn name(&self, id: u64) -> Result<&str> {
        self.id_to_name
            .get(&id)
            .map(String::as_str)
            .ok_or(DefectEvalError::UnknownLabelId(id))
    }

    pub fn id(&self, name: &str) -> Result<u64> {
        self.name_to_id
            .get(name)
            .copied()
            .ok_or_else(|| DefectEvalError::UnknownLabelName(name.to_string()))
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.name_to_id.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &str)> {
        self.id_to_name.iter().map(|(&id, name)| (id, name.as_str()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.id_to_name.values().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.id_to_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_name.is_empty()
    }
}

impl TryFrom<BTreeMap<u64, String>> for LabelMap {
    type Error = DefectEvalError;

    fn try_from(value: BTreeMap<u64, String>) -> Result<Self> {
        Self::new(value)
    }
}

impl From<LabelMap> for BTreeMap<u64, String> {
    fn from(value: LabelMap) -> Self {
        value.id_to_name
    }
}

/// Run-once state carried by every write-once component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunState {
    #[default]
    NotRun,
    Ran,
}

impl RunState {
    /// Move to `Ran`, failing if the component already ran.
    pub fn begin(&mut self, component: &'static str) -> Result<()> {
        match self {
            RunState::Ran => Err(DefectEvalError::RanTwice(component)),
            RunState::NotRun => {
                *self = RunState::Ran;
                Ok(())
            }
        }
    }
}

/// Group items by a key, keeping input order within each group and ascending key order across groups.
pub fn group_by<T, K: Ord, F: Fn(&T) -> K>(items: impl IntoIterator<Item = T>, key: F) -> BTreeMap<K, Vec<T>> {
    let mut groups: BTreeMap<K, Vec<T>> = BTreeMap::new();
    for item in items {
        groups.entry(key(&item)).or_default().push(item);
    }
    groups
}
