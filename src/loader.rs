//! CSV loading for ground-truth, detector-output and pre-filtered tables.
//!
//! Columns are matched by header name. The header set must equal the
//! expected set exactly; column order is free.

use crate::error::{DefectEvalError, Result};
use crate::stats::PipelineStats;
use crate::types::{DetectionBox, GroundTruthBox, RankedDetection};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{info, warn};

/// Columns of a ground-truth table.
pub const GROUND_TRUTH_COLUMNS: [&str; 8] = [
    "center_x", "center_y", "length", "width", "image_id", "label_id", "area", "box_id",
];

/// Columns of a detector-output table.
pub const PREDICTION_COLUMNS: [&str; 9] = [
    "center_x",
    "center_y",
    "length",
    "width",
    "image_id",
    "label_id",
    "area",
    "box_id",
    "confidence",
];

/// Columns of an externally filtered final table. Area and box ids are
/// recomputed, so neither is part of the contract.
pub const FILTERED_COLUMNS: [&str; 8] = [
    "center_x",
    "center_y",
    "length",
    "width",
    "image_id",
    "label_id",
    "confidence",
    "label_index",
];

#[derive(Debug, Deserialize)]
struct GroundTruthRecord {
    center_x: f64,
    center_y: f64,
    length: f64,
    width: f64,
    image_id: u64,
    label_id: u64,
    area: f64,
    box_id: u64,
}

#[derive(Debug, Deserialize)]
struct PredictionRecord {
    center_x: f64,
    center_y: f64,
    length: f64,
    width: f64,
    image_id: u64,
    label_id: u64,
    area: f64,
    box_id: u64,
    confidence: f64,
}

#[derive(Debug, Deserialize)]
struct FilteredRecord {
    center_x: f64,
    center_y: f64,
    length: f64,
    width: f64,
    image_id: u64,
    label_id: u64,
    confidence: f64,
    label_index: u32,
}

/// Fail unless the header set equals `expected`.
pub fn validate_columns<'h>(table: &str, headers: impl IntoIterator<Item = &'h str>, expected: &[&str]) -> Result<()> {
    let found: BTreeSet<&str> = headers.into_iter().map(str::trim).collect();
    let expected: BTreeSet<&str> = expected.iter().copied().collect();

    let missing: Vec<String> = expected.difference(&found).map(|c| (*c).to_string()).collect();
    if !missing.is_empty() {
        return Err(DefectEvalError::MissingColumns {
            table: table.to_string(),
            columns: missing,
        });
    }
    let unexpected: Vec<String> = found.difference(&expected).map(|c| (*c).to_string()).collect();
    if !unexpected.is_empty() {
        return Err(DefectEvalError::UnexpectedColumns {
            table: table.to_string(),
            columns: unexpected,
        });
    }
    Ok(())
}

fn read_records<R: Read, T: DeserializeOwned>(table: &str, reader: R, expected: &[&str]) -> Result<Vec<T>> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    validate_columns(table, reader.headers()?.iter(), expected)?;
    reader
        .deserialize()
        .map(|record| record.map_err(DefectEvalError::from))
        .collect()
}

fn open<P: AsRef<Path>>(path: P) -> Result<BufReader<File>> {
    Ok(BufReader::new(File::open(path)?))
}

/// Read ground-truth boxes, keeping the stored area of every row.
pub fn read_ground_truth<R: Read>(reader: R, stats: &mut PipelineStats) -> Result<Vec<GroundTruthBox>> {
    let records: Vec<GroundTruthRecord> = read_records("ground truth", reader, &GROUND_TRUTH_COLUMNS)?;
    let boxes: Vec<GroundTruthBox> = records
        .into_iter()
        .map(|r| {
            let mut gt = GroundTruthBox::new(r.image_id, r.label_id, r.center_x, r.center_y, r.length, r.width, r.box_id);
            gt.area = r.area;
            gt
        })
        .collect();
    stats.ground_truth_boxes = boxes.len();
    info!(rows = boxes.len(), "loaded ground truth");
    Ok(boxes)
}

/// Load ground-truth boxes from a CSV file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, a column is missing or
/// unexpected, or a value does not parse.
///
/// # Example
///
/// ```no_run
/// use defect_eval::loader::load_ground_truth;
/// use defect_eval::stats::PipelineStats;
///
/// let mut stats = PipelineStats::new();
/// let gt = load_ground_truth("gt.csv", &mut stats).unwrap();
/// println!("Loaded {} annotations", gt.len());
/// ```
pub fn load_ground_truth<P: AsRef<Path>>(path: P, stats: &mut PipelineStats) -> Result<Vec<GroundTruthBox>> {
    read_ground_truth(open(path)?, stats)
}

/// Read detector output. Rows with a non-positive area are dropped.
///
/// # Example
///
/// ```
/// use defect_eval::loader::read_predictions;
/// use defect_eval::stats::PipelineStats;
///
/// let csv = "image_id,label_id,confidence,center_x,center_y,length,width,area,box_id\n\
///            1,0,0.9,0.5,0.5,0.1,0.1,0.01,1\n\
///            1,0,0.8,0.5,0.5,0.0,0.1,0.0,2\n";
/// let mut stats = PipelineStats::new();
/// let rows = read_predictions(csv.as_bytes(), &mut stats).unwrap();
/// assert_eq!(rows.len(), 1);
/// assert_eq!(stats.dropped_zero_area, 1);
/// ```
pub fn read_predictions<R: Read>(reader: R, stats: &mut PipelineStats) -> Result<Vec<DetectionBox>> {
    let records: Vec<PredictionRecord> = read_records("predictions", reader, &PREDICTION_COLUMNS)?;
    stats.loaded_predictions = records.len();

    let mut boxes = Vec::with_capacity(records.len());
    for r in records {
        if r.area <= 0.0 {
            stats.drop_zero_area();
            continue;
        }
        boxes.push(
            DetectionBox::new(r.image_id, r.label_id, r.confidence, r.center_x, r.center_y, r.length, r.width, r.box_id)
                .with_area(r.area),
        );
    }
    if stats.dropped_zero_area > 0 {
        warn!(dropped = stats.dropped_zero_area, "dropped predictions with non-positive area");
    }
    info!(rows = boxes.len(), "loaded predictions");
    Ok(boxes)
}

pub fn load_predictions<P: AsRef<Path>>(path: P, stats: &mut PipelineStats) -> Result<Vec<DetectionBox>> {
    read_predictions(open(path)?, stats)
}

/// Read final rows produced outside the pipeline.
///
/// Box ids and areas are left at placeholder values; the ratio-only report
/// recomputes both.
pub fn read_filtered<R: Read>(reader: R) -> Result<Vec<RankedDetection>> {
    let records: Vec<FilteredRecord> = read_records("filtered predictions", reader, &FILTERED_COLUMNS)?;
    Ok(records
        .into_iter()
        .enumerate()
        .map(|(row_id, r)| RankedDetection {
            row_id,
            label_index: r.label_index,
            detection: DetectionBox::new(r.image_id, r.label_id, r.confidence, r.center_x, r.center_y, r.length, r.width, 0),
        })
        .collect())
}

pub fn load_filtered<P: AsRef<Path>>(path: P) -> Result<Vec<RankedDetection>> {
    read_filtered(open(path)?)
}
