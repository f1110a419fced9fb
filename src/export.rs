//! CSV and JSON writers for stage rows, reports and thresholds.

use crate::error::Result;
use crate::metrics::calculator::MetricRow;
use crate::metrics::image::ImageMetrics;
use crate::pipeline::{PipelineRun, StageOutputs};
use crate::threshold::{ThresholdConfig, ThresholdSet};
use crate::types::{DetectionBox, RankedDetection, Stage};
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// File name of the exported stage-1 thresholds.
pub const STAGE1_THRESHOLDS_FILE: &str = "op2p_parameters.json";

/// File name of the exported stage-2 thresholds.
pub const STAGE2_THRESHOLDS_FILE: &str = "pmbdb2pmbdbdl_parameters.json";

pub const REPORT_FILE: &str = "ratio_report.csv";

pub const IMAGE_METRICS_FILE: &str = "image_metrics.csv";

#[derive(Debug, Serialize)]
struct DetectionRecord {
    image_id: u64,
    box_id: u64,
    label_id: u64,
    confidence: f64,
    center_x: f64,
    center_y: f64,
    length: f64,
    width: f64,
    area: f64,
}

impl From<&DetectionBox> for DetectionRecord {
    fn from(b: &DetectionBox) -> Self {
        Self {
            image_id: b.image_id,
            box_id: b.box_id,
            label_id: b.label_id,
            confidence: b.confidence,
            center_x: b.center_x,
            center_y: b.center_y,
            length: b.length,
            width: b.width,
            area: b.area,
        }
    }
}

#[derive(Debug, Serialize)]
struct RankedRecord {
    id: usize,
    image_id: u64,
    box_id: u64,
    label_id: u64,
    label_index: u32,
    confidence: f64,
    center_x: f64,
    center_y: f64,
    length: f64,
    width: f64,
    area: f64,
}

impl From<&RankedDetection> for RankedRecord {
    fn from(r: &RankedDetection) -> Self {
        let b = &r.detection;
        Self {
            id: r.row_id,
            image_id: b.image_id,
            box_id: b.box_id,
            label_id: b.label_id,
            label_index: r.label_index,
            confidence: b.confidence,
            center_x: b.center_x,
            center_y: b.center_y,
            length: b.length,
            width: b.width,
            area: b.area,
        }
    }
}

fn write_records<W: Write, T: Serialize>(writer: W, records: impl IntoIterator<Item = T>) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_detections<W: Write>(writer: W, rows: &[DetectionBox]) -> Result<()> {
    write_records(writer, rows.iter().map(DetectionRecord::from))
}

/// Ranked rows also carry their sequence id and label rank.
pub fn write_ranked<W: Write>(writer: W, rows: &[RankedDetection]) -> Result<()> {
    write_records(writer, rows.iter().map(RankedRecord::from))
}

/// Report rows with rates as percent strings; an undefined rate is an empty cell.
pub fn write_report<W: Write>(writer: W, rows: &[MetricRow]) -> Result<()> {
    write_records(writer, rows)
}

pub fn write_image_metrics<W: Write>(writer: W, metrics: &ImageMetrics) -> Result<()> {
    write_records(writer, [metrics.to_row()])
}

fn create(dir: &Path, name: &str) -> Result<File> {
    Ok(File::create(dir.join(name))?)
}

/// Write every stage as `<STAGE>.csv` into `dir`.
pub fn export_stages<P: AsRef<Path>>(dir: P, outputs: &StageOutputs) -> Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    write_detections(create(dir, &format!("{}.csv", Stage::Op))?, &outputs.op)?;
    write_detections(create(dir, &format!("{}.csv", Stage::P))?, &outputs.p)?;
    write_detections(create(dir, &format!("{}.csv", Stage::Pmb))?, &outputs.pmb)?;
    write_ranked(create(dir, &format!("{}.csv", Stage::Pmbdb))?, &outputs.pmbdb)?;
    write_ranked(create(dir, &format!("{}.csv", Stage::Pmbdbdl))?, &outputs.pmbdbdl)?;
    info!(dir = %dir.display(), "exported stage rows");
    Ok(())
}

pub fn export_report<P: AsRef<Path>>(path: P, rows: &[MetricRow]) -> Result<()> {
    write_report(File::create(path)?, rows)
}

fn save_set(path: &Path, set: &ThresholdSet) -> Result<()> {
    fs::write(path, serde_json::to_string_pretty(set)?)?;
    Ok(())
}

/// Write the two threshold sets as separate documents, returning their paths.
pub fn export_thresholds<P: AsRef<Path>>(dir: P, thresholds: &ThresholdConfig) -> Result<(PathBuf, PathBuf)> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    let stage1 = dir.join(STAGE1_THRESHOLDS_FILE);
    let stage2 = dir.join(STAGE2_THRESHOLDS_FILE);
    save_set(&stage1, &thresholds.stage1)?;
    save_set(&stage2, &thresholds.stage2)?;
    info!(stage1 = %stage1.display(), stage2 = %stage2.display(), "exported thresholds");
    Ok((stage1, stage2))
}

/// Read back a pair written by [`export_thresholds`].
pub fn load_thresholds<P: AsRef<Path>>(dir: P) -> Result<ThresholdConfig> {
    let dir = dir.as_ref();
    let stage1: ThresholdSet = serde_json::from_str(&fs::read_to_string(dir.join(STAGE1_THRESHOLDS_FILE))?)?;
    let stage2: ThresholdSet = serde_json::from_str(&fs::read_to_string(dir.join(STAGE2_THRESHOLDS_FILE))?)?;
    stage1.validate()?;
    stage2.validate()?;
    Ok(ThresholdConfig::new(stage1, stage2))
}

/// Write thresholds, stage rows, report and (when given) image metrics of a run into `dir`.
pub fn export_run<P: AsRef<Path>>(dir: P, run: &PipelineRun, image_metrics: Option<&ImageMetrics>) -> Result<()> {
    let dir = dir.as_ref();
    export_thresholds(dir, &run.thresholds)?;
    export_stages(dir, &run.outputs)?;
    export_report(dir.join(REPORT_FILE), &run.report)?;
    if let Some(metrics) = image_metrics {
        write_image_metrics(create(dir, IMAGE_METRICS_FILE)?, metrics)?;
    }
    Ok(())
}
