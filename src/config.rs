//! Run configuration loaded from a JSON document.
//!
//! ```json
//! {
//!   "label_id_name_dict": {"0": "DZ_CM", "1": "DZ_FM", "3": "DZ_PASS"},
//!   "gt_csv_path": "data/gt.csv",
//!   "op_csv_path": "data/op.csv",
//!   "export_dir": "out",
//!   "pass_label_name": "DZ_PASS"
//! }
//! ```
//!
//! Every other field falls back to its default.

use crate::error::{DefectEvalError, Result};
use crate::merger::MergeThresholds;
use crate::optimizer::OptimizerConfig;
use crate::types::LabelMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default margin of the pass override.
pub const DEFAULT_PASS_OVERRIDE_MIN: f64 = 0.75;

fn default_pass_override_min() -> f64 {
    DEFAULT_PASS_OVERRIDE_MIN
}

fn default_auto_optimize() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostProcessConfig {
    pub label_id_name_dict: LabelMap,
    pub gt_csv_path: PathBuf,
    pub op_csv_path: PathBuf,
    pub export_dir: PathBuf,
    #[serde(default)]
    pub pass_label_name: Option<String>,
    #[serde(default = "default_pass_override_min")]
    pub pass_override_min: f64,
    #[serde(default)]
    pub merge: MergeThresholds,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    /// Tune the derived thresholds before the final report.
    #[serde(default = "default_auto_optimize")]
    pub auto_optimize: bool,
}

impl PostProcessConfig {
    /// Parse and validate a configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Check paths, the pass label and every hyperparameter.
    ///
    /// An out-of-range `pass_override_min` is not an error: it disables the
    /// override at run time.
    pub fn validate(&self) -> Result<()> {
        let paths = [
            ("gt_csv_path", &self.gt_csv_path),
            ("op_csv_path", &self.op_csv_path),
            ("export_dir", &self.export_dir),
        ];
        for (key, path) in paths {
            if path.as_os_str().is_empty() {
                return Err(DefectEvalError::InvalidConfig(format!("{key} must not be empty")));
            }
        }
        if let Some(pass) = &self.pass_label_name {
            if !self.label_id_name_dict.contains_name(pass) {
                return Err(DefectEvalError::UnknownPassLabel(pass.clone()));
            }
        }
        self.merge.validate()?;
        self.optimizer.validate()
    }
}
