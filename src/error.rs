//! Error types for the defect-eval library.

use thiserror::Error;

/// Result type for defect-eval operations.
pub type Result<T> = std::result::Result<T, DefectEvalError>;

/// Error types that can occur while post-processing and evaluating detections.
#[derive(Error, Debug)]
pub enum DefectEvalError {
    /// Error during JSON parsing or serialization.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Error during I/O operations.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Error while reading or writing tabular data.
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    /// A table is missing required columns.
    #[error("Missing columns in {table}: {columns:?}")]
    MissingColumns { table: String, columns: Vec<String> },

    /// A table carries columns outside its contract.
    #[error("Unexpected columns in {table}: {columns:?}")]
    UnexpectedColumns { table: String, columns: Vec<String> },

    /// A search or merge hyperparameter is out of range.
    #[error("Invalid hyperparameter: {0}")]
    InvalidHyperParameter(String),

    /// A threshold record or document is malformed.
    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),

    /// White-list and black-list were both given, or neither was.
    #[error("Invalid label selection: {0}")]
    InvalidLabelSelection(String),

    /// The run configuration is incomplete or inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configured pass label is not part of the label map.
    #[error("Unknown pass label: {0}")]
    UnknownPassLabel(String),

    /// A row references a label id absent from the label map.
    #[error("Unknown label id: {0}")]
    UnknownLabelId(u64),

    /// A label name absent from the label map.
    #[error("Unknown label name: {0}")]
    UnknownLabelName(String),

    /// A run-once component was invoked a second time.
    #[error("{0} may only run once")]
    RanTwice(&'static str),

    /// Results were requested before the component ran.
    #[error("{0} has not run yet")]
    RanTooEarly(&'static str),

    /// Predicted and ground-truth data from different stages were paired.
    #[error("Stage mismatch: {0}")]
    StageMismatch(String),

    /// Nothing to evaluate.
    #[error("Empty dataset: {0}")]
    EmptyDataset(String),
}
