use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("JSON error: {0}")]
    Json(#[from] json::Error),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Column '{0}' not found in table")]
    ColumnNotFound(String),

    #[error("Unable to parse '{value}' in column '{column}' (row {row})")]
    Parse {
        column: String,
        row: usize,
        value: String,
    },

    #[error("No observations found")]
    EmptyData,

    #[error("Genes have differing observation counts: gene {gene} has {got}, expected {expected}")]
    RaggedObservations {
        gene: usize,
        expected: usize,
        got: usize,
    },

    #[error("{kind} index {index} out of range 0..{bound} (row {row})")]
    IndexOutOfRange {
        kind: &'static str,
        index: i64,
        bound: usize,
        row: usize,
    },

    #[error("{kind} indices are not contiguous: index {missing} never observed")]
    NonContiguousIndex { kind: &'static str, missing: usize },

    #[error("Inconsistent metadata for {kind} '{key}': {detail}")]
    InconsistentMetadata {
        kind: &'static str,
        key: String,
        detail: String,
    },

    #[error("Baseline condition '{0}' not found")]
    MissingBaseline(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Parameter '{0}' not present in posterior draws")]
    MissingParameter(String),

    #[error("Shape mismatch for {context}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Parameter '{name}' has {got} axes, expected {expected}")]
    Dimensionality {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("Sampler error: {0}")]
    Sampler(String),

    #[error("Unknown file format for: {0}")]
    UnknownFormat(String),
}

pub type Result<T> = std::result::Result<T, Error>;
