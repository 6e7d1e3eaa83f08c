use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("{path}: bad magic number {found:#010x}, expected {expected:#010x}")]
    BadMagic {
        path: PathBuf,
        expected: u32,
        found: u32,
    },
    #[error("{path}: truncated, expected {expected} bytes, found {found}")]
    Truncated {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
    #[error("{path}: corrupt header, {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("image and label counts differ: {images} images, {labels} labels")]
    CountMismatch { images: usize, labels: usize },
    #[error("malformed record on line {line}: expected {expected} fields, found {found}")]
    MalformedRecord {
        line: u64,
        expected: usize,
        found: usize,
    },
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("label {label} at index {index} is outside 0..{classes}")]
    LabelOutOfRange {
        index: usize,
        label: u8,
        classes: usize,
    },
    #[error("invalid layer configuration: {0}")]
    InvalidLayer(String),
    #[error("invalid initializer: {0}")]
    InvalidInitializer(String),
    #[error("batch size must be positive")]
    ZeroBatchSize,
    #[error("dataset is empty")]
    EmptyDataset,
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

pub type Result<T> = std::result::Result<T, Error>;
