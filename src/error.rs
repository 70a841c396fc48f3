// src/error.rs
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by dataset loading, checkpoint I/O and measure computation.
#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),
    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("dataset {path}: {reason}")]
    Dataset { path: PathBuf, reason: String },
    #[error("checkpoint: {0}")]
    Checkpoint(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("measure: {0}")]
    Measure(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn dataset(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Dataset {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
