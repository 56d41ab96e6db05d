//! Error types for checkpoint loading, pruning and saving.

use crate::formats::torch::pickle::PickleError;

/// Errors raised while reading, transforming or writing a checkpoint.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SafeTensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error("Zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Pickle error: {0}")]
    Pickle(#[from] PickleError),

    #[error("Unsupported dtype: {0:?}")]
    UnsupportedDtype(safetensors::Dtype),

    #[error("Buffer size mismatch for {dtype:?} tensor of shape {shape:?}: expected {expected} bytes, got {actual}")]
    BufferSize {
        dtype: safetensors::Dtype,
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("Storage '{key}' not found in checkpoint archive")]
    MissingStorage { key: String },

    #[error("Storage '{key}' too small: tensor needs {needed} bytes, storage has {available}")]
    StorageOutOfBounds {
        key: String,
        needed: usize,
        available: usize,
    },

    #[error("Storage '{key}' size overflows")]
    SizeOverflow { key: String },

    #[error("Checkpoint root is not a dictionary (found {0})")]
    NotADict(&'static str),

    #[error("Unrecognized checkpoint container: {0}")]
    UnknownContainer(String),
}

pub type Result<T> = std::result::Result<T, CheckpointError>;
