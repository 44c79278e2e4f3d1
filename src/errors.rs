//! Typed error handling for the qdq-fold library.
//!
//! All public API functions return [`Result<T>`](type@Result), which uses
//! [`FoldError`] as the error type. The CLI binary converts these into
//! `anyhow::Error` through the blanket `From<E: std::error::Error>` impl.

use std::fmt;
use std::path::PathBuf;

/// Result type alias used throughout the qdq-fold public API.
pub type Result<T> = std::result::Result<T, FoldError>;

/// Errors produced by the qdq-fold library.
#[derive(Debug)]
pub enum FoldError {
    /// Tensor payload that cannot be decoded (truncated raw data, wrong
    /// element type for the requested view, ...).
    InvalidTensor {
        /// Tensor name.
        name: String,
        /// What went wrong.
        reason: String,
    },

    /// A quantization parameter does not broadcast against the tensor it
    /// quantizes. Always fatal.
    ShapeMismatch {
        /// Name of the parameter being quantized.
        parameter: String,
        /// What went wrong.
        reason: String,
    },

    /// Failed to load an ONNX model from disk.
    ModelLoad {
        /// Path that was being loaded.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Failed to save an ONNX model to disk.
    ModelSave {
        /// Path that was being written.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// Malformed graph or unexpected operator shape found while matching or
    /// rewriting.
    GraphTransform {
        /// What went wrong.
        reason: String,
    },

    /// Configuration file parsing or validation error.
    Config {
        /// What went wrong.
        reason: String,
    },

    /// Top-level conversion failure. The model at `path` was left untouched.
    Conversion {
        /// Model that was being converted.
        path: PathBuf,
        /// Underlying cause.
        source: Box<FoldError>,
    },
}

impl FoldError {
    pub(crate) fn graph(reason: impl Into<String>) -> Self {
        FoldError::GraphTransform {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FoldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FoldError::InvalidTensor { name, reason } => {
                write!(f, "invalid tensor '{name}': {reason}")
            }
            FoldError::ShapeMismatch { parameter, reason } => {
                write!(f, "shape mismatch for '{parameter}': {reason}")
            }
            FoldError::ModelLoad { path, reason } => {
                write!(f, "failed to load model '{}': {reason}", path.display())
            }
            FoldError::ModelSave { path, reason } => {
                write!(f, "failed to save model '{}': {reason}", path.display())
            }
            FoldError::GraphTransform { reason } => {
                write!(f, "graph transform error: {reason}")
            }
            FoldError::Config { reason } => {
                write!(f, "config error: {reason}")
            }
            FoldError::Conversion { path, source } => {
                write!(
                    f,
                    "failed to convert '{}' to a deployable model: {source}",
                    path.display()
                )
            }
        }
    }
}

impl std::error::Error for FoldError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FoldError::Conversion { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}
