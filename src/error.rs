//! Crate-wide error type.

use thiserror::Error;

/// Errors surfaced by configuration, training, and persistence.
#[derive(Debug, Error)]
pub enum CaeError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("failed to save model: {0}")]
    SaveFailed(String),

    #[error("failed to load model: {0}")]
    LoadFailed(String),

    #[error("failed to load dataset: {0}")]
    DataLoadFailed(String),

    #[error("tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
