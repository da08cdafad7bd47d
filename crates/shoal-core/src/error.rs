//! error types for shoal-core

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("field element out of range: {0}")]
    OutOfRange(String),

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("invalid merkle path: expected {expected} elements, got {actual}")]
    PathLength { expected: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, CoreError>;
