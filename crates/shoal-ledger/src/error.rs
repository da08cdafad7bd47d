//! error types for the canonical accumulator
//!
//! every variant is returned before any state is touched, so a failed call
//! leaves the accumulator exactly as it was.

use shoal_core::Felt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// malformed commitment, nullifier or proof shape
    #[error("validation error: {0}")]
    Validation(String),

    #[error("nullifier already spent: {0}")]
    DoubleSpend(Felt),

    #[error("invalid proof: {0}")]
    InvalidProof(String),

    /// proof built against a root outside the acceptance window
    #[error("stale root: {0}")]
    StaleRoot(Felt),

    #[error("commitment tree full ({capacity} leaves)")]
    TreeFull { capacity: u64 },
}

impl LedgerError {
    /// a client may succeed by re-fetching a proof and resubmitting
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::StaleRoot(_))
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
