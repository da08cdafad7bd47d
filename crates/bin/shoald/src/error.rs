use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShoaldError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("ledger RPC error: {0}")]
    Rpc(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// mirror is behind, reconciling or halted; retry later
    #[error("temporarily unavailable: {0}")]
    TemporarilyUnavailable(String),

    /// a missing event did not arrive within the gap timeout
    #[error("sync gap: waiting for index {expected}, buffered up to {buffered}")]
    SyncGap { expected: u64, buffered: u64 },

    #[error("reorg detected at index {0}")]
    ReorgDetected(u64),

    #[error("reorg deeper than {max_depth} blocks")]
    ReorgTooDeep { max_depth: u64 },

    #[error("root mismatch at index {index}: expected {expected}, computed {computed}")]
    RootMismatch {
        index: u64,
        expected: String,
        computed: String,
    },

    #[error("syncer halted: {0}")]
    Halted(String),

    /// fetches kept failing after every retry
    #[error("ledger unreachable: {0}")]
    LedgerUnreachable(String),

    #[error("core error: {0}")]
    Core(#[from] shoal_core::CoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ShoaldError>;

impl From<sled::Error> for ShoaldError {
    fn from(err: sled::Error) -> Self {
        ShoaldError::Storage(format!("sled: {}", err))
    }
}

impl From<bincode::Error> for ShoaldError {
    fn from(err: bincode::Error) -> Self {
        ShoaldError::Serialization(err.to_string())
    }
}

impl ShoaldError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ShoaldError::Validation(_) | ShoaldError::Core(_) => StatusCode::BAD_REQUEST,
            ShoaldError::NotFound(_) => StatusCode::NOT_FOUND,
            ShoaldError::TemporarilyUnavailable(_)
            | ShoaldError::SyncGap { .. }
            | ShoaldError::ReorgDetected(_)
            | ShoaldError::Halted(_)
            | ShoaldError::LedgerUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ShoaldError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
