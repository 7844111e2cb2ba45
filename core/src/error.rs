//! Engine errors. Business dead ends (no match, duplicate ref,
//! exhausted retries) are not errors: they are recorded on the owning
//! slip or task as statuses and failure reasons, never thrown away.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    #[error("Blob store unavailable: {0}")]
    StorageUnavailable(String),

    #[error("A {kind} reconciliation run is already active")]
    RunAlreadyActive { kind: String },

    #[error("Payment {payment_id} was modified concurrently (expected version {expected})")]
    VersionConflict { payment_id: String, expected: i64 },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
