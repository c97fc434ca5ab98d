use thiserror::Error;
use uuid::Uuid;

use crate::domain::ingestion::IngestionStatus;

#[derive(Error, Debug)]
pub enum RecastError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("ingestion not found: {0}")]
    IngestionNotFound(Uuid),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: IngestionStatus,
        to: IngestionStatus,
    },

    #[error("store error: {message}")]
    Store { message: String },
}

pub type Result<T> = std::result::Result<T, RecastError>;
