//! Application-level error type shared across the binary, actions, and
//! worker runtime.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::AppConfigError;
use crate::jobs::JobError;
use crate::paths::PathError;
use crate::queue::JobQueueError;
use crate::services::blob_store::BlobError;
use crate::services::di_client::DiError;
use crate::services::llm_client::LlmError;
use crate::store::LedgerStoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] AppConfigError),
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error(transparent)]
    Store(#[from] LedgerStoreError),
    #[error(transparent)]
    Queue(#[from] JobQueueError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Analysis(#[from] DiError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("failed to read input file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{0}")]
    Internal(String),
}
