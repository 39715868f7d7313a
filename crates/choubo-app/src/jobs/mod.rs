//! Queued pipeline jobs. Each job is re-runnable: a status guard at the top
//! turns duplicate deliveries into no-ops, and any error surfaces to the
//! queue for backoff and retry.

pub mod document_parse;
pub mod invoice_validate;
pub mod journal_suggest;

use thiserror::Error;

use crate::queue::JobQueueError;
use crate::services::blob_store::BlobError;
use crate::services::di_client::DiError;
use crate::services::llm_client::LlmError;
use crate::store::LedgerStoreError;

#[derive(Debug, Error)]
pub enum JobError {
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
    #[error("document `{0}` not found")]
    DocumentNotFound(String),
    #[error("document `{0}` has no extraction record")]
    MissingExtraction(String),
    #[error("{0}")]
    Invalid(String),
}
