//! Orchestration layer for IO-bound pipeline services.
//!
//! Modules exposed here coordinate external systems (blob storage, document
//! analysis, the LLM) plus the pure transforms the jobs run over their
//! output. Persistence lives in `crate::store` and `crate::queue`.

pub mod blob_store;
pub mod classifier;
pub mod di_client;
pub mod duplicate_check;
pub mod llm_client;
pub mod metrics;
pub mod structuring;

pub use blob_store::{BlobError, BlobStore, FsBlobStore};
pub use classifier::{ClassificationResult, classify};
pub use di_client::{
    AzureDiClient, DiAnalyzeResult, DiCurrency, DiError, DiField, DiModel, DocumentAnalysisClient,
};
pub use duplicate_check::{DuplicateSuspect, find_duplicates};
pub use llm_client::{AnthropicClient, LlmClient, LlmError, extract_json_object};
pub use metrics::MetricsEmitter;
pub use structuring::{
    LineItem, StructuredExtraction, TaxDetail, extract_registration_number,
    is_valid_registration_number, normalize_date_string, structure,
};
