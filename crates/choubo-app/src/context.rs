//! Shared handles threaded through jobs, actions, and the worker loop.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::paths::AppPaths;
use crate::queue::JobQueueStore;
use crate::services::blob_store::{BlobStore, FsBlobStore};
use crate::services::di_client::{AzureDiClient, DocumentAnalysisClient};
use crate::services::llm_client::{AnthropicClient, LlmClient};
use crate::services::metrics::MetricsEmitter;
use crate::store::LedgerStore;

/// Everything a pipeline job needs. Cheap to clone; the stores and clients
/// are shared behind `Arc`.
#[derive(Clone)]
pub struct AppContext {
    pub config: AppConfig,
    pub paths: AppPaths,
    pub store: Arc<LedgerStore>,
    pub queue: Arc<JobQueueStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub di: Arc<dyn DocumentAnalysisClient>,
    pub llm: Arc<dyn LlmClient>,
    pub metrics: MetricsEmitter,
}

/// Wire up the production context: local stores plus the real provider
/// clients, which read their credentials from the environment.
pub fn build_app_context(config: AppConfig) -> Result<AppContext, AppError> {
    let paths = AppPaths::new(&config.storage.path)?;
    let store = Arc::new(LedgerStore::open(&paths)?);
    let queue = Arc::new(JobQueueStore::open(&paths)?);
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(paths.clone()));
    let di: Arc<dyn DocumentAnalysisClient> = Arc::new(AzureDiClient::from_env()?);
    let llm: Arc<dyn LlmClient> = Arc::new(AnthropicClient::from_env()?);
    Ok(AppContext {
        config,
        paths,
        store,
        queue,
        blobs,
        di,
        llm,
        metrics: MetricsEmitter::default(),
    })
}
