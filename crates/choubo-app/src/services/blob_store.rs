//! File-blob storage behind a trait so the pipeline can run against local
//! disk in production and tests alike.

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::paths::{AppPaths, PathError};

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("blob io error for {bucket}/{key}: {source}")]
    Io {
        bucket: String,
        key: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError>;
    async fn upload(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), BlobError>;
    async fn remove(&self, bucket: &str, key: &str) -> Result<(), BlobError>;
}

/// Local-filesystem blob store rooted under the app data directory.
pub struct FsBlobStore {
    paths: AppPaths,
}

impl FsBlobStore {
    pub fn new(paths: AppPaths) -> Self {
        Self { paths }
    }
}

fn io_err(bucket: &str, key: &str, source: std::io::Error) -> BlobError {
    BlobError::Io {
        bucket: bucket.to_string(),
        key: key.to_string(),
        source,
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.paths.blob_path(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            Err(err) => Err(io_err(bucket, key, err)),
        }
    }

    async fn upload(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), BlobError> {
        let path = self.paths.blob_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| io_err(bucket, key, err))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|err| io_err(bucket, key, err))?;
        debug!(bucket, key, bytes = bytes.len(), "stored blob");
        Ok(())
    }

    async fn remove(&self, bucket: &str, key: &str) -> Result<(), BlobError> {
        let path = self.paths.blob_path(bucket, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(bucket, key, err)),
        }
    }
}
