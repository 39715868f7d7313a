//! Filesystem path helpers (XDG-aware) for the LMDB environments and blob storage.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("unable to determine project directories")]
    MissingProjectDirs,
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid blob key `{key}`")]
    InvalidBlobKey { key: String },
}

/// Container providing filesystem paths for the application. In production this
/// is rooted at `$XDG_DATA_HOME/choubo`; tests construct instances over a
/// temporary directory.
#[derive(Debug, Clone)]
pub struct AppPaths {
    base_dir: PathBuf,
}

impl AppPaths {
    /// Construct paths rooted under `$XDG_DATA_HOME/choubo`.
    pub fn from_project_dirs() -> Result<Self, PathError> {
        let dirs =
            ProjectDirs::from("dev", "choubo", "choubo").ok_or(PathError::MissingProjectDirs)?;
        Self::new(dirs.data_dir())
    }

    /// Construct paths rooted under the provided directory, ensuring it exists.
    pub fn new<P: AsRef<Path>>(base: P) -> Result<Self, PathError> {
        let base = base.as_ref().to_path_buf();
        ensure_dir(&base)?;
        Ok(Self { base_dir: base })
    }

    /// Base data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.clone()
    }

    /// LMDB environment directory for the entity store (`.../lmdb/ledger`).
    pub fn ledger_lmdb_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["lmdb", "ledger"])
    }

    /// LMDB environment directory for the job queue (`.../lmdb/queue`).
    pub fn queue_lmdb_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["lmdb", "queue"])
    }

    /// Base directory for blob storage (`.../blobs`).
    pub fn blobs_base_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child(&["blobs"])
    }

    /// Directory for blobs belonging to a bucket (`.../blobs/{bucket}`).
    pub fn blobs_bucket_dir(&self, bucket: &str) -> Result<PathBuf, PathError> {
        let segments = vec!["blobs".to_string(), normalize_slug(bucket)];
        self.ensure_dynamic(&segments)
    }

    /// Full path for a blob identified by its key within a bucket. Keys may
    /// contain `/`-separated segments (tenant prefixes); empty segments,
    /// backslashes, and traversal components are rejected.
    pub fn blob_path(&self, bucket: &str, key: &str) -> Result<PathBuf, PathError> {
        let invalid = key.is_empty()
            || key.contains('\\')
            || key.split('/').any(|segment| segment.is_empty() || segment == "..");
        if invalid {
            return Err(PathError::InvalidBlobKey {
                key: key.to_owned(),
            });
        }
        let mut path = self.blobs_bucket_dir(bucket)?;
        for segment in key.split('/') {
            path.push(segment);
        }
        Ok(path)
    }

    fn ensure_child(&self, segments: &[&str]) -> Result<PathBuf, PathError> {
        let mut path = self.base_dir.clone();
        for segment in segments {
            path.push(segment);
        }
        ensure_dir(&path)?;
        Ok(path)
    }

    fn ensure_dynamic(&self, segments: &[String]) -> Result<PathBuf, PathError> {
        let mut path = self.base_dir.clone();
        for segment in segments {
            path.push(segment);
        }
        ensure_dir(&path)?;
        Ok(path)
    }
}

fn ensure_dir(path: &Path) -> Result<(), PathError> {
    fs::create_dir_all(path).map_err(|source| PathError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

fn normalize_slug(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
