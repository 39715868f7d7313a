//! Configuration loading and defaults.

use std::path::PathBuf;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

const CONFIG_FILE: &str = "config/settings";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub queue: QueueTuning,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub path: PathBuf,
}

/// Worker/queue tuning. Defaults follow the provider throughput ceilings the
/// pipeline was sized for: two heavy workers capped at 15 OCR submissions per
/// second, four light workers.
#[derive(Debug, Deserialize, Clone)]
pub struct QueueTuning {
    pub heavy_concurrency: usize,
    pub light_concurrency: usize,
    pub heavy_rate_per_sec: u32,
    pub poll_interval_ms: u64,
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let default_storage = default_storage_path()?;
    let builder = Config::builder()
        .set_default(
            "storage.path",
            default_storage.to_string_lossy().to_string(),
        )?
        .set_default("queue.heavy_concurrency", 2)?
        .set_default("queue.light_concurrency", 4)?
        .set_default("queue.heavy_rate_per_sec", 15)?
        .set_default("queue.poll_interval_ms", 500)?
        .add_source(File::with_name(CONFIG_FILE).required(false))
        .add_source(Environment::with_prefix("CHOUBO").separator("__"));

    let cfg = builder.build()?.try_deserialize()?;
    Ok(cfg)
}

pub fn project_dirs() -> Result<ProjectDirs, AppConfigError> {
    ProjectDirs::from("dev", "choubo", "choubo").ok_or(AppConfigError::MissingProjectDirs)
}

fn default_storage_path() -> Result<PathBuf, AppConfigError> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_queue_profiles() {
        let cfg = load().expect("config loads from defaults");
        assert_eq!(cfg.queue.heavy_concurrency, 2);
        assert_eq!(cfg.queue.light_concurrency, 4);
        assert_eq!(cfg.queue.heavy_rate_per_sec, 15);
    }
}
