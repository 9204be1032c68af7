//! Downloader defaults and their environment overrides.

use std::path::PathBuf;
use std::time::Duration;

use crate::models::{
    Job, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_WORKERS, DEFAULT_RETRY_BACKOFF, DEFAULT_RETRY_LIMIT,
};

pub const DEFAULT_ENDPOINT: &str = "https://modelscope.cn";
/// Longest silence tolerated from the content host before a transfer is retried.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const STATUS_DIR_NAME: &str = ".modelscope_downloads";
pub const STATUS_DB_NAME: &str = "status.db";

pub const ENV_STATUS_DIR: &str = "MODELGET_STATUS_DIR";
pub const ENV_ENDPOINT: &str = "MODELGET_ENDPOINT";

#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Holds the status database and background-run logs.
    pub status_dir: PathBuf,
    pub endpoint: String,
    pub max_workers: usize,
    pub retry_limit: u32,
    pub chunk_size: u64,
    pub retry_backoff: Duration,
    pub idle_timeout: Duration,
    pub verify: bool,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            status_dir: home.join(STATUS_DIR_NAME),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            max_workers: DEFAULT_MAX_WORKERS,
            retry_limit: DEFAULT_RETRY_LIMIT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            verify: true,
        }
    }
}

impl DownloaderConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(dir) = lookup(ENV_STATUS_DIR).filter(|v| !v.trim().is_empty()) {
            config.status_dir = PathBuf::from(dir);
        }
        if let Some(endpoint) = lookup(ENV_ENDPOINT).filter(|v| !v.trim().is_empty()) {
            config.endpoint = endpoint.trim().to_string();
        }
        config
    }

    pub fn status_db_path(&self) -> PathBuf {
        self.status_dir.join(STATUS_DB_NAME)
    }

    /// Log file of a background run, e.g. "org/model" -> "org_model.log".
    pub fn log_path(&self, model_id: &str) -> PathBuf {
        self.status_dir
            .join(format!("{}.log", model_id.replace('/', "_")))
    }

    /// Advisory lock held by the process downloading `model_id`.
    pub fn lock_path(&self, model_id: &str) -> PathBuf {
        self.status_dir
            .join(format!("{}.lock", model_id.replace('/', "_")))
    }

    pub fn job(&self, model_id: &str, save_dir: impl Into<PathBuf>) -> Job {
        let mut job = Job::new(model_id, save_dir);
        job.max_workers = self.max_workers.max(1);
        job.retry_limit = self.retry_limit;
        job.chunk_size = self.chunk_size.max(1);
        job.retry_backoff = self.retry_backoff;
        job.verify = self.verify;
        job
    }
}
