//! Application configuration loaded from the environment.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::downloader::DownloadServiceConfig;
use crate::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:hls-offline.db?mode=rwc";

/// Settings for the binary and for embedding applications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    /// Directory for rolling log files. Console only when unset.
    pub log_dir: Option<PathBuf>,
    /// Filter directive used when `RUST_LOG` is not set.
    pub log_filter: Option<String>,
    pub downloads: DownloadServiceConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            log_dir: None,
            log_filter: None,
            downloads: DownloadServiceConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from the process environment, after reading `.env` if present.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `DATABASE_URL` | `database_url` |
    /// | `HLS_OFFLINE_DOWNLOAD_DIR` | `downloads.worker.download_dir` |
    /// | `HLS_OFFLINE_LOG_DIR` | `log_dir` |
    /// | `HLS_OFFLINE_LOG_FILTER` | `log_filter` |
    /// | `HLS_OFFLINE_POLL_INTERVAL_MS` | `downloads.worker.poll_interval_ms` |
    /// | `HLS_OFFLINE_MAX_CONCURRENT` | `downloads.max_concurrent_downloads` |
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source. Unset variables keep defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(url) = get("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(dir) = get("HLS_OFFLINE_DOWNLOAD_DIR") {
            config.downloads.worker.download_dir = PathBuf::from(dir);
        }
        config.log_dir = get("HLS_OFFLINE_LOG_DIR").map(PathBuf::from);
        config.log_filter = get("HLS_OFFLINE_LOG_FILTER");

        if let Some(value) = get("HLS_OFFLINE_POLL_INTERVAL_MS") {
            config.downloads.worker.poll_interval_ms =
                parse_number("HLS_OFFLINE_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = get("HLS_OFFLINE_MAX_CONCURRENT") {
            config.downloads.max_concurrent_downloads =
                parse_number("HLS_OFFLINE_MAX_CONCURRENT", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.downloads.worker.poll_interval_ms == 0 {
            return Err(Error::config("poll interval must be greater than zero"));
        }
        if self.downloads.max_concurrent_downloads == 0 {
            return Err(Error::config("max concurrent downloads must be at least 1"));
        }
        Ok(())
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("{key} must be a non-negative integer, got `{value}`")))
}
