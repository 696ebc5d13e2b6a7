use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app_error::{AppError, AppResult};

/// Environment variable overriding [`SyncConfig::api_url`].
pub const API_URL_ENV: &str = "OFFLINE_SYNC_API_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL every endpoint is appended to.
    pub api_url: String,

    /// Directory holding the LMDB environment.
    pub db_path: PathBuf,

    /// Bound applied to every network call.
    pub request_timeout_ms: u64,

    /// Background sync interval while online; `None` disables it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub periodic_sync_secs: Option<u64>,

    /// Age after which cached content is refreshed when online; `None` keeps
    /// content forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_ttl_secs: Option<u64>,

    /// Maximum size of the local store.
    pub map_size_mb: usize,

    /// How long a sync pass may hold the cross-instance lease.
    pub lease_ttl_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let db_path = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("offline_sync")
            .join("store.lmdb");

        Self {
            api_url: "http://localhost:8000/api".to_string(),
            db_path,
            request_timeout_ms: 5000,
            periodic_sync_secs: Some(300),
            content_ttl_secs: None,
            map_size_mb: 64,
            lease_ttl_ms: 60_000,
        }
    }
}

impl SyncConfig {
    pub fn from_toml_str(contents: &str) -> AppResult<Self> {
        let config: SyncConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads config from `path`, or returns the defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                self.api_url = url;
            }
        }
        self
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.api_url.trim().is_empty() {
            return Err(AppError::Config("api_url must not be empty".to_string()));
        }
        if self.request_timeout_ms == 0 {
            return Err(AppError::Config("request_timeout_ms must be positive".to_string()));
        }
        if self.periodic_sync_secs == Some(0) {
            return Err(AppError::Config("periodic_sync_secs must be positive".to_string()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn periodic_sync(&self) -> Option<Duration> {
        self.periodic_sync_secs.map(Duration::from_secs)
    }

    pub fn content_ttl(&self) -> Option<Duration> {
        self.content_ttl_secs.map(Duration::from_secs)
    }
}
