//! Error taxonomy shared by the store, the strategies and the sync manager.
//!
//! Read strategies surface these as `Err`. The write strategy only returns
//! `Err` for storage failures; every network-side failure is folded into a
//! queued [`MutationOutcome`](crate::mutation_queue::MutationOutcome).
//! Sync passes aggregate per-item failures instead of returning them.

use std::time::Duration;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AppError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Storage quota exceeded: {0}")]
    StorageQuotaExceeded(String),

    #[error("Request timeout after {} ms", .0.as_millis())]
    RequestTimeout(Duration),

    #[error("HTTP {status}: {reason}")]
    RemoteHttpError { status: u16, reason: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Content '{key}' not cached and device is offline")]
    ContentUnavailableOffline { key: String },

    #[error("No cached data available for '{key}' and device is offline")]
    NoCachedDataOffline { key: String },

    #[error("Failed to sync queue item {queue_id} ({endpoint}): {reason}")]
    SyncItemFailed {
        queue_id: u64,
        endpoint: String,
        reason: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// Timeouts and transport failures are handled exactly like being offline.
    pub fn is_offline_equivalent(&self) -> bool {
        matches!(self, AppError::RequestTimeout(_) | AppError::Network(_))
    }

    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            AppError::StorageUnavailable(_) | AppError::StorageQuotaExceeded(_)
        )
    }
}

impl From<lmdb::Error> for AppError {
    fn from(err: lmdb::Error) -> Self {
        match err {
            lmdb::Error::MapFull => AppError::StorageQuotaExceeded(format!("{err}")),
            other => AppError::StorageUnavailable(format!("LMDB error: {other}")),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(format!("JSON serialization error: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::StorageUnavailable(format!("IO error: {err}"))
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest does not expose the configured bound here
            return AppError::RequestTimeout(Duration::ZERO);
        }
        if let Some(status) = err.status() {
            return AppError::RemoteHttpError {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("").to_string(),
            };
        }
        if err.is_decode() {
            return AppError::Serialization(format!("Invalid response body: {err}"));
        }
        AppError::Network(err.to_string())
    }
}
