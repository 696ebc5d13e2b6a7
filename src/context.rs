use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;

use crate::app_error::AppResult;
use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::remote::{send_with_timeout, RemoteApi, RemoteRequest};
use crate::sync_status::StatusHub;
use crate::local_db_state::LocalStore;

/// Everything the strategies and the sync manager share. Cloning is cheap.
#[derive(Clone)]
pub struct CoreContext {
    pub store: Arc<dyn LocalStore>,
    pub remote: Arc<dyn RemoteApi>,
    pub connectivity: Connectivity,
    pub status: Arc<StatusHub>,
    pub request_timeout: Duration,
    pub content_ttl: Option<Duration>,
}

impl CoreContext {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteApi>,
        connectivity: Connectivity,
        config: &SyncConfig,
    ) -> Self {
        Self {
            store,
            remote,
            connectivity,
            status: Arc::new(StatusHub::new()),
            request_timeout: config.request_timeout(),
            content_ttl: config.content_ttl(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Bounded remote call.
    pub async fn fetch(&self, request: RemoteRequest) -> AppResult<JsonValue> {
        send_with_timeout(self.remote.as_ref(), request, self.request_timeout).await
    }

    /// Pushes a fresh status snapshot (pending count, online flag).
    pub fn refresh_status(&self) {
        self.status.refresh(self.store.as_ref(), &self.connectivity);
    }
}
