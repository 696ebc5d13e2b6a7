//! # Offline Sync Core
//!
//! An offline-first data layer for a study application: reference content
//! (verses) and user data (notes, settings) stay usable without a network,
//! and user changes made offline are replayed against the REST API once the
//! device reconnects. Built on LMDB for durable local storage.
//!
//! ## Features
//!
//! - **LMDB-based storage**: one named database per collection plus one per
//!   secondary index, with atomic multi-collection batches
//! - **Cache-first reads** for reference content, **network-first reads** for
//!   user data with a stale local fallback
//! - **Queued writes**: failed or offline mutations are persisted with an
//!   optimistic local copy and replayed in timestamp order
//! - **Bounded network calls**: every request is cancelled after the
//!   configured timeout and treated like being offline
//! - **Observable status**: pending count, online and syncing flags pushed over
//!   a watch channel, plus user-facing notifications
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use offline_sync_core::{NoAuth, OfflineCore, SyncConfig};
//!
//! # async fn run() -> Result<(), offline_sync_core::AppError> {
//! let config = SyncConfig::load("offline_sync.toml")?.with_env_overrides();
//! let core = OfflineCore::open(config, Arc::new(NoAuth), true)?;
//! core.init();
//!
//! let verse = core.get_verse("John 3:16").await?;
//! println!("{} from {:?}", verse.data, verse.source);
//!
//! let saved = core.save_note("john-3-16", "For God so loved...", None).await?;
//! if saved.pending {
//!     println!("queued, will sync when back online");
//! }
//! # Ok(())
//! # }
//! ```

pub mod app_error;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod local_db_model;
pub mod local_db_state;
pub mod mutation_queue;
pub mod read_strategy;
pub mod remote;
pub mod sync_manager;
pub mod sync_status;

use std::sync::Arc;

use log::info;
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

pub use crate::app_error::{AppError, AppResult};
pub use crate::config::SyncConfig;
pub use crate::connectivity::Connectivity;
pub use crate::context::CoreContext;
pub use crate::local_db_model::{Collection, HttpMethod, MutationOptions, SyncQueueEntry};
pub use crate::local_db_state::{LmdbStore, LocalStore, StoreOp};
pub use crate::mutation_queue::MutationOutcome;
pub use crate::read_strategy::{DataSource, ReadResult};
pub use crate::remote::{HttpRemote, NoAuth, RemoteApi, RemoteRequest, TokenProvider};
pub use crate::sync_manager::{SyncItemError, SyncManager, SyncOutcome, SyncSummary};
pub use crate::sync_status::{NoticeLevel, SyncNotice, SyncStatus};

/// Key of the single settings record.
pub const USER_SETTINGS_KEY: &str = "user-settings";

/// Entry point for UI collaborators. Owns the shared context and the sync
/// manager; build one per process and call [`init`](Self::init) once a tokio
/// runtime is running.
pub struct OfflineCore {
    ctx: CoreContext,
    sync: SyncManager,
}

impl OfflineCore {
    /// Opens the LMDB store at `config.db_path` and talks to `config.api_url`.
    pub fn open(
        config: SyncConfig,
        tokens: Arc<dyn TokenProvider>,
        initially_online: bool,
    ) -> AppResult<Self> {
        config.validate()?;
        let store = LmdbStore::open(&config.db_path, config.map_size_mb)?;
        let remote = HttpRemote::new(config.api_url.clone(), config.request_timeout(), tokens)?;
        info!("Offline core opened at {}", config.db_path.display());

        Ok(Self::from_parts(
            Arc::new(store),
            Arc::new(remote),
            Connectivity::new(initially_online),
            &config,
        ))
    }

    /// Builds a core from ready-made parts. `config` is not validated here; a
    /// periodic interval below one second is raised to one second.
    pub fn from_parts(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteApi>,
        connectivity: Connectivity,
        config: &SyncConfig,
    ) -> Self {
        let ctx = CoreContext::new(store, remote, connectivity, config);
        let sync = SyncManager::new(ctx.clone(), config);
        Self { ctx, sync }
    }

    pub fn context(&self) -> &CoreContext {
        &self.ctx
    }

    pub fn sync_manager(&self) -> &SyncManager {
        &self.sync
    }

    /// Handle the host uses to report online/offline transitions.
    pub fn connectivity(&self) -> &Connectivity {
        &self.ctx.connectivity
    }

    pub fn init(&self) {
        self.sync.init();
    }

    /// Stops background syncing. Pending mutations stay queued on disk.
    pub fn shutdown(&self) {
        self.sync.teardown();
    }

    // Reads

    pub async fn get_bible_content(&self, endpoint: &str, cache_key: &str) -> AppResult<ReadResult> {
        read_strategy::cache_first(&self.ctx, endpoint, cache_key).await
    }

    /// `reference` is a human reference such as `"John 3:16"`.
    pub async fn get_verse(&self, reference: &str) -> AppResult<ReadResult> {
        let key = verse_cache_key(reference);
        self.get_bible_content(&format!("/verses/{reference}"), &key).await
    }

    pub async fn get_verses_by_book(&self, book: &str) -> AppResult<ReadResult> {
        read_strategy::cache_first_by_index(&self.ctx, "book", book, &format!("/verses/book/{book}")).await
    }

    pub async fn get_user_data(
        &self,
        endpoint: &str,
        collection: Collection,
        cache_key: &str,
    ) -> AppResult<ReadResult> {
        read_strategy::network_first(&self.ctx, endpoint, collection, cache_key).await
    }

    pub async fn get_study_notes(&self, verse_id: &str) -> AppResult<ReadResult> {
        self.get_user_data(&format!("/notes/{verse_id}"), Collection::StudyNotes, verse_id)
            .await
    }

    pub async fn get_user_settings(&self) -> AppResult<ReadResult> {
        self.get_user_data("/settings", Collection::UserSettings, USER_SETTINGS_KEY)
            .await
    }

    /// Drops cached content older than the configured TTL.
    pub fn evict_expired_content(&self) -> AppResult<usize> {
        read_strategy::evict_expired_content(&self.ctx, local_db_model::now_millis())
    }

    // Writes

    pub async fn mutate(
        &self,
        endpoint: &str,
        method: HttpMethod,
        data: JsonValue,
        options: MutationOptions,
    ) -> AppResult<MutationOutcome> {
        mutation_queue::mutate(&self.ctx, endpoint, method, data, options).await
    }

    /// Creates a note, or updates it when `note_id` is given. A new note is
    /// stored locally under a generated `note-...` key until the server
    /// confirms it.
    pub async fn save_note(
        &self,
        verse_id: &str,
        content: &str,
        note_id: Option<&str>,
    ) -> AppResult<MutationOutcome> {
        let data = json!({ "verseId": verse_id, "content": content });
        match note_id {
            Some(id) => {
                self.mutate(
                    &format!("/notes/{id}"),
                    HttpMethod::Put,
                    data,
                    MutationOptions::for_store(Collection::StudyNotes, id),
                )
                .await
            }
            None => {
                let key = format!("note-{}", Uuid::now_v7());
                self.mutate(
                    "/notes",
                    HttpMethod::Post,
                    data,
                    MutationOptions::for_store(Collection::StudyNotes, key),
                )
                .await
            }
        }
    }

    pub async fn delete_note(&self, note_id: &str) -> AppResult<MutationOutcome> {
        self.mutate(
            &format!("/notes/{note_id}"),
            HttpMethod::Delete,
            JsonValue::Null,
            MutationOptions::for_store(Collection::StudyNotes, note_id),
        )
        .await
    }

    /// Settings updates replace each other in the queue; only the latest one
    /// is replayed.
    pub async fn update_settings(&self, settings: JsonValue) -> AppResult<MutationOutcome> {
        self.mutate(
            "/settings",
            HttpMethod::Put,
            settings,
            MutationOptions::for_store(Collection::UserSettings, USER_SETTINGS_KEY)
                .with_idempotency_key(USER_SETTINGS_KEY),
        )
        .await
    }

    // Sync and status

    pub async fn trigger_manual_sync(&self) -> SyncOutcome {
        self.sync.trigger_manual_sync().await
    }

    pub fn get_sync_status(&self) -> SyncStatus {
        self.sync.get_status()
    }

    pub fn subscribe_status(&self) -> tokio::sync::watch::Receiver<SyncStatus> {
        self.sync.subscribe_status()
    }

    pub fn subscribe_notifications(&self) -> tokio::sync::broadcast::Receiver<SyncNotice> {
        self.sync.subscribe_notifications()
    }

    pub fn clear_sync_queue(&self) -> AppResult<usize> {
        self.sync.clear_sync_queue()
    }
}

/// `"John 3:16"` -> `"verse-john-3:16"`. Every whitespace run becomes one
/// `-`, including leading and trailing runs.
pub fn verse_cache_key(reference: &str) -> String {
    let mut key = String::from("verse-");
    let mut in_whitespace = false;
    for c in reference.chars() {
        if c.is_whitespace() {
            if !in_whitespace {
                key.push('-');
            }
            in_whitespace = true;
        } else {
            key.extend(c.to_lowercase());
            in_whitespace = false;
        }
    }
    key
}
