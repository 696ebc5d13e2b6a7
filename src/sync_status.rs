//! Status surface consumed by UI collaborators.
//!
//! A [`SyncStatus`] is a read-only projection of the queue plus the online and
//! busy flags. [`StatusHub`] pushes a fresh snapshot whenever one of those
//! changes, and carries transient user notifications.

use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::connectivity::Connectivity;
use crate::local_db_model::{Collection, SyncQueueEntry};
use crate::local_db_state::LocalStore;

const NOTICE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub pending_count: usize,
    /// Queue entries, oldest first.
    pub items: Vec<SyncQueueEntry>,
    pub is_online: bool,
    pub is_syncing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncStatus {
    /// Reads the queue and combines it with the given flags. Never fails: a
    /// storage error yields zeroed defaults carrying the error text.
    pub fn read(store: &dyn LocalStore, is_online: bool, is_syncing: bool) -> Self {
        let records = match store.get_all(Collection::SyncQueue) {
            Ok(records) => records,
            Err(e) => {
                error!("Failed to get sync status: {e}");
                return Self {
                    error: Some(e.to_string()),
                    ..Self::default()
                };
            }
        };

        let mut items: Vec<SyncQueueEntry> = records
            .iter()
            .filter_map(|record| match SyncQueueEntry::from_record(record) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Unreadable sync queue record: {e}");
                    None
                }
            })
            .collect();
        items.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));

        Self {
            pending_count: records.len(),
            items,
            is_online,
            is_syncing,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// A transient, user-visible message ("Synced 3 item(s)", ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncNotice {
    pub level: NoticeLevel,
    pub message: String,
}

pub struct StatusHub {
    status: watch::Sender<SyncStatus>,
    notices: broadcast::Sender<SyncNotice>,
}

impl StatusHub {
    pub fn new() -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self { status, notices }
    }

    /// Last published snapshot.
    pub fn snapshot(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    /// Re-reads the queue and the online flag, keeping the busy flag of the
    /// previous snapshot.
    pub fn refresh(&self, store: &dyn LocalStore, connectivity: &Connectivity) {
        let syncing = self.status.borrow().is_syncing;
        self.publish(SyncStatus::read(store, connectivity.is_online(), syncing));
    }

    pub fn set_syncing(&self, store: &dyn LocalStore, connectivity: &Connectivity, syncing: bool) {
        self.publish(SyncStatus::read(store, connectivity.is_online(), syncing));
    }

    fn publish(&self, status: SyncStatus) {
        self.status.send_replace(status);
    }

    pub fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            NoticeLevel::Info => info!("📢 {message}"),
            NoticeLevel::Warning => warn!("📢 {message}"),
            NoticeLevel::Error => error!("📢 {message}"),
        }
        // no subscribers is fine
        let _ = self.notices.send(SyncNotice { level, message });
    }
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}
