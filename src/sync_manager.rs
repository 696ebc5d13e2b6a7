//! Sync manager: drains the mutation queue against the remote API.
//!
//! One [`SyncManager`] is built at startup and shared by reference. It owns
//! the busy flag that keeps passes from overlapping, and the listener task
//! that reacts to connectivity changes and the periodic tick.
//!
//! A pass takes a snapshot of the queue, sorts it oldest-first and replays
//! entries one at a time. A confirmed entry is removed together with the
//! update of its local record in a single store transaction; a failed entry
//! stays queued at its original timestamp for the next pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

use crate::app_error::{AppError, AppResult};
use crate::config::SyncConfig;
use crate::context::CoreContext;
use crate::local_db_model::{encode_numeric_key, now_millis, Collection, SyncQueueEntry};
use crate::local_db_state::StoreOp;
use crate::mutation_queue::{confirmed_ops, Replayed};
use crate::remote::RemoteRequest;
use crate::sync_status::{NoticeLevel, SyncNotice, SyncStatus};

/// Name of the lease record guarding passes across instances sharing a store.
pub const SYNC_LEASE: &str = "sync";

const MIN_PERIODIC_SYNC: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncItemError {
    pub queue_id: u64,
    pub endpoint: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub processed: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<SyncItemError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The pass ran over the whole snapshot.
    Completed(SyncSummary),
    /// Another instance took over the lease mid-pass; the rest of the
    /// snapshot stays queued.
    Interrupted(SyncSummary),
    /// Another pass of this instance is in progress.
    AlreadyRunning,
    /// Another instance holds the sync lease.
    LeaseHeld,
    Offline,
    /// The queue could not be read; nothing was attempted.
    Failed(String),
}

impl SyncOutcome {
    pub fn message(&self) -> String {
        match self {
            SyncOutcome::Completed(summary) => format!(
                "Sync complete: {} synced, {} failed",
                summary.processed, summary.failed
            ),
            SyncOutcome::Interrupted(summary) => format!(
                "Sync interrupted: {} synced, {} failed",
                summary.processed, summary.failed
            ),
            SyncOutcome::AlreadyRunning => "Sync already running".to_string(),
            SyncOutcome::LeaseHeld => "Sync already running in another instance".to_string(),
            SyncOutcome::Offline => "Cannot sync while offline".to_string(),
            SyncOutcome::Failed(reason) => format!("Sync failed: {reason}"),
        }
    }

    pub fn summary(&self) -> Option<&SyncSummary> {
        match self {
            SyncOutcome::Completed(summary) | SyncOutcome::Interrupted(summary) => Some(summary),
            _ => None,
        }
    }
}

pub struct SyncManager {
    inner: Arc<SyncInner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

struct SyncInner {
    ctx: CoreContext,
    is_syncing: AtomicBool,
    initialized: AtomicBool,
    instance_id: String,
    lease_ttl_ms: i64,
    periodic: Option<Duration>,
}

/// Clears the busy flag when a pass ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncManager {
    pub fn new(ctx: CoreContext, config: &SyncConfig) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                ctx,
                is_syncing: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                instance_id: Uuid::now_v7().to_string(),
                lease_ttl_ms: config.lease_ttl_ms as i64,
                periodic: config.periodic_sync().map(|period| {
                    if period < MIN_PERIODIC_SYNC {
                        warn!("Periodic sync interval {period:?} raised to {MIN_PERIODIC_SYNC:?}");
                    }
                    period.max(MIN_PERIODIC_SYNC)
                }),
            }),
            listener: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &CoreContext {
        &self.inner.ctx
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.is_syncing.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::Acquire)
    }

    /// Subscribes to connectivity changes and, when online, starts a pass
    /// right away. Calling it again is a no-op. Must run inside a tokio
    /// runtime.
    pub fn init(&self) {
        if self.inner.initialized.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("🔄 Initializing sync manager ({})", self.inner.instance_id);

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(listen(inner));
        let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = listener.replace(handle) {
            previous.abort();
        }
    }

    /// Stops listening for connectivity changes. Queued work stays in the
    /// store for the next session.
    pub fn teardown(&self) {
        let handle = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            info!("🔄 Sync manager listener stopped");
        }
        self.inner.initialized.store(false, Ordering::Release);
    }

    /// Runs one pass over the current queue snapshot.
    pub async fn sync_data(&self) -> SyncOutcome {
        self.inner.sync_pass().await
    }

    /// User-initiated pass; reports the result as a notification.
    pub async fn trigger_manual_sync(&self) -> SyncOutcome {
        info!("🔄 Manual sync triggered by user");
        let status = &self.inner.ctx.status;

        if !self.inner.ctx.is_online() {
            status.notify(NoticeLevel::Warning, SyncOutcome::Offline.message());
            return SyncOutcome::Offline;
        }

        let outcome = self.sync_data().await;
        match &outcome {
            SyncOutcome::Completed(summary) if summary.processed > 0 => {
                status.notify(NoticeLevel::Info, format!("Synced {} item(s)", summary.processed))
            }
            SyncOutcome::Completed(summary) if summary.failed > 0 => status.notify(
                NoticeLevel::Warning,
                format!("Sync failed for {} item(s)", summary.failed),
            ),
            SyncOutcome::Completed(_) => status.notify(NoticeLevel::Info, "Nothing to sync"),
            SyncOutcome::Failed(_) => status.notify(NoticeLevel::Error, "Sync failed"),
            SyncOutcome::Interrupted(_) => status.notify(NoticeLevel::Warning, outcome.message()),
            other => status.notify(NoticeLevel::Info, other.message()),
        }
        outcome
    }

    /// Current snapshot: pending entries plus the online and busy flags.
    /// Safe before [`init`](Self::init); never fails.
    pub fn get_status(&self) -> SyncStatus {
        let ctx = &self.inner.ctx;
        SyncStatus::read(ctx.store.as_ref(), ctx.is_online(), self.is_syncing())
    }

    pub fn subscribe_status(&self) -> tokio::sync::watch::Receiver<SyncStatus> {
        self.inner.ctx.status.subscribe()
    }

    pub fn subscribe_notifications(&self) -> tokio::sync::broadcast::Receiver<SyncNotice> {
        self.inner.ctx.status.subscribe_notices()
    }

    /// Drops every pending mutation. Explicit user action only.
    pub fn clear_sync_queue(&self) -> AppResult<usize> {
        let ctx = &self.inner.ctx;
        let removed = ctx.store.clear(Collection::SyncQueue)?;
        info!("✓ Sync queue cleared by user ({removed} entries)");
        ctx.refresh_status();
        Ok(removed)
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        if let Some(handle) = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl SyncInner {
    async fn sync_pass(&self) -> SyncOutcome {
        if self
            .is_syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sync already running");
            return SyncOutcome::AlreadyRunning;
        }
        let busy = BusyGuard(&self.is_syncing);

        if !self.ctx.is_online() {
            return SyncOutcome::Offline;
        }

        let store = self.ctx.store.as_ref();
        match store.try_acquire_lease(SYNC_LEASE, &self.instance_id, now_millis(), self.lease_ttl_ms) {
            Ok(true) => {}
            Ok(false) => {
                info!("Sync lease held by another instance, skipping pass");
                return SyncOutcome::LeaseHeld;
            }
            Err(e) => {
                error!("Sync failed: {e}");
                return SyncOutcome::Failed(e.to_string());
            }
        }

        self.ctx.status.set_syncing(store, &self.ctx.connectivity, true);
        let outcome = self.drain().await;

        if let Err(e) = store.release_lease(SYNC_LEASE, &self.instance_id) {
            warn!("Failed to release sync lease: {e}");
        }
        drop(busy);
        self.ctx.status.set_syncing(store, &self.ctx.connectivity, false);
        outcome
    }

    async fn drain(&self) -> SyncOutcome {
        let store = self.ctx.store.as_ref();
        let records = match store.get_all(Collection::SyncQueue) {
            Ok(records) => records,
            Err(e) => {
                error!("Sync failed: {e}");
                return SyncOutcome::Failed(e.to_string());
            }
        };
        if records.is_empty() {
            return SyncOutcome::Completed(SyncSummary::default());
        }

        let mut summary = SyncSummary::default();
        let mut entries = Vec::with_capacity(records.len());
        for record in &records {
            match SyncQueueEntry::from_record(record) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    let queue_id = record.get("id").and_then(JsonValue::as_u64).unwrap_or(0);
                    error!("✗ Unreadable queue entry {queue_id}: {e}");
                    summary.failed += 1;
                    summary.errors.push(SyncItemError {
                        queue_id,
                        endpoint: String::new(),
                        error: e.to_string(),
                    });
                }
            }
        }
        // oldest first; ids break ties between entries queued in the same millisecond
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));

        info!("🔄 Processing {} queued items...", entries.len());

        let mut lease_lost = false;
        for entry in &entries {
            match self.sync_item(entry).await {
                Ok(()) => {
                    summary.processed += 1;
                    debug!("✓ Synced: {} {}", entry.method, entry.endpoint);
                }
                Err(e) => {
                    error!("✗ Failed to sync: {e}");
                    summary.failed += 1;
                    summary.errors.push(SyncItemError {
                        queue_id: entry.id,
                        endpoint: entry.endpoint.clone(),
                        error: match e {
                            AppError::SyncItemFailed { reason, .. } => reason,
                            other => other.to_string(),
                        },
                    });
                }
            }

            // keep the lease alive through long passes
            match store.try_acquire_lease(SYNC_LEASE, &self.instance_id, now_millis(), self.lease_ttl_ms) {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Sync lease taken over by another instance, stopping pass");
                    lease_lost = true;
                    break;
                }
                Err(e) => warn!("Failed to renew sync lease: {e}"),
            }
        }

        let outcome = if lease_lost {
            SyncOutcome::Interrupted(summary)
        } else {
            SyncOutcome::Completed(summary)
        };
        let level = match &outcome {
            SyncOutcome::Interrupted(_) => NoticeLevel::Warning,
            SyncOutcome::Completed(summary) if summary.failed > 0 => NoticeLevel::Warning,
            _ => NoticeLevel::Info,
        };
        self.ctx.status.notify(level, outcome.message());
        outcome
    }

    /// Replays one entry. The local record is only updated while it still
    /// shows this entry's optimistic state; a mutation queued after it, even
    /// during this pass, keeps its newer local copy.
    async fn sync_item(&self, entry: &SyncQueueEntry) -> AppResult<()> {
        let failed = |reason: String| AppError::SyncItemFailed {
            queue_id: entry.id,
            endpoint: entry.endpoint.clone(),
            reason,
        };

        let request = RemoteRequest::new(entry.method, entry.endpoint.clone()).with_body(entry.request_body());
        let response = self.ctx.fetch(request).await.map_err(|e| failed(e.to_string()))?;

        let replayed = Replayed {
            mutation_id: &entry.mutation_id,
            synced_at: now_millis(),
        };
        let mut ops = confirmed_ops(&entry.options, entry.method, &response, Some(replayed));
        ops.push(StoreOp::Delete {
            collection: Collection::SyncQueue,
            key: encode_numeric_key(entry.id),
        });
        self.ctx.store.write_batch(ops).map_err(|e| failed(e.to_string()))?;
        Ok(())
    }

    async fn run_automatic(&self, trigger: &str) {
        match self.sync_pass().await {
            SyncOutcome::Completed(summary) | SyncOutcome::Interrupted(summary) => {
                if summary.processed > 0 || summary.failed > 0 {
                    info!("✓ {trigger} sync: {} synced, {} failed", summary.processed, summary.failed);
                }
            }
            other => debug!("{trigger} sync skipped: {}", other.message()),
        }
    }
}

async fn listen(inner: Arc<SyncInner>) {
    let mut signals = inner.ctx.connectivity.subscribe();
    let mut was_online = *signals.borrow_and_update();
    inner.ctx.refresh_status();

    if was_online {
        inner.run_automatic("Startup").await;
    }

    let mut ticker = inner.periodic.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });

    loop {
        tokio::select! {
            changed = signals.changed() => {
                if changed.is_err() {
                    break;
                }
                let online = *signals.borrow_and_update();
                if online == was_online {
                    continue;
                }
                was_online = online;
                inner.ctx.refresh_status();

                if online {
                    info!("✓ Connection restored!");
                    inner.run_automatic("Reconnect").await;
                } else {
                    info!("✗ Connection lost - entering offline mode");
                    inner
                        .ctx
                        .status
                        .notify(NoticeLevel::Info, "Offline mode: changes will sync when back online");
                }
            }
            _ = tick(&mut ticker) => {
                if inner.ctx.is_online() {
                    inner.run_automatic("Periodic").await;
                }
            }
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
