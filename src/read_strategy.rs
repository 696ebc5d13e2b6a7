//! Read strategies.
//!
//! * [`cache_first`] / [`cache_first_by_index`] for reference content that
//!   rarely changes: a local hit never touches the network.
//! * [`network_first`] for user data that may change server-side: the network
//!   wins when reachable, the local copy is a stale fallback.
//!
//! Read strategies never touch the sync queue.

use std::time::Duration;

use log::{info, warn};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};

use crate::app_error::{AppError, AppResult};
use crate::context::CoreContext;
use crate::local_db_model::{now_millis, set_field, Collection, FIELD_CACHED_AT};
use crate::local_db_state::StoreOp;
use crate::remote::RemoteRequest;

/// Where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataSource {
    Cache,
    Network,
    OfflineQueue,
    ErrorQueue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResult {
    pub data: JsonValue,
    pub source: DataSource,
    /// Set when the data is a local fallback that may be out of date.
    pub is_stale: bool,
}

impl ReadResult {
    fn cache(data: JsonValue) -> Self {
        Self { data, source: DataSource::Cache, is_stale: false }
    }

    fn stale(data: JsonValue) -> Self {
        Self { data, source: DataSource::Cache, is_stale: true }
    }

    fn network(data: JsonValue) -> Self {
        Self { data, source: DataSource::Network, is_stale: false }
    }
}

/// Reads content keyed by `cache_key`, fetching `endpoint` only on a miss.
///
/// Errors: [`AppError::ContentUnavailableOffline`] on a miss while offline or
/// when the fetch times out; HTTP failures and storage errors propagate.
pub async fn cache_first(ctx: &CoreContext, endpoint: &str, cache_key: &str) -> AppResult<ReadResult> {
    if let Some(cached) = ctx.store.get(Collection::ContentCache, cache_key)? {
        if !is_expired(&cached, ctx.content_ttl, now_millis()) {
            info!("📦 Cache hit: {cache_key}");
            return Ok(ReadResult::cache(cached));
        }
        if !ctx.is_online() {
            info!("📦 Expired cache entry served offline: {cache_key}");
            return Ok(ReadResult::stale(cached));
        }
        return match fetch_content(ctx, endpoint, cache_key).await {
            Ok(data) => Ok(ReadResult::network(data)),
            Err(e) if e.is_storage() => Err(e),
            Err(e) => {
                warn!("Refresh of expired '{cache_key}' failed, serving stale copy: {e}");
                Ok(ReadResult::stale(cached))
            }
        };
    }

    if !ctx.is_online() {
        return Err(AppError::ContentUnavailableOffline { key: cache_key.to_string() });
    }

    info!("🌐 Fetching from API: {endpoint}");
    match fetch_content(ctx, endpoint, cache_key).await {
        Ok(data) => Ok(ReadResult::network(data)),
        Err(e) if e.is_offline_equivalent() => {
            warn!("Fetch of '{cache_key}' failed: {e}");
            Err(AppError::ContentUnavailableOffline { key: cache_key.to_string() })
        }
        Err(e) => Err(e),
    }
}

async fn fetch_content(ctx: &CoreContext, endpoint: &str, cache_key: &str) -> AppResult<JsonValue> {
    let data = ctx.fetch(RemoteRequest::get(endpoint)).await?;
    let mut record = Collection::ContentCache.wrap(cache_key, data.clone());
    set_field(&mut record, FIELD_CACHED_AT, json!(now_millis()));
    ctx.store.put(Collection::ContentCache, record)?;
    Ok(data)
}

/// Cache-first read of a group of content records, e.g. every verse of a
/// book. A non-empty index hit is served locally; otherwise `endpoint` must
/// return an array whose elements are cached under their own `id`.
pub async fn cache_first_by_index(
    ctx: &CoreContext,
    index: &str,
    value: &str,
    endpoint: &str,
) -> AppResult<ReadResult> {
    let cached = ctx
        .store
        .get_all_by_index(Collection::ContentCache, index, &json!(value))?;
    if !cached.is_empty() {
        info!("📦 Cache hit: {value} ({} records)", cached.len());
        return Ok(ReadResult::cache(JsonValue::Array(cached)));
    }

    let group_key = format!("{index}:{value}");
    if !ctx.is_online() {
        return Err(AppError::ContentUnavailableOffline { key: group_key });
    }

    info!("🌐 Fetching from API: {endpoint}");
    let data = match ctx.fetch(RemoteRequest::get(endpoint)).await {
        Ok(data) => data,
        Err(e) if e.is_offline_equivalent() => {
            warn!("Fetch of '{group_key}' failed: {e}");
            return Err(AppError::ContentUnavailableOffline { key: group_key });
        }
        Err(e) => return Err(e),
    };

    let Some(items) = data.as_array() else {
        return Err(AppError::InvalidRecord(format!("expected an array from {endpoint}")));
    };

    let cached_at = now_millis();
    let mut ops = Vec::with_capacity(items.len());
    for item in items {
        if Collection::ContentCache.record_key(item).is_err() {
            warn!("Skipping content item without id from {endpoint}");
            continue;
        }
        let mut record = item.clone();
        set_field(&mut record, FIELD_CACHED_AT, json!(cached_at));
        ops.push(StoreOp::Put { collection: Collection::ContentCache, record });
    }
    ctx.store.write_batch(ops)?;

    Ok(ReadResult::network(data))
}

/// Reads user data from `endpoint`, falling back to the copy stored under
/// `cache_key` in `collection` when offline or when the request fails.
///
/// Errors: [`AppError::NoCachedDataOffline`] when neither source has data.
pub async fn network_first(
    ctx: &CoreContext,
    endpoint: &str,
    collection: Collection,
    cache_key: &str,
) -> AppResult<ReadResult> {
    if ctx.is_online() {
        info!("🌐 Fetching from API: {endpoint}");
        match ctx.fetch(RemoteRequest::get(endpoint)).await {
            Ok(data) => {
                ctx.store.put(collection, collection.wrap(cache_key, data.clone()))?;
                return Ok(ReadResult::network(data));
            }
            Err(e) => warn!("Network read of {endpoint} failed, checking cache: {e}"),
        }
    } else {
        info!("📦 Offline, checking cache...");
    }

    match ctx.store.get(collection, cache_key)? {
        Some(cached) => Ok(ReadResult::stale(cached)),
        None => Err(AppError::NoCachedDataOffline { key: cache_key.to_string() }),
    }
}

/// Deletes cached content older than the configured TTL. Returns the number
/// of evicted records; without a TTL nothing expires.
pub fn evict_expired_content(ctx: &CoreContext, now: i64) -> AppResult<usize> {
    if ctx.content_ttl.is_none() {
        return Ok(0);
    }

    let mut ops = Vec::new();
    for record in ctx.store.get_all(Collection::ContentCache)? {
        if is_expired(&record, ctx.content_ttl, now) {
            let key = Collection::ContentCache.record_key(&record)?;
            ops.push(StoreOp::Delete { collection: Collection::ContentCache, key });
        }
    }

    let evicted = ops.len();
    if evicted > 0 {
        ctx.store.write_batch(ops)?;
        info!("Evicted {evicted} expired content records");
    }
    Ok(evicted)
}

/// Records without `_cachedAt` never expire.
fn is_expired(record: &JsonValue, ttl: Option<Duration>, now: i64) -> bool {
    let Some(ttl) = ttl else {
        return false;
    };
    match record.get(FIELD_CACHED_AT).and_then(JsonValue::as_i64) {
        Some(cached_at) => now.saturating_sub(cached_at) > ttl.as_millis() as i64,
        None => false,
    }
}
