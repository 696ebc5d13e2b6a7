//! Write strategy: network first, durable queue on failure.
//!
//! [`mutate`] always hands back something the UI can render. When the remote
//! write cannot be confirmed, the mutation is appended to the sync queue and
//! an optimistic copy flagged `_pending` is written to the target collection,
//! both in one store transaction.

use log::{info, warn};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};

use crate::app_error::{AppError, AppResult};
use crate::context::CoreContext;
use crate::local_db_model::{
    encode_key, now_millis, remove_field, set_field, with_sync_timestamp, Collection, HttpMethod,
    MutationOptions, SyncQueueEntry, FIELD_MUTATION_ID, FIELD_SYNCED_AT, FLAG_DELETED, FLAG_ERROR,
    FLAG_OFFLINE, FLAG_PENDING, FLAG_SYNCED,
};
use crate::local_db_state::StoreOp;
use crate::read_strategy::DataSource;
use crate::remote::RemoteRequest;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationOutcome {
    /// The server confirmed the write.
    pub success: bool,
    /// The mutation sits in the sync queue.
    pub pending: bool,
    pub source: DataSource,
    /// Authoritative response, or the optimistic record when queued.
    pub data: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<u64>,
}

/// Sends a mutation, queueing it when offline or when the request fails.
///
/// Only storage failures are returned as `Err`; timeouts, HTTP errors and
/// transport errors resolve to a queued outcome.
pub async fn mutate(
    ctx: &CoreContext,
    endpoint: &str,
    method: HttpMethod,
    data: JsonValue,
    options: MutationOptions,
) -> AppResult<MutationOutcome> {
    let timestamp = now_millis();

    if !ctx.is_online() {
        info!("📦 Offline, adding to sync queue: {method} {endpoint}");
        return enqueue(ctx, endpoint, method, data, options, timestamp, None);
    }

    info!("🌐 {method} to API: {endpoint}");
    let body = method
        .has_body()
        .then(|| with_sync_timestamp(data.clone(), timestamp));
    let request = RemoteRequest::new(method, endpoint).with_body(body);

    match ctx.fetch(request).await {
        Ok(response) => {
            let ops = confirmed_ops(&options, method, &response, None);
            if !ops.is_empty() {
                ctx.store.write_batch(ops)?;
            }
            Ok(MutationOutcome {
                success: true,
                pending: false,
                source: DataSource::Network,
                data: response,
                error: None,
                queue_id: None,
            })
        }
        Err(e) => {
            warn!("{method} {endpoint} failed, queueing: {e}");
            enqueue(ctx, endpoint, method, data, options, timestamp, Some(e))
        }
    }
}

fn enqueue(
    ctx: &CoreContext,
    endpoint: &str,
    method: HttpMethod,
    data: JsonValue,
    options: MutationOptions,
    timestamp: i64,
    failure: Option<AppError>,
) -> AppResult<MutationOutcome> {
    let mut entry = SyncQueueEntry::new(endpoint, method, data.clone(), options.clone(), timestamp);
    if let Some(e) = &failure {
        entry = entry.with_error(e.to_string());
    }

    let mut ops = Vec::new();
    if let Some(key) = &options.idempotency_key {
        let queued = ctx
            .store
            .get_all_by_index(Collection::SyncQueue, "idempotencyKey", &json!(key))?;
        for existing in queued {
            info!("Replacing queued mutation with idempotency key '{key}'");
            ops.push(StoreOp::Delete {
                collection: Collection::SyncQueue,
                key: Collection::SyncQueue.record_key(&existing)?,
            });
        }
    }
    let add_index = ops.len();
    ops.push(StoreOp::Add {
        collection: Collection::SyncQueue,
        record: entry.to_record()?,
    });

    let flag_name = if failure.is_some() { FLAG_ERROR } else { FLAG_OFFLINE };
    let local_key = options
        .cache_key
        .clone()
        .unwrap_or_else(|| entry.mutation_id.clone());

    let optimistic = match options.cache_store {
        Some(collection) => {
            let record = optimistic_record(
                ctx,
                collection,
                method,
                &local_key,
                &data,
                flag_name,
                &entry.mutation_id,
            )?;
            if let Some(record) = &record {
                ops.push(StoreOp::Put { collection, record: record.clone() });
            }
            record
        }
        None => None,
    };

    let keys = ctx.store.write_batch(ops)?;
    let queue_id = keys.get(add_index).and_then(|key| key.parse::<u64>().ok());
    ctx.refresh_status();

    let data = optimistic.unwrap_or_else(|| {
        let mut record = Collection::StudyNotes.wrap(&local_key, data);
        set_field(&mut record, FLAG_PENDING, json!(true));
        set_field(&mut record, flag_name, json!(true));
        record
    });

    Ok(MutationOutcome {
        success: false,
        pending: true,
        source: if failure.is_some() { DataSource::ErrorQueue } else { DataSource::OfflineQueue },
        data,
        error: failure.map(|e| e.to_string()),
        queue_id,
    })
}

/// Builds the local copy shown while a mutation is queued. A queued DELETE
/// marks the existing record instead of removing it; there is nothing to
/// mark when no local record exists. The record is tagged with the queued
/// mutation's id so a later confirmation only lands while it is current.
fn optimistic_record(
    ctx: &CoreContext,
    collection: Collection,
    method: HttpMethod,
    key: &str,
    data: &JsonValue,
    flag_name: &str,
    mutation_id: &str,
) -> AppResult<Option<JsonValue>> {
    let mut record = if method == HttpMethod::Delete {
        match ctx.store.get(collection, key)? {
            Some(mut existing) => {
                set_field(&mut existing, FLAG_DELETED, json!(true));
                existing
            }
            None => return Ok(None),
        }
    } else {
        let mut record = collection.wrap(key, data.clone());
        if collection == Collection::StudyNotes && record.get("timestamp").is_none() {
            set_field(&mut record, "timestamp", json!(now_millis()));
        }
        record
    };

    remove_field(&mut record, FLAG_SYNCED);
    remove_field(&mut record, FIELD_SYNCED_AT);
    set_field(&mut record, FLAG_PENDING, json!(true));
    set_field(&mut record, flag_name, json!(true));
    set_field(&mut record, FIELD_MUTATION_ID, json!(mutation_id));
    Ok(Some(record))
}

/// A queued mutation confirmed by a sync pass.
pub(crate) struct Replayed<'a> {
    pub mutation_id: &'a str,
    pub synced_at: i64,
}

/// Store writes applying a confirmed server response to the local copy.
///
/// The record lands under the caller's cache key, or the response id when no
/// key was given. A confirmed DELETE removes the local record. A replayed
/// mutation only touches the record while it still carries that mutation's
/// optimistic state, and tags it `_synced`.
pub(crate) fn confirmed_ops(
    options: &MutationOptions,
    method: HttpMethod,
    response: &JsonValue,
    replayed: Option<Replayed<'_>>,
) -> Vec<StoreOp> {
    let Some(collection) = options.cache_store else {
        return Vec::new();
    };
    let key = options
        .cache_key
        .clone()
        .or_else(|| response.get(collection.key_path()).and_then(encode_key));
    let Some(key) = key else {
        warn!("Server response has no key for '{}'; local copy not updated", collection.name());
        return Vec::new();
    };

    if method == HttpMethod::Delete {
        return match replayed {
            Some(replayed) => vec![StoreOp::DeleteIfCurrent {
                collection,
                key,
                field: FIELD_MUTATION_ID,
                expected: replayed.mutation_id.to_string(),
            }],
            None => vec![StoreOp::Delete { collection, key }],
        };
    }

    let mut record = collection.wrap(&key, response.clone());
    if collection == Collection::StudyNotes && record.get("timestamp").is_none() {
        set_field(&mut record, "timestamp", json!(now_millis()));
    }
    match replayed {
        Some(replayed) => {
            set_field(&mut record, FLAG_SYNCED, json!(true));
            set_field(&mut record, FIELD_SYNCED_AT, json!(replayed.synced_at));
            vec![StoreOp::PutIfCurrent {
                collection,
                record,
                field: FIELD_MUTATION_ID,
                expected: replayed.mutation_id.to_string(),
            }]
        }
        None => vec![StoreOp::Put { collection, record }],
    }
}
