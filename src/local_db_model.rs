//! Data model definitions for local storage.
//!
//! Every record kept by the store is a JSON object. A [`Collection`] decides
//! which field is the primary key, which fields are secondarily indexed and
//! whether keys are generated by the store. The sync queue has a typed view,
//! [`SyncQueueEntry`], that is serialized into the same JSON shape.
//!
//! Records written by the strategies carry bookkeeping flags prefixed with
//! an underscore (`_pending`, `_synced`, ...). They are plain JSON fields, so
//! a caller rendering a record can read them directly.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use crate::app_error::{AppError, AppResult};

/// Current on-disk schema version. Bump it when a collection or an index is
/// added, and record the addition in [`INDEX_HISTORY`].
pub const SCHEMA_VERSION: u32 = 2;

/// Schema version in which each secondary index first appeared. Indexes added
/// after the version found on disk are rebuilt from their collection on open.
pub const INDEX_HISTORY: &[(Collection, &str, u32)] = &[
    (Collection::ContentCache, "reference", 1),
    (Collection::ContentCache, "book", 1),
    (Collection::StudyNotes, "verseId", 1),
    (Collection::StudyNotes, "timestamp", 1),
    (Collection::SyncQueue, "timestamp", 1),
    (Collection::SyncQueue, "type", 1),
    (Collection::SyncQueue, "idempotencyKey", 2),
];

pub const FLAG_PENDING: &str = "_pending";
pub const FLAG_OFFLINE: &str = "_offline";
pub const FLAG_ERROR: &str = "_error";
pub const FLAG_DELETED: &str = "_deleted";
pub const FLAG_SYNCED: &str = "_synced";
pub const FIELD_SYNCED_AT: &str = "_syncedAt";
pub const FIELD_CACHED_AT: &str = "_cachedAt";
pub const FIELD_SERVER_ID: &str = "_serverId";
pub const FIELD_SYNC_TIMESTAMP: &str = "_syncTimestamp";
/// Mutation that produced the current optimistic state of a record.
pub const FIELD_MUTATION_ID: &str = "_mutationId";

/// Logical partitions of the local store. Each one is an independent keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Collection {
    /// Reference content (verses), populated lazily from the network.
    #[serde(rename = "verses")]
    ContentCache,
    /// User-authored notes tied to a content identifier.
    #[serde(rename = "studyNotes")]
    StudyNotes,
    /// One record per settings key.
    #[serde(rename = "userSettings")]
    UserSettings,
    /// Durable log of pending mutations.
    #[serde(rename = "syncQueue")]
    SyncQueue,
    /// Internal bookkeeping: schema version, key counters, sync lease.
    #[serde(rename = "meta")]
    Meta,
}

impl Collection {
    pub const ALL: [Collection; 5] = [
        Collection::ContentCache,
        Collection::StudyNotes,
        Collection::UserSettings,
        Collection::SyncQueue,
        Collection::Meta,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Collection::ContentCache => "verses",
            Collection::StudyNotes => "studyNotes",
            Collection::UserSettings => "userSettings",
            Collection::SyncQueue => "syncQueue",
            Collection::Meta => "meta",
        }
    }

    /// Field holding the primary key.
    pub fn key_path(self) -> &'static str {
        match self {
            Collection::UserSettings => "key",
            _ => "id",
        }
    }

    /// Whether the store assigns keys on [`add`](crate::local_db_state::LocalStore::add).
    pub fn auto_increment(self) -> bool {
        matches!(self, Collection::SyncQueue)
    }

    pub fn indexes(self) -> &'static [&'static str] {
        match self {
            Collection::ContentCache => &["reference", "book"],
            Collection::StudyNotes => &["verseId", "timestamp"],
            Collection::SyncQueue => &["timestamp", "type", "idempotencyKey"],
            Collection::UserSettings | Collection::Meta => &[],
        }
    }

    /// Extracts and encodes the primary key of `record`.
    pub fn record_key(self, record: &JsonValue) -> AppResult<String> {
        let field = self.key_path();
        record
            .get(field)
            .and_then(encode_key)
            .ok_or_else(|| {
                AppError::InvalidRecord(format!(
                    "record for '{}' has no usable '{}' field",
                    self.name(),
                    field
                ))
            })
    }

    /// Normalizes `data` into a record stored under `key`.
    ///
    /// Settings are wrapped as `{key, value}`. Other collections keep the
    /// object's fields and force the key field to `key`; a differing id
    /// assigned by the server is preserved as `_serverId`. Non-object data is
    /// wrapped as `{id, value}`.
    pub fn wrap(self, key: &str, data: JsonValue) -> JsonValue {
        let field = self.key_path();
        if self == Collection::UserSettings {
            return json!({ field: key, "value": data });
        }

        match data {
            JsonValue::Object(mut map) => {
                if let Some(existing) = map.get(field) {
                    if encode_key(existing).as_deref() != Some(key) {
                        let server_id = existing.clone();
                        map.insert(FIELD_SERVER_ID.to_string(), server_id);
                    }
                }
                map.insert(field.to_string(), JsonValue::String(key.to_string()));
                JsonValue::Object(map)
            }
            other => json!({ field: key, "value": other }),
        }
    }
}

/// Encodes a JSON scalar as a store key.
///
/// Non-negative integers are zero-padded so that byte order in LMDB matches
/// numeric order; this keeps queue ids and timestamps sorted.
pub fn encode_key(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => {
            if let Some(u) = n.as_u64() {
                Some(format!("{u:020}"))
            } else {
                Some(n.to_string())
            }
        }
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Encodes a numeric key the same way [`encode_key`] does.
pub fn encode_numeric_key(id: u64) -> String {
    format!("{id:020}")
}

/// HTTP verbs a queued mutation can replay with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// GET and HEAD requests are sent without a body.
    pub fn has_body(self) -> bool {
        !matches!(self, HttpMethod::Get | HttpMethod::Head)
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a mutation's result lands locally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationOptions {
    /// Collection updated with the optimistic and the authoritative record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_store: Option<Collection>,

    /// Key of the local record; falls back to the response id, then to a
    /// generated placeholder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,

    /// Queued mutations sharing this key collapse to the most recent one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl MutationOptions {
    pub fn for_store(store: Collection, key: impl Into<String>) -> Self {
        Self {
            cache_store: Some(store),
            cache_key: Some(key.into()),
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// A durable intent to replay one request against the remote API.
///
/// Entries are appended by the write strategy and removed by the sync manager
/// only after the server confirmed them. `timestamp` orders the drain and is
/// forwarded as `_syncTimestamp` for server-side last-write-wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueEntry {
    /// Assigned by the store when the entry is added.
    #[serde(default)]
    pub id: u64,
    pub endpoint: String,
    pub method: HttpMethod,
    pub data: JsonValue,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub mutation_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub options: MutationOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncQueueEntry {
    pub fn new(
        endpoint: impl Into<String>,
        method: HttpMethod,
        data: JsonValue,
        options: MutationOptions,
        timestamp: i64,
    ) -> Self {
        let kind = match options.cache_store {
            Some(store) => format!("{}:{}", store.name(), method),
            None => format!("request:{method}"),
        };
        Self {
            id: 0,
            endpoint: endpoint.into(),
            method,
            data,
            timestamp,
            mutation_id: format!("mutation-{}", Uuid::now_v7()),
            kind,
            idempotency_key: options.idempotency_key.clone(),
            options,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn to_record(&self) -> AppResult<JsonValue> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_record(record: &JsonValue) -> AppResult<Self> {
        Ok(serde_json::from_value(record.clone())?)
    }

    /// Request body: the queued data plus `_syncTimestamp`.
    pub fn request_body(&self) -> Option<JsonValue> {
        if !self.method.has_body() {
            return None;
        }
        Some(with_sync_timestamp(self.data.clone(), self.timestamp))
    }
}

/// Adds `_syncTimestamp` to an object body; other values are wrapped.
pub fn with_sync_timestamp(data: JsonValue, timestamp: i64) -> JsonValue {
    match data {
        JsonValue::Object(mut map) => {
            map.insert(FIELD_SYNC_TIMESTAMP.to_string(), json!(timestamp));
            JsonValue::Object(map)
        }
        other => json!({ "value": other, FIELD_SYNC_TIMESTAMP: timestamp }),
    }
}

/// Sets a field on a JSON object record; no-op for non-objects.
pub fn set_field(record: &mut JsonValue, field: &str, value: JsonValue) {
    if let Some(map) = record.as_object_mut() {
        map.insert(field.to_string(), value);
    }
}

pub fn remove_field(record: &mut JsonValue, field: &str) {
    if let Some(map) = record.as_object_mut() {
        map.remove(field);
    }
}

pub fn flag(record: &JsonValue, field: &str) -> bool {
    record.get(field).and_then(JsonValue::as_bool).unwrap_or(false)
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
