//! Durable keyed record storage.
//!
//! [`LocalStore`] is the storage contract the strategies and the sync manager
//! are written against. [`LmdbStore`] implements it on LMDB: one named
//! database per [`Collection`] and one per secondary index. Index databases
//! map `"<value>\0<primary key>"` to the primary key, so a lookup is a prefix
//! scan over a keys-only table.
//!
//! Storage errors are returned to the caller untouched; the strategies decide
//! what to do with them.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use lmdb::{Cursor, Database, DatabaseFlags, Environment, RwTransaction, Transaction, WriteFlags};
use lmdb_sys::{MDB_NEXT, MDB_SET_RANGE};
use log::{debug, info, warn};
use serde_json::{json, Value as JsonValue};

use crate::app_error::{AppError, AppResult};
use crate::local_db_model::{encode_key, encode_numeric_key, Collection, INDEX_HISTORY, SCHEMA_VERSION};

const MAX_DBS: u32 = 32;
/// LMDB rejects keys longer than this with the default build.
const MAX_KEY_BYTES: usize = 511;
const SCHEMA_RECORD: &str = "schema";

/// One write inside an atomic [`LocalStore::write_batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    /// Upsert by primary key.
    Put { collection: Collection, record: JsonValue },
    /// Insert with a store-generated key.
    Add { collection: Collection, record: JsonValue },
    /// Remove by encoded primary key; missing keys are ignored.
    Delete { collection: Collection, key: String },
    /// Upsert, skipped when the stored record's `field` is not `expected`.
    /// Applies when no record is stored.
    PutIfCurrent {
        collection: Collection,
        record: JsonValue,
        field: &'static str,
        expected: String,
    },
    /// Remove, skipped when the stored record's `field` is not `expected`.
    DeleteIfCurrent {
        collection: Collection,
        key: String,
        field: &'static str,
        expected: String,
    },
}

/// Persistent, per-collection key-value storage with secondary indexes.
///
/// Keys are the encoded form produced by
/// [`encode_key`](crate::local_db_model::encode_key): strings as-is, unsigned
/// integers zero-padded.
pub trait LocalStore: Send + Sync {
    fn get(&self, collection: Collection, key: &str) -> AppResult<Option<JsonValue>>;

    /// All records in key order.
    fn get_all(&self, collection: Collection) -> AppResult<Vec<JsonValue>>;

    fn get_all_by_index(
        &self,
        collection: Collection,
        index: &str,
        value: &JsonValue,
    ) -> AppResult<Vec<JsonValue>>;

    /// Upserts `record` and returns its encoded key.
    fn put(&self, collection: Collection, record: JsonValue) -> AppResult<String>;

    /// Inserts `record` under the next auto-increment id.
    fn add(&self, collection: Collection, record: JsonValue) -> AppResult<u64>;

    /// Returns whether a record was removed.
    fn delete(&self, collection: Collection, key: &str) -> AppResult<bool>;

    /// Returns the number of removed records.
    fn clear(&self, collection: Collection) -> AppResult<usize>;

    /// Applies every op in one transaction, or none of them. Returns the
    /// encoded key touched by each op.
    fn write_batch(&self, ops: Vec<StoreOp>) -> AppResult<Vec<String>>;

    /// Takes the named lease when it is free, expired or already held by
    /// `owner`.
    fn try_acquire_lease(&self, name: &str, owner: &str, now: i64, ttl_ms: i64) -> AppResult<bool>;

    fn release_lease(&self, name: &str, owner: &str) -> AppResult<()>;

    fn count(&self, collection: Collection) -> AppResult<usize> {
        Ok(self.get_all(collection)?.len())
    }
}

/// LMDB-backed [`LocalStore`].
pub struct LmdbStore {
    env: Environment,
    path: PathBuf,
    collections: HashMap<Collection, Database>,
    indexes: HashMap<(Collection, &'static str), Database>,
}

impl LmdbStore {
    /// Opens (or creates) the environment at `path`, which is a directory.
    ///
    /// Opening never drops data: databases that already exist are reused and
    /// indexes introduced by a newer schema are built from existing records.
    pub fn open(path: impl AsRef<Path>, map_size_mb: usize) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        info!("Opening local store at: {}", path.display());

        let env = Environment::new()
            .set_max_dbs(MAX_DBS)
            .set_map_size(map_size_mb.max(1) * 1024 * 1024)
            .open(&path)?;

        let mut collections = HashMap::new();
        let mut indexes = HashMap::new();
        for collection in Collection::ALL {
            let db = env.create_db(Some(collection.name()), DatabaseFlags::empty())?;
            collections.insert(collection, db);

            for index in collection.indexes() {
                let name = format!("{}.{}", collection.name(), index);
                let db = env.create_db(Some(name.as_str()), DatabaseFlags::empty())?;
                indexes.insert((collection, *index), db);
            }
        }

        let store = Self {
            env,
            path,
            collections,
            indexes,
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Forces buffered data to disk.
    pub fn flush(&self) -> AppResult<()> {
        self.env.sync(true)?;
        Ok(())
    }

    pub fn schema_version(&self) -> AppResult<u32> {
        let txn = self.env.begin_ro_txn()?;
        let record = read_record(&txn, self.db(Collection::Meta)?, SCHEMA_RECORD)?;
        Ok(record
            .and_then(|r| r.get("version").and_then(JsonValue::as_u64))
            .unwrap_or(0) as u32)
    }

    fn migrate(&self) -> AppResult<()> {
        let stored = self.schema_version()?;
        if stored > SCHEMA_VERSION {
            return Err(AppError::StorageUnavailable(format!(
                "store schema version {stored} is newer than supported version {SCHEMA_VERSION}"
            )));
        }
        if stored == SCHEMA_VERSION {
            return Ok(());
        }

        let mut txn = self.env.begin_rw_txn()?;
        for (collection, index, added_in) in INDEX_HISTORY {
            if *added_in <= stored {
                continue;
            }
            let rebuilt = self.rebuild_index(&mut txn, *collection, index)?;
            debug!("Rebuilt index {}.{} ({} entries)", collection.name(), index, rebuilt);
        }
        let schema = json!({ "id": SCHEMA_RECORD, "version": SCHEMA_VERSION });
        write_raw(&mut txn, self.db(Collection::Meta)?, SCHEMA_RECORD, &schema)?;
        txn.commit()?;

        info!("Local store schema upgraded from v{stored} to v{SCHEMA_VERSION}");
        Ok(())
    }

    fn rebuild_index(
        &self,
        txn: &mut RwTransaction,
        collection: Collection,
        index: &str,
    ) -> AppResult<usize> {
        let index_db = self.index_db(collection, index)?;
        txn.clear_db(index_db)?;

        let records = scan(&*txn, self.db(collection)?)?;
        let mut written = 0;
        for record in &records {
            let key = collection.record_key(record)?;
            if let Some(entry) = index_entry(record, index, &key) {
                txn.put(index_db, &entry, &key, WriteFlags::empty())?;
                written += 1;
            }
        }
        Ok(written)
    }

    fn db(&self, collection: Collection) -> AppResult<Database> {
        self.collections.get(&collection).copied().ok_or_else(|| {
            AppError::StorageUnavailable(format!("collection '{}' is not open", collection.name()))
        })
    }

    fn index_db(&self, collection: Collection, index: &str) -> AppResult<Database> {
        collection
            .indexes()
            .iter()
            .find(|name| **name == index)
            .and_then(|name| self.indexes.get(&(collection, *name)).copied())
            .ok_or_else(|| {
                AppError::InvalidRecord(format!(
                    "collection '{}' has no index '{}'",
                    collection.name(),
                    index
                ))
            })
    }

    fn put_in_txn(
        &self,
        txn: &mut RwTransaction,
        collection: Collection,
        record: &JsonValue,
    ) -> AppResult<String> {
        let key = collection.record_key(record)?;
        if key.len() > MAX_KEY_BYTES {
            return Err(AppError::InvalidRecord(format!(
                "key of {} bytes exceeds the {MAX_KEY_BYTES}-byte limit",
                key.len()
            )));
        }
        let db = self.db(collection)?;

        if let Some(previous) = read_record(&*txn, db, &key)? {
            self.unindex(txn, collection, &previous, &key)?;
        }
        write_raw(txn, db, &key, record)?;
        self.index(txn, collection, record, &key)?;
        Ok(key)
    }

    fn add_in_txn(
        &self,
        txn: &mut RwTransaction,
        collection: Collection,
        record: JsonValue,
    ) -> AppResult<u64> {
        if !collection.auto_increment() {
            return Err(AppError::InvalidRecord(format!(
                "collection '{}' does not generate keys",
                collection.name()
            )));
        }

        let meta = self.db(Collection::Meta)?;
        let counter_key = format!("counter:{}", collection.name());
        let current = read_record(&*txn, meta, &counter_key)?
            .and_then(|r| r.get("value").and_then(JsonValue::as_u64))
            .unwrap_or(0);
        let next = current + 1;
        write_raw(txn, meta, &counter_key, &json!({ "id": counter_key, "value": next }))?;

        let mut record = record;
        match record.as_object_mut() {
            Some(map) => {
                map.insert(collection.key_path().to_string(), json!(next));
            }
            None => {
                return Err(AppError::InvalidRecord(
                    "only JSON objects can be added".to_string(),
                ))
            }
        }
        self.put_in_txn(txn, collection, &record)?;
        Ok(next)
    }

    fn delete_in_txn(
        &self,
        txn: &mut RwTransaction,
        collection: Collection,
        key: &str,
    ) -> AppResult<bool> {
        let db = self.db(collection)?;
        let previous = match read_record(&*txn, db, key)? {
            Some(record) => record,
            None => return Ok(false),
        };
        self.unindex(txn, collection, &previous, key)?;
        txn.del(db, &key, None)?;
        Ok(true)
    }

    fn is_current(
        &self,
        txn: &RwTransaction,
        collection: Collection,
        key: &str,
        field: &str,
        expected: &str,
    ) -> AppResult<bool> {
        let current = read_record(txn, self.db(collection)?, key)?;
        Ok(match current {
            Some(record) => record.get(field).and_then(JsonValue::as_str) == Some(expected),
            None => true,
        })
    }

    fn index(
        &self,
        txn: &mut RwTransaction,
        collection: Collection,
        record: &JsonValue,
        key: &str,
    ) -> AppResult<()> {
        for index in collection.indexes() {
            let Some(entry) = index_entry(record, index, key) else {
                continue;
            };
            if entry.len() > MAX_KEY_BYTES {
                warn!("Skipping {}.{} entry for '{}': value too long", collection.name(), index, key);
                continue;
            }
            txn.put(self.index_db(collection, index)?, &entry, &key, WriteFlags::empty())?;
        }
        Ok(())
    }

    fn unindex(
        &self,
        txn: &mut RwTransaction,
        collection: Collection,
        record: &JsonValue,
        key: &str,
    ) -> AppResult<()> {
        for index in collection.indexes() {
            let Some(entry) = index_entry(record, index, key) else {
                continue;
            };
            match txn.del(self.index_db(collection, index)?, &entry, None) {
                Ok(()) | Err(lmdb::Error::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl LocalStore for LmdbStore {
    fn get(&self, collection: Collection, key: &str) -> AppResult<Option<JsonValue>> {
        let txn = self.env.begin_ro_txn()?;
        read_record(&txn, self.db(collection)?, key)
    }

    fn get_all(&self, collection: Collection) -> AppResult<Vec<JsonValue>> {
        let txn = self.env.begin_ro_txn()?;
        scan(&txn, self.db(collection)?)
    }

    fn get_all_by_index(
        &self,
        collection: Collection,
        index: &str,
        value: &JsonValue,
    ) -> AppResult<Vec<JsonValue>> {
        let index_db = self.index_db(collection, index)?;
        let Some(encoded) = encode_key(value) else {
            return Ok(Vec::new());
        };
        let prefix = format!("{encoded}\0");

        let txn = self.env.begin_ro_txn()?;
        let keys = {
            let cursor = txn.open_ro_cursor(index_db)?;
            prefix_scan(&cursor, prefix.as_bytes())?
        };

        let db = self.db(collection)?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            match read_record(&txn, db, &key)? {
                Some(record) => records.push(record),
                None => warn!("Dangling {}.{} entry for '{}'", collection.name(), index, key),
            }
        }
        Ok(records)
    }

    fn put(&self, collection: Collection, record: JsonValue) -> AppResult<String> {
        let mut txn = self.env.begin_rw_txn()?;
        let key = self.put_in_txn(&mut txn, collection, &record)?;
        txn.commit()?;
        Ok(key)
    }

    fn add(&self, collection: Collection, record: JsonValue) -> AppResult<u64> {
        let mut txn = self.env.begin_rw_txn()?;
        let id = self.add_in_txn(&mut txn, collection, record)?;
        txn.commit()?;
        Ok(id)
    }

    fn delete(&self, collection: Collection, key: &str) -> AppResult<bool> {
        let mut txn = self.env.begin_rw_txn()?;
        let removed = self.delete_in_txn(&mut txn, collection, key)?;
        txn.commit()?;
        Ok(removed)
    }

    fn clear(&self, collection: Collection) -> AppResult<usize> {
        let db = self.db(collection)?;
        let mut txn = self.env.begin_rw_txn()?;
        let removed = {
            let mut cursor = txn.open_ro_cursor(db)?;
            cursor.iter().count()
        };
        txn.clear_db(db)?;
        for index in collection.indexes() {
            txn.clear_db(self.index_db(collection, index)?)?;
        }
        txn.commit()?;
        Ok(removed)
    }

    fn write_batch(&self, ops: Vec<StoreOp>) -> AppResult<Vec<String>> {
        let mut txn = self.env.begin_rw_txn()?;
        let mut keys = Vec::with_capacity(ops.len());
        for op in ops {
            let key = match op {
                StoreOp::Put { collection, record } => self.put_in_txn(&mut txn, collection, &record)?,
                StoreOp::Add { collection, record } => {
                    encode_numeric_key(self.add_in_txn(&mut txn, collection, record)?)
                }
                StoreOp::Delete { collection, key } => {
                    self.delete_in_txn(&mut txn, collection, &key)?;
                    key
                }
                StoreOp::PutIfCurrent { collection, record, field, expected } => {
                    let key = collection.record_key(&record)?;
                    if self.is_current(&txn, collection, &key, field, &expected)? {
                        self.put_in_txn(&mut txn, collection, &record)?;
                    } else {
                        debug!("Skipping update of {}/{}: newer local state", collection.name(), key);
                    }
                    key
                }
                StoreOp::DeleteIfCurrent { collection, key, field, expected } => {
                    if self.is_current(&txn, collection, &key, field, &expected)? {
                        self.delete_in_txn(&mut txn, collection, &key)?;
                    } else {
                        debug!("Skipping delete of {}/{}: newer local state", collection.name(), key);
                    }
                    key
                }
            };
            keys.push(key);
        }
        txn.commit()?;
        Ok(keys)
    }

    fn try_acquire_lease(&self, name: &str, owner: &str, now: i64, ttl_ms: i64) -> AppResult<bool> {
        let meta = self.db(Collection::Meta)?;
        let lease_key = format!("lease:{name}");
        let mut txn = self.env.begin_rw_txn()?;

        if let Some(lease) = read_record(&txn, meta, &lease_key)? {
            let holder = lease.get("owner").and_then(JsonValue::as_str).unwrap_or("");
            let expires_at = lease.get("expiresAt").and_then(JsonValue::as_i64).unwrap_or(0);
            if holder != owner && expires_at > now {
                debug!("Lease '{name}' held by {holder} until {expires_at}");
                return Ok(false);
            }
        }

        let lease = json!({ "id": lease_key, "owner": owner, "expiresAt": now + ttl_ms });
        write_raw(&mut txn, meta, &lease_key, &lease)?;
        txn.commit()?;
        Ok(true)
    }

    fn release_lease(&self, name: &str, owner: &str) -> AppResult<()> {
        let meta = self.db(Collection::Meta)?;
        let lease_key = format!("lease:{name}");
        let mut txn = self.env.begin_rw_txn()?;

        let held = read_record(&txn, meta, &lease_key)?
            .map(|lease| lease.get("owner").and_then(JsonValue::as_str) == Some(owner))
            .unwrap_or(false);
        if held {
            txn.del(meta, &lease_key, None)?;
            txn.commit()?;
        }
        Ok(())
    }

    fn count(&self, collection: Collection) -> AppResult<usize> {
        let txn = self.env.begin_ro_txn()?;
        let mut cursor = txn.open_ro_cursor(self.db(collection)?)?;
        let count = cursor.iter().count();
        Ok(count)
    }
}

fn read_record<T: Transaction>(txn: &T, db: Database, key: &str) -> AppResult<Option<JsonValue>> {
    match txn.get(db, &key) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
        Err(lmdb::Error::NotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_raw(txn: &mut RwTransaction, db: Database, key: &str, record: &JsonValue) -> AppResult<()> {
    let bytes = serde_json::to_vec(record)?;
    txn.put(db, &key, &bytes, WriteFlags::empty())?;
    Ok(())
}

fn scan<T: Transaction>(txn: &T, db: Database) -> AppResult<Vec<JsonValue>> {
    let mut cursor = txn.open_ro_cursor(db)?;
    let records = cursor
        .iter()
        .map(|(_, value)| serde_json::from_slice(value).map_err(AppError::from))
        .collect();
    records
}

/// Primary keys of the index entries starting with `prefix`. Seeks to the
/// first entry at or after `prefix` and stops at the first one past it.
fn prefix_scan<'txn, C: Cursor<'txn>>(cursor: &C, prefix: &[u8]) -> AppResult<Vec<String>> {
    let mut keys = Vec::new();
    let mut entry = cursor.get(Some(prefix), None, MDB_SET_RANGE);
    loop {
        match entry {
            Ok((Some(key), primary)) if key.starts_with(prefix) => {
                keys.push(String::from_utf8_lossy(primary).into_owned());
            }
            Ok(_) | Err(lmdb::Error::NotFound) => break,
            Err(e) => return Err(e.into()),
        }
        entry = cursor.get(None, None, MDB_NEXT);
    }
    Ok(keys)
}

fn index_entry(record: &JsonValue, index: &str, key: &str) -> Option<String> {
    record
        .get(index)
        .and_then(encode_key)
        .map(|value| format!("{value}\0{key}"))
}
