//! Local persistent store abstraction.
//!
//! Records are JSON objects grouped by collection and keyed by their `id`
//! field. Each call is one logical transaction; nothing spans calls.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tether_engine::IndexRange;

use crate::error::Result;

/// Collection holding pending queued operations.
pub const QUEUE_COLLECTION: &str = "_offline_queue";

/// Collection holding one checkpoint per synced collection.
pub const CHECKPOINT_COLLECTION: &str = "_sync_checkpoints";

/// Collection holding the backup catalog.
pub const BACKUP_COLLECTION: &str = "_backups";

/// Collection holding the ids each synced collection exchanged with the mirror.
pub const MIRROR_COLLECTION: &str = "_mirror_state";

/// Keyed record store consumed by every sync service.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// All records of a collection, ordered by id.
    async fn get_all(&self, collection: &str) -> Result<Vec<Value>>;

    async fn get_by_key(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Insert or replace a record. The record must carry a string `id`.
    async fn put(&self, collection: &str, record: &Value) -> Result<()>;

    /// Delete a record, returning whether it existed.
    async fn delete(&self, collection: &str, id: &str) -> Result<bool>;

    /// Records whose value at `index` (a dotted field path) lies in `range`.
    async fn query_by_index(
        &self,
        collection: &str,
        index: &str,
        range: &IndexRange,
    ) -> Result<Vec<Value>>;

    /// Remove every record of a collection, returning how many were removed.
    async fn clear(&self, collection: &str) -> Result<usize>;

    /// Names of all non-empty collections, internal ones included.
    async fn collections(&self) -> Result<Vec<String>>;
}

/// Load and decode one record.
pub async fn get_typed<T: DeserializeOwned>(
    store: &dyn LocalStore,
    collection: &str,
    id: &str,
) -> Result<Option<T>> {
    match store.get_by_key(collection, id).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Load and decode every record of a collection.
pub async fn get_all_typed<T: DeserializeOwned>(
    store: &dyn LocalStore,
    collection: &str,
) -> Result<Vec<T>> {
    store
        .get_all(collection)
        .await?
        .into_iter()
        .map(|value| serde_json::from_value(value).map_err(Into::into))
        .collect()
}

/// Encode and store a value under an explicit id.
///
/// The id is written into the record's `id` field, replacing any existing one.
pub async fn put_typed<T: Serialize + ?Sized>(
    store: &dyn LocalStore,
    collection: &str,
    id: &str,
    value: &T,
) -> Result<()> {
    let mut record = serde_json::to_value(value)?;
    match record.as_object_mut() {
        Some(fields) => {
            fields.insert(
                tether_engine::record::ID_FIELD.to_string(),
                Value::String(id.to_string()),
            );
        }
        None => {
            return Err(crate::SyncError::Store(format!(
                "cannot store non-object value under {collection}:{id}"
            )))
        }
    }
    store.put(collection, &record).await
}
