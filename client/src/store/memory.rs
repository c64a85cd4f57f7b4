//! In-process record store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tether_engine::{record, IndexRange, RecordId};
use tokio::sync::RwLock;

use super::LocalStore;
use crate::error::Result;

type Collection = BTreeMap<RecordId, Value>;

/// Volatile store backed by ordered maps.
///
/// Used in tests and as a scratch store; contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<BTreeMap<String, Collection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all collections.
    pub async fn len(&self) -> usize {
        self.collections.read().await.values().map(BTreeMap::len).sum()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get_all(&self, collection: &str) -> Result<Vec<Value>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_by_key(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|records| records.get(id))
            .cloned())
    }

    async fn put(&self, collection: &str, value: &Value) -> Result<()> {
        let id = record::require_id(value)?.to_string();
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id, value.clone());
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let mut collections = self.collections.write().await;
        let Some(records) = collections.get_mut(collection) else {
            return Ok(false);
        };
        let existed = records.remove(id).is_some();
        if records.is_empty() {
            collections.remove(collection);
        }
        Ok(existed)
    }

    async fn query_by_index(
        &self,
        collection: &str,
        index: &str,
        range: &IndexRange,
    ) -> Result<Vec<Value>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|records| {
                records
                    .values()
                    .filter(|r| record::index_value(r, index).is_some_and(|v| range.contains(v)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn clear(&self, collection: &str) -> Result<usize> {
        Ok(self
            .collections
            .write()
            .await
            .remove(collection)
            .map(|records| records.len())
            .unwrap_or(0))
    }

    async fn collections(&self) -> Result<Vec<String>> {
        Ok(self.collections.read().await.keys().cloned().collect())
    }
}
