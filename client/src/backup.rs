//! Backup and restore of the local dataset.
//!
//! A backup is a [`BackupDocument`] serialized to bytes and handed back to
//! the caller as a [`BackupArtifact`]. Only its [`BackupMetadata`] is kept
//! locally, in the `_backups` catalog. Internal collections are never
//! exported or restored.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_engine::{record, BackupDocument, BackupHeader, BackupMetadata, Timestamp};

use crate::error::{Result, SyncError};
use crate::now_millis;
use crate::store::{self, LocalStore, BACKUP_COLLECTION};

/// Which collections a backup includes.
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// `None` selects every non-internal collection in the store
    pub collections: Option<Vec<String>>,
    /// Removed from the selection after it is built
    pub exclude: Vec<String>,
}

impl BackupOptions {
    pub fn only<I, S>(collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            collections: Some(collections.into_iter().map(Into::into).collect()),
            exclude: Vec::new(),
        }
    }

    pub fn excluding(mut self, collection: impl Into<String>) -> Self {
        self.exclude.push(collection.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Reject the backup unless its checksum matches
    pub validate_checksum: bool,
    /// Replace records that already exist locally
    pub overwrite_existing: bool,
    /// Restore only these collections
    pub collections: Option<Vec<String>>,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            validate_checksum: true,
            overwrite_existing: false,
            collections: None,
        }
    }
}

/// A created backup: catalog entry plus payload.
#[derive(Debug, Clone)]
pub struct BackupArtifact {
    pub metadata: BackupMetadata,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub collections_restored: Vec<String>,
    pub records_processed: usize,
    /// Existing records left alone because overwriting was off
    pub records_skipped: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStats {
    pub count: usize,
    pub total_size: usize,
    pub total_records: usize,
    pub newest: Option<Timestamp>,
    pub oldest: Option<Timestamp>,
}

/// Creates, verifies and restores backups, and manages their catalog.
pub struct BackupManager {
    store: Arc<dyn LocalStore>,
    device_id: Option<String>,
}

impl BackupManager {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            device_id: None,
        }
    }

    /// Stamp backups with the creating device.
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub async fn create_backup(&self, options: &BackupOptions) -> Result<BackupArtifact> {
        let selected = match &options.collections {
            Some(names) => names.clone(),
            None => self.store.collections().await?,
        };

        let mut data = BTreeMap::new();
        for name in selected {
            if record::is_internal_collection(&name) || options.exclude.contains(&name) {
                continue;
            }
            let records = self.store.get_all(&name).await?;
            data.insert(name, records);
        }

        let document = BackupDocument::new(now_millis(), data, self.device_id.clone())?;
        let bytes = document.to_bytes()?;
        let id = format!("backup-{}", uuid::Uuid::new_v4());
        let metadata = BackupMetadata::describe(id, &document, bytes.len());

        store::put_typed(self.store.as_ref(), BACKUP_COLLECTION, &metadata.id, &metadata).await?;

        tracing::info!(
            backup_id = %metadata.id,
            collections = metadata.collections.len(),
            records = metadata.record_count,
            size = metadata.size,
            "Backup created"
        );

        Ok(BackupArtifact { metadata, bytes })
    }

    /// Restore a backup.
    ///
    /// Parsing and checksum validation happen before anything is written;
    /// either failing aborts the restore with no changes. Individual record
    /// failures after that are collected in the report.
    pub async fn restore_backup(&self, bytes: &[u8], options: &RestoreOptions) -> Result<RestoreReport> {
        let document = parse(bytes)?;
        if options.validate_checksum {
            document
                .verify_checksum()
                .map_err(|e| SyncError::Integrity(e.to_string()))?;
        }

        let mut report = RestoreReport::default();
        for (collection, records) in &document.data {
            if record::is_internal_collection(collection) {
                tracing::warn!(collection = %collection, "Skipping internal collection in backup");
                continue;
            }
            if let Some(only) = &options.collections {
                if !only.contains(collection) {
                    continue;
                }
            }

            for value in records {
                match self
                    .restore_record(collection, value, options.overwrite_existing)
                    .await
                {
                    Ok(true) => report.records_processed += 1,
                    Ok(false) => report.records_skipped += 1,
                    Err(e) => {
                        let id = record::record_id(value).unwrap_or("<no id>");
                        report.errors.push(format!("{collection}:{id}: {e}"));
                    }
                }
            }
            report.collections_restored.push(collection.clone());
        }

        tracing::info!(
            collections = report.collections_restored.len(),
            processed = report.records_processed,
            skipped = report.records_skipped,
            errors = report.errors.len(),
            "Backup restored"
        );
        Ok(report)
    }

    /// Check a backup's format and checksum without restoring it.
    pub fn validate_backup(&self, bytes: &[u8]) -> Result<BackupHeader> {
        let document = parse(bytes)?;
        document
            .verify_checksum()
            .map_err(|e| SyncError::Integrity(e.to_string()))?;
        Ok(document.metadata)
    }

    /// Catalog entries, newest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupMetadata>> {
        let mut backups: Vec<BackupMetadata> =
            store::get_all_typed(self.store.as_ref(), BACKUP_COLLECTION).await?;
        backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(backups)
    }

    pub async fn delete_backup(&self, id: &str) -> Result<()> {
        if !self.store.delete(BACKUP_COLLECTION, id).await? {
            return Err(SyncError::BackupNotFound(id.to_string()));
        }
        tracing::info!(backup_id = %id, "Backup deleted");
        Ok(())
    }

    pub async fn get_backup_stats(&self) -> Result<BackupStats> {
        let backups = self.list_backups().await?;
        Ok(BackupStats {
            count: backups.len(),
            total_size: backups.iter().map(|b| b.size).sum(),
            total_records: backups.iter().map(|b| b.record_count).sum(),
            newest: backups.iter().map(|b| b.timestamp).max(),
            oldest: backups.iter().map(|b| b.timestamp).min(),
        })
    }

    /// Returns whether the record was written.
    async fn restore_record(&self, collection: &str, value: &Value, overwrite: bool) -> Result<bool> {
        let id = record::require_id(value)?;
        if !overwrite && self.store.get_by_key(collection, id).await?.is_some() {
            return Ok(false);
        }
        self.store.put(collection, value).await?;
        Ok(true)
    }
}

fn parse(bytes: &[u8]) -> Result<BackupDocument> {
    BackupDocument::from_slice(bytes).map_err(|e| SyncError::Integrity(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    async fn seeded() -> (Arc<MemoryStore>, BackupManager) {
        let store = Arc::new(MemoryStore::new());
        store
            .put("meetings", &json!({"id": "m-1", "title": "Kickoff"}))
            .await
            .unwrap();
        store
            .put("settings", &json!({"id": "theme", "value": "dark"}))
            .await
            .unwrap();
        store
            .put("_offline_queue", &json!({"id": "op-1"}))
            .await
            .unwrap();
        let manager = BackupManager::new(store.clone()).with_device_id("laptop");
        (store, manager)
    }

    #[tokio::test]
    async fn backup_excludes_internal_collections() {
        let (_store, manager) = seeded().await;
        let artifact = manager.create_backup(&BackupOptions::default()).await.unwrap();

        assert_eq!(artifact.metadata.collections, vec!["meetings", "settings"]);
        assert_eq!(artifact.metadata.record_count, 2);
        assert_eq!(artifact.metadata.size, artifact.bytes.len());

        let header = manager.validate_backup(&artifact.bytes).unwrap();
        assert_eq!(header.device_id.as_deref(), Some("laptop"));
    }

    #[tokio::test]
    async fn selection_and_exclusion() {
        let (_store, manager) = seeded().await;
        let artifact = manager
            .create_backup(&BackupOptions::only(["meetings", "settings"]).excluding("settings"))
            .await
            .unwrap();
        assert_eq!(artifact.metadata.collections, vec!["meetings"]);
    }

    #[tokio::test]
    async fn restore_respects_overwrite_flag() {
        let (store, manager) = seeded().await;
        let artifact = manager.create_backup(&BackupOptions::default()).await.unwrap();

        store
            .put("meetings", &json!({"id": "m-1", "title": "Renamed"}))
            .await
            .unwrap();
        store.delete("settings", "theme").await.unwrap();

        let report = manager
            .restore_backup(&artifact.bytes, &RestoreOptions::default())
            .await
            .unwrap();
        assert_eq!(report.records_processed, 1);
        assert_eq!(report.records_skipped, 1);
        let meeting = store.get_by_key("meetings", "m-1").await.unwrap().unwrap();
        assert_eq!(meeting["title"], json!("Renamed"));

        let overwrite = RestoreOptions {
            overwrite_existing: true,
            ..RestoreOptions::default()
        };
        let report = manager.restore_backup(&artifact.bytes, &overwrite).await.unwrap();
        assert_eq!(report.records_processed, 2);
        let meeting = store.get_by_key("meetings", "m-1").await.unwrap().unwrap();
        assert_eq!(meeting["title"], json!("Kickoff"));
    }

    #[tokio::test]
    async fn catalog_management() {
        let (_store, manager) = seeded().await;
        let first = manager.create_backup(&BackupOptions::default()).await.unwrap();
        manager
            .create_backup(&BackupOptions::only(["meetings"]))
            .await
            .unwrap();

        let stats = manager.get_backup_stats().await.unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.total_records, 3);
        assert!(stats.oldest <= stats.newest);

        manager.delete_backup(&first.metadata.id).await.unwrap();
        assert_eq!(manager.list_backups().await.unwrap().len(), 1);
        assert!(matches!(
            manager.delete_backup(&first.metadata.id).await,
            Err(SyncError::BackupNotFound(_))
        ));
    }

    #[tokio::test]
    async fn garbage_input_is_an_integrity_error() {
        let (_store, manager) = seeded().await;
        let err = manager.validate_backup(b"not json").unwrap_err();
        assert!(err.is_integrity());
    }
}
