//! Backup document format.
//!
//! A backup is one JSON document: a `metadata` header and a `data` body
//! mapping collection names to record arrays. The header checksum covers
//! the serialized body. BTreeMap keeps the body's serialization stable, so
//! re-serializing a parsed document reproduces the hashed bytes.

use crate::{error::Result, integrity, CollectionName, Error, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Version of the backup format for future compatibility.
pub const BACKUP_FORMAT_VERSION: u32 = 1;

/// Header of a backup document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupHeader {
    pub version: u32,
    pub timestamp: Timestamp,
    pub collections: Vec<CollectionName>,
    pub checksum: String,
    #[serde(default)]
    pub record_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// A complete backup: header plus records by collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupDocument {
    pub metadata: BackupHeader,
    pub data: BTreeMap<CollectionName, Vec<Value>>,
}

impl BackupDocument {
    /// Build a document and stamp its checksum.
    pub fn new(
        timestamp: Timestamp,
        data: BTreeMap<CollectionName, Vec<Value>>,
        device_id: Option<String>,
    ) -> Result<Self> {
        let mut document = Self {
            metadata: BackupHeader {
                version: BACKUP_FORMAT_VERSION,
                timestamp,
                collections: data.keys().cloned().collect(),
                checksum: String::new(),
                record_count: data.values().map(Vec::len).sum(),
                device_id,
            },
            data,
        };
        document.metadata.checksum = document.data_checksum()?;
        Ok(document)
    }

    /// Checksum of the serialized body.
    pub fn data_checksum(&self) -> Result<String> {
        let bytes =
            serde_json::to_vec(&self.data).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(integrity::checksum_bytes(&bytes))
    }

    /// Check the body against the header checksum.
    pub fn verify_checksum(&self) -> Result<()> {
        integrity::verify(&self.metadata.checksum, &self.data_checksum()?)
    }

    /// Records of one collection, empty if the backup does not include it.
    pub fn records(&self, collection: &str) -> &[Value] {
        self.data.get(collection).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn record_count(&self) -> usize {
        self.data.values().map(Vec::len).sum()
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Serialize to pretty JSON.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Parse a document, rejecting unknown future versions.
    ///
    /// The checksum is not verified here; see [`Self::verify_checksum`].
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let document: Self =
            serde_json::from_slice(bytes).map_err(|e| Error::InvalidBackup(e.to_string()))?;

        if document.metadata.version > BACKUP_FORMAT_VERSION {
            return Err(Error::UnsupportedBackupVersion {
                found: document.metadata.version,
                supported: BACKUP_FORMAT_VERSION,
            });
        }

        if let Some(missing) = document
            .metadata
            .collections
            .iter()
            .find(|name| !document.data.contains_key(*name))
        {
            return Err(Error::InvalidBackup(format!(
                "header lists collection '{missing}' with no data"
            )));
        }

        Ok(document)
    }
}

/// Catalog entry describing a backup without its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub id: String,
    pub timestamp: Timestamp,
    pub version: u32,
    /// Payload size in bytes
    pub size: usize,
    pub collections: Vec<CollectionName>,
    pub checksum: String,
    pub compressed: bool,
    pub encrypted: bool,
    #[serde(default)]
    pub record_count: usize,
}

impl BackupMetadata {
    /// Describe a serialized document.
    pub fn describe(id: impl Into<String>, document: &BackupDocument, size: usize) -> Self {
        Self {
            id: id.into(),
            timestamp: document.metadata.timestamp,
            version: document.metadata.version,
            size,
            collections: document.metadata.collections.clone(),
            checksum: document.metadata.checksum.clone(),
            compressed: false,
            encrypted: false,
            record_count: document.metadata.record_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_data() -> BTreeMap<CollectionName, Vec<Value>> {
        let mut data = BTreeMap::new();
        data.insert(
            "meetings".to_string(),
            vec![
                json!({"id": "m-1", "title": "Standup", "duration": 12.5}),
                json!({"id": "m-2", "title": "Retro", "tags": ["team", "q3"]}),
            ],
        );
        data.insert(
            "settings".to_string(),
            vec![json!({"id": "theme", "value": "dark"})],
        );
        data
    }

    #[test]
    fn new_document_carries_header() {
        let doc = BackupDocument::new(1000, sample_data(), Some("device-1".into())).unwrap();
        assert_eq!(doc.metadata.version, BACKUP_FORMAT_VERSION);
        assert_eq!(doc.metadata.collections, vec!["meetings", "settings"]);
        assert_eq!(doc.metadata.record_count, 3);
        assert_eq!(doc.metadata.checksum.len(), 64);
        assert!(doc.verify_checksum().is_ok());
    }

    #[test]
    fn parsed_document_still_verifies() {
        let doc = BackupDocument::new(1000, sample_data(), None).unwrap();
        let bytes = doc.to_bytes().unwrap();
        let parsed = BackupDocument::from_slice(&bytes).unwrap();
        assert!(parsed.verify_checksum().is_ok());
        assert_eq!(parsed.records("meetings").len(), 2);
        assert!(parsed.records("transcripts").is_empty());
    }

    #[test]
    fn tampered_body_fails_verification() {
        let mut doc = BackupDocument::new(1000, sample_data(), None).unwrap();
        doc.data.get_mut("settings").unwrap()[0]["value"] = json!("light");
        assert!(matches!(
            doc.verify_checksum(),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn wire_format_uses_metadata_and_data() {
        let doc = BackupDocument::new(1000, sample_data(), None).unwrap();
        let value: Value = serde_json::from_slice(&doc.to_bytes().unwrap()).unwrap();
        assert_eq!(value["metadata"]["version"], 1);
        assert_eq!(value["metadata"]["timestamp"], 1000);
        assert!(value["metadata"]["checksum"].is_string());
        assert!(value["data"]["meetings"].is_array());
    }

    #[test]
    fn reject_future_format_version() {
        let json = br#"{
            "metadata": {"version": 999, "timestamp": 1, "collections": [], "checksum": ""},
            "data": {}
        }"#;
        assert!(matches!(
            BackupDocument::from_slice(json),
            Err(Error::UnsupportedBackupVersion { found: 999, .. })
        ));
    }

    #[test]
    fn reject_header_without_data() {
        let json = br#"{
            "metadata": {"version": 1, "timestamp": 1, "collections": ["meetings"], "checksum": ""},
            "data": {}
        }"#;
        assert!(matches!(
            BackupDocument::from_slice(json),
            Err(Error::InvalidBackup(_))
        ));
        assert!(BackupDocument::from_slice(b"not json").is_err());
    }

    #[test]
    fn metadata_describes_document() {
        let doc = BackupDocument::new(1000, sample_data(), None).unwrap();
        let meta = BackupMetadata::describe("b-1", &doc, 512);
        assert_eq!(meta.id, "b-1");
        assert_eq!(meta.size, 512);
        assert_eq!(meta.record_count, 3);
        assert!(!meta.compressed);
        assert!(!meta.encrypted);
    }
}
