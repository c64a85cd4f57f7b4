//! Checksums shared by checkpoints, mirror snapshots and backups.
//!
//! All checksums are lowercase hex SHA-256 digests. Record sets are hashed
//! in id order so two stores holding the same records agree on the digest
//! regardless of iteration order.

use crate::{error::Result, record, Error};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hash raw bytes.
pub fn checksum_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash a JSON value through its canonical serialization.
pub fn checksum_value(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))?;
    Ok(checksum_bytes(&bytes))
}

/// Hash a set of records independent of their order.
pub fn checksum_records<'a>(records: impl IntoIterator<Item = &'a Value>) -> Result<String> {
    let mut sorted: Vec<&Value> = records.into_iter().collect();
    sorted.sort_by(|a, b| record::record_id(a).cmp(&record::record_id(b)));

    let mut hasher = Sha256::new();
    for record in sorted {
        let bytes =
            serde_json::to_vec(record).map_err(|e| Error::Serialization(e.to_string()))?;
        hasher.update(&bytes);
        hasher.update(b"\n");
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compare an expected checksum against a freshly computed one.
pub fn verify(expected: &str, actual: &str) -> Result<()> {
    if expected.eq_ignore_ascii_case(actual) {
        Ok(())
    } else {
        Err(Error::ChecksumMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn checksum_is_hex_sha256() {
        assert_eq!(
            checksum_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn record_checksum_ignores_order() {
        let a = json!({"id": "a", "title": "one"});
        let b = json!({"id": "b", "title": "two"});

        let forward = checksum_records([&a, &b]).unwrap();
        let backward = checksum_records([&b, &a]).unwrap();
        assert_eq!(forward, backward);

        let changed = json!({"id": "b", "title": "three"});
        assert_ne!(forward, checksum_records([&a, &changed]).unwrap());
    }

    #[test]
    fn verify_reports_mismatch() {
        assert!(verify("ABC", "abc").is_ok());
        assert!(matches!(
            verify("abc", "abd"),
            Err(Error::ChecksumMismatch { .. })
        ));
    }
}
