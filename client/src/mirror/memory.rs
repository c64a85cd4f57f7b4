//! In-process mirror store.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;

use super::{MirrorChange, MirrorStore};
use crate::error::{Result, SyncError};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Mirror held in memory. Share one instance between several
/// `RemoteMirrorSync`s to simulate multiple devices.
#[derive(Debug)]
pub struct MemoryMirror {
    entries: DashMap<String, Value>,
    changes: broadcast::Sender<MirrorChange>,
    available: AtomicBool,
    failing: AtomicBool,
}

impl MemoryMirror {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            changes,
            available: AtomicBool::new(true),
            failing: AtomicBool::new(false),
        }
    }

    /// Simulate an environment without mirror support.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make every read and write fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check(&self) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(SyncError::MirrorUnavailable);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::Mirror("mirror backend unreachable".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryMirror {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MirrorStore for MemoryMirror {
    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.check()?;
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.check()?;
        self.entries.insert(key.to_string(), value);
        // No receivers is fine.
        let _ = self.changes.send(MirrorChange {
            key: key.to_string(),
        });
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.check()?;
        self.entries.clear();
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<MirrorChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_notifies_subscribers() {
        let mirror = MemoryMirror::new();
        let mut changes = mirror.subscribe();

        mirror.set("profile", json!({"v": 1})).await.unwrap();

        assert_eq!(changes.recv().await.unwrap().key, "profile");
        assert_eq!(mirror.get("profile").await.unwrap(), Some(json!({"v": 1})));
    }

    #[tokio::test]
    async fn switches_control_failures() {
        let mirror = MemoryMirror::new();
        mirror.set_failing(true);
        assert!(matches!(mirror.get("k").await, Err(SyncError::Mirror(_))));

        mirror.set_failing(false);
        mirror.set_available(false);
        assert!(!mirror.is_available().await);
        assert!(matches!(
            mirror.set("k", json!(1)).await,
            Err(SyncError::MirrorUnavailable)
        ));
    }
}
