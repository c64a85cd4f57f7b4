//! Remote mirror: a cloud-side key-value store shared by a user's devices.

mod memory;
mod sync;

pub use memory::MemoryMirror;
pub use sync::{MirrorSnapshot, MirrorStatus, MirrorSyncReport, RemoteMirrorSync, SNAPSHOT_KEY};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;

/// Notification that a key changed in the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorChange {
    pub key: String,
}

/// Key-value store backing the remote mirror.
#[async_trait]
pub trait MirrorStore: Send + Sync {
    /// Whether the backend can be used at all in this environment.
    async fn is_available(&self) -> bool;

    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    async fn clear(&self) -> Result<()>;

    /// Receive change notifications, including ones caused by this device.
    fn subscribe(&self) -> broadcast::Receiver<MirrorChange>;
}
