//! Operation executors.
//!
//! The executor is the seam between the offline queue and whatever the
//! queued mutation ultimately targets. The queue only knows that an
//! execution succeeded or failed.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tether_engine::{record, OperationKind, QueuedOperation};

use crate::error::{Result, SyncError};
use crate::store::LocalStore;

/// Applies one queued operation, failing with an error the queue records.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, op: &QueuedOperation) -> Result<()>;
}

/// Applies operations to a local store.
///
/// Creates replace the record, updates shallow-merge the payload over the
/// stored record, deletes remove it (absence is not an error).
pub struct StoreExecutor {
    store: Arc<dyn LocalStore>,
}

impl StoreExecutor {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl OperationExecutor for StoreExecutor {
    async fn execute(&self, op: &QueuedOperation) -> Result<()> {
        let id = op
            .record_id()
            .ok_or_else(|| SyncError::Execution(format!("operation {} has no record id", op.id)))?;

        match op.kind {
            OperationKind::Create => self.store.put(&op.collection, &op.payload).await,
            OperationKind::Update => {
                let merged = match self.store.get_by_key(&op.collection, id).await? {
                    Some(Value::Object(mut existing)) => {
                        if let Value::Object(changes) = &op.payload {
                            for (field, value) in changes {
                                existing.insert(field.clone(), value.clone());
                            }
                        }
                        Value::Object(existing)
                    }
                    _ => op.payload.clone(),
                };
                self.store.put(&op.collection, &merged).await
            }
            OperationKind::Delete => {
                if !self.store.delete(&op.collection, id).await? {
                    tracing::debug!(
                        collection = %op.collection,
                        record_id = %id,
                        "Delete target already absent"
                    );
                }
                Ok(())
            }
        }
    }
}

/// Reject payloads whose target record cannot be identified.
pub(crate) fn validate_payload(kind: OperationKind, payload: &Value) -> Result<()> {
    record::require_id(payload).map_err(|e| {
        SyncError::BadRequest(format!("{} payload rejected: {e}", kind_name(kind)))
    })?;
    Ok(())
}

fn kind_name(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::Create => "create",
        OperationKind::Update => "update",
        OperationKind::Delete => "delete",
    }
}
