//! Status subscriptions.
//!
//! Tracks registered callbacks and fans out status updates to them. A
//! callback that panics is logged and skipped; it never reaches the
//! service that published the update.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use dashmap::DashMap;

/// A registered status callback.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

type Subscribers<T> = DashMap<String, Callback<T>>;

/// Registry of callbacks interested in values of type `T`.
///
/// Thread-safe and can be shared across services via `Arc`.
pub struct SubscriberRegistry<T> {
    subscribers: Arc<Subscribers<T>>,
}

impl<T: 'static> SubscriberRegistry<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(DashMap::new()),
        }
    }

    /// Register a callback.
    ///
    /// The returned handle is the only way to remove it again. Dropping the
    /// handle leaves the callback registered.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = uuid::Uuid::new_v4().to_string();
        self.subscribers.insert(id.clone(), Arc::new(callback));

        tracing::debug!(subscription = %id, "Subscriber registered");

        let registry: Weak<Subscribers<T>> = Arc::downgrade(&self.subscribers);
        let key = id.clone();
        Subscription {
            id,
            remove: Some(Box::new(move || {
                if let Some(subscribers) = registry.upgrade() {
                    if subscribers.remove(&key).is_some() {
                        tracing::debug!(subscription = %key, "Subscriber removed");
                    }
                }
            })),
        }
    }

    /// Deliver `value` to every subscriber.
    ///
    /// Returns the number of callbacks that completed without panicking.
    pub fn notify(&self, value: &T) -> usize {
        // Snapshot first so callbacks may unsubscribe while being notified.
        let callbacks: Vec<(String, Callback<T>)> = self
            .subscribers
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut delivered = 0;
        for (id, callback) in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(value))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::error!(subscription = %id, "Status subscriber panicked");
                }
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Remove every subscriber.
    pub fn clear(&self) {
        self.subscribers.clear();
    }
}

impl<T: 'static> Default for SubscriberRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by `subscribe`; consume it to stop receiving updates.
pub struct Subscription {
    id: String,
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
