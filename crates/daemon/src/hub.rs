//! Multi-subscriber fan-out with replay of the latest value.
//!
//! A hub keeps a registry of subscriber id -> unbounded channel behind one
//! mutex. Publishing, subscribing and unsubscribing are each a single short
//! critical section, so every subscriber observes values in publish order and
//! an unsubscribe racing a publish is harmless.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use uuid::Uuid;

struct HubInner<T> {
    latest: Option<T>,
    subscribers: HashMap<Uuid, mpsc::UnboundedSender<T>>,
}

/// Broadcast primitive shared by the snapshot and fact streams.
///
/// Cloning yields another handle to the same hub.
pub struct BroadcastHub<T> {
    inner: Arc<Mutex<HubInner<T>>>,
}

impl<T> Clone for BroadcastHub<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> Default for BroadcastHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(inner: &Mutex<HubInner<T>>) -> MutexGuard<'_, HubInner<T>> {
    // Hub state stays consistent even if a holder panicked: every critical
    // section is a single insert/remove/iterate.
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T: Clone> BroadcastHub<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                latest: None,
                subscribers: HashMap::new(),
            })),
        }
    }

    /// Register a new subscriber. The latest value, if any, is delivered first.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        let mut inner = lock(&self.inner);
        if let Some(latest) = &inner.latest {
            let _ = tx.send(latest.clone());
        }
        inner.subscribers.insert(id, tx);

        Subscription {
            id,
            rx,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Cache `value` as the latest and push it to every live subscriber.
    ///
    /// Subscribers whose receiving side is gone are pruned on the way.
    pub fn publish(&self, value: T) {
        let mut inner = lock(&self.inner);
        inner
            .subscribers
            .retain(|_, tx| tx.send(value.clone()).is_ok());
        inner.latest = Some(value);
    }

    /// Latest published value, if any.
    pub fn latest(&self) -> Option<T> {
        lock(&self.inner).latest.clone()
    }

    /// Forget the cached value so late subscribers start empty.
    pub fn clear_latest(&self) {
        lock(&self.inner).latest = None;
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }
}

/// Receiving end of a hub registration.
///
/// Dropping it (or calling [`Subscription::unsubscribe`]) removes the
/// registry entry. The subscription never keeps the hub alive.
pub struct Subscription<T> {
    id: Uuid,
    rx: mpsc::UnboundedReceiver<T>,
    hub: Weak<Mutex<HubInner<T>>>,
}

impl<T> Subscription<T> {
    /// Wait for the next value. `None` once the hub is gone and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Next value if one is already queued.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade() {
            lock(&inner).subscribers.remove(&self.id);
        }
    }
}
