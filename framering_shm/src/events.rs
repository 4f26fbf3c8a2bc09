//! Callback registries for stream and session events
//!
//! Each event documents the thread it is raised on. Buffer events and reader
//! faults fire on the reader's background thread; writer faults fire on the
//! thread that queried or released the write handle.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Token returned by [`EventRegistry::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Thread-safe list of subscribers to one event.
///
/// `F` is normally a `dyn Fn(..) + Send + Sync` type.
pub struct EventRegistry<F: ?Sized> {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, Arc<F>)>>,
}

impl<F: ?Sized> EventRegistry<F> {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Add a subscriber
    pub fn subscribe(&self, callback: Arc<F>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push((id, callback));
        id
    }

    /// Remove a subscriber; returns whether it was registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Number of subscribers
    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Whether nobody is subscribed
    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }

    /// Invoke `call` once per subscriber.
    ///
    /// Subscribers are snapshotted first and the list lock is not held while
    /// they run, so a callback may subscribe or unsubscribe.
    pub fn emit(&self, mut call: impl FnMut(&F)) {
        let snapshot: Vec<Arc<F>> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in snapshot {
            call(&callback);
        }
    }
}

impl<F: ?Sized> Default for EventRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> std::fmt::Debug for EventRegistry<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("subscribers", &self.len())
            .finish()
    }
}
