//! Callback subscriptions used by storages and engines.
//!
//! `EventBus<T>` fans events out to callbacks; `Topics<T>` keeps one bus per
//! key (doc id, table name). Every subscription is a `Subscription` disposer:
//! hold it to keep receiving events, drop it to unsubscribe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Subscription handle that unsubscribes automatically when dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    dispose: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(dispose: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    /// A subscription with nothing to release.
    pub fn noop() -> Self {
        Self { dispose: None }
    }

    /// Bundle several subscriptions into one disposer.
    pub fn merge(subscriptions: Vec<Subscription>) -> Self {
        Self::new(move || drop(subscriptions))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.dispose.is_some())
            .finish()
    }
}

/// Event bus for publishing events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus<T> {
    callbacks: RwLock<Vec<(usize, Callback<T>)>>,
    next_id: AtomicUsize,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<T: Send + Sync + 'static> EventBus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(self: &Arc<Self>, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));

        let bus: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(bus) = bus.upgrade() {
                bus.unsubscribe(id);
            }
        })
    }

    fn unsubscribe(&self, id: usize) {
        // emit never holds the lock while calling back, so this cannot deadlock.
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: &T) {
        // Snapshot so a callback may subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// One `EventBus` per key. A key's bus is dropped with its last subscriber.
pub struct Topics<T> {
    buses: Arc<Mutex<HashMap<String, Arc<EventBus<T>>>>>,
}

impl<T> Default for Topics<T> {
    fn default() -> Self {
        Self {
            buses: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T: Send + Sync + 'static> Topics<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, key: &str, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        // Subscribe under the map lock so cleanup never drops a bus that is
        // about to gain a subscriber.
        let (bus, inner) = {
            let mut buses = self.buses.lock().unwrap_or_else(|e| e.into_inner());
            let bus = Arc::clone(buses.entry(key.to_string()).or_default());
            let inner = bus.subscribe(callback);
            (bus, inner)
        };

        let map = Arc::downgrade(&self.buses);
        let key = key.to_string();
        Subscription::new(move || {
            let Some(map) = map.upgrade() else {
                drop(inner);
                return;
            };
            let mut buses = map.lock().unwrap_or_else(|e| e.into_inner());
            drop(inner);
            let current = buses.get(&key).is_some_and(|b| Arc::ptr_eq(b, &bus));
            if current && bus.subscriber_count() == 0 {
                buses.remove(&key);
            }
        })
    }

    pub fn emit(&self, key: &str, event: &T) {
        let bus = {
            let buses = self.buses.lock().unwrap_or_else(|e| e.into_inner());
            buses.get(key).cloned()
        };
        if let Some(bus) = bus {
            bus.emit(event);
        }
    }

    /// Keys with at least one live subscriber.
    pub fn key_count(&self) -> usize {
        self.buses.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
