//! Owned state containers with synchronous subscriber fan-out.

use std::sync::Mutex;

/// Identifies one subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    value: T,
    subscribers: Vec<(SubscriptionId, Callback<T>)>,
    next_id: u64,
}

/// A state cell whose writes and subscriber notifications happen under one
/// lock: every callback observes exactly the stored value, in subscription
/// order, and no reader ever sees a torn value.
///
/// Callbacks run synchronously on the writing thread. They must not call back
/// into the notifier they are registered on, and they must not block; slow
/// subscribers should hand the value off to their own task.
pub struct StateNotifier<T> {
    inner: Mutex<Registry<T>>,
}

impl<T: Clone> StateNotifier<T> {
    pub fn new(initial: T) -> Self {
        StateNotifier {
            inner: Mutex::new(Registry {
                value: initial,
                subscribers: Vec::new(),
                next_id: 0,
            }),
        }
    }

    /// The currently stored value.
    pub fn get(&self) -> T {
        self.inner.lock().unwrap().value.clone()
    }

    /// Store a new value and notify every subscriber with it.
    pub fn set_and_notify(&self, value: T) {
        let mut inner = self.inner.lock().unwrap();
        inner.value = value;
        for (_, callback) in &inner.subscribers {
            callback(&inner.value);
        }
    }

    /// Compute a replacement from the current value under the same lock the
    /// notification runs under. Returning `None` leaves the value untouched
    /// and notifies nobody; returning `Some` stores, notifies, and yields the
    /// stored value.
    pub fn update_and_notify(&self, update: impl FnOnce(&T) -> Option<T>) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        let new_value = update(&inner.value)?;
        inner.value = new_value;
        for (_, callback) in &inner.subscribers {
            callback(&inner.value);
        }
        Some(inner.value.clone())
    }

    /// Register a callback for every subsequent value. Use [`get`] for the
    /// current one.
    ///
    /// [`get`]: StateNotifier::get
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        let mut inner = self.inner.lock().unwrap();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.subscribers.push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.retain(|(existing, _)| *existing != id);
    }
}
