//! Observable Attributes
//!
//! Reactive values used for the `position`, `speed`, `referenced` and `state`
//! attributes of every actuator. Two notification paths are offered:
//!
//! - `tokio::sync::watch` receivers for async consumers (GUI, loggers) that
//!   want to wait for changes without polling.
//! - A listener registry for synchronous callbacks. This is what composite
//!   actuators use to follow their dependencies: the callback runs on
//!   whichever thread published the new value, so it must only recompute and
//!   republish a snapshot.
//!
//! # Example
//!
//! ```rust,ignore
//! let position = Observable::new("position", Position::new());
//!
//! // Synchronous listener, called right away with the current value
//! let id = position.subscribe_with(true, |pos| println!("now at {:?}", pos));
//!
//! // Async subscriber
//! let mut rx = position.subscribe();
//! tokio::spawn(async move {
//!     while rx.changed().await.is_ok() {
//!         println!("Position changed to: {:?}", *rx.borrow());
//!     }
//! });
//!
//! position.unsubscribe(id);
//! ```

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Identifier returned by [`Observable::subscribe_with`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Mutex-guarded list of synchronous listeners, shared by all clones of an
/// observable.
struct ListenerRegistry<T> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Listener<T>)>>,
}

impl<T> ListenerRegistry<T> {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, listener: Listener<T>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn notify(&self, value: &T) {
        // Snapshot so listeners may (un)subscribe from within their callback.
        let snapshot: Vec<Listener<T>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            listener(value);
        }
    }

    fn len(&self) -> usize {
        self.listeners.lock().len()
    }
}

// =============================================================================
// Observable<T>
// =============================================================================

/// A thread-safe, observable value with change notifications.
///
/// Clones share the same value, watch channel and listener registry. Only
/// this crate publishes new values, so the attributes an actuator exposes are
/// read-only for its clients.
pub struct Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Attribute name (unique within an actuator)
    name: Arc<str>,
    /// The watch channel sender (holds current value)
    sender: watch::Sender<T>,
    /// Synchronous listeners
    listeners: Arc<ListenerRegistry<T>>,
}

impl<T: Clone + Send + Sync + 'static> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("name", &self.name)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            sender: self.sender.clone(),
            listeners: Arc::clone(&self.listeners),
        }
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new observable with an initial value.
    pub fn new(name: impl Into<String>, initial_value: T) -> Self {
        let (sender, _) = watch::channel(initial_value);
        Self {
            name: Arc::from(name.into()),
            sender,
            listeners: Arc::new(ListenerRegistry::new()),
        }
    }

    /// Get the current value (clone).
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Get the attribute name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the value and notify all subscribers.
    ///
    /// Listeners are called even if the value did not change.
    pub(crate) fn publish(&self, value: T) {
        self.sender.send_replace(value.clone());
        self.listeners.notify(&value);
    }

    /// Subscribe to value changes.
    ///
    /// Returns a receiver that can be used to wait for changes:
    /// ```rust,ignore
    /// let mut rx = observable.subscribe();
    /// while rx.changed().await.is_ok() {
    ///     let value = rx.borrow().clone();
    ///     // Handle new value
    /// }
    /// ```
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }

    /// Register a synchronous listener.
    ///
    /// If `init` is true the listener is called immediately with the current
    /// value, before this function returns.
    pub fn subscribe_with<F>(&self, init: bool, listener: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let listener: Listener<T> = Arc::new(listener);
        let id = self.listeners.add(Arc::clone(&listener));
        if init {
            let current = self.get();
            listener(&current);
        }
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Number of synchronous listeners currently registered.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_observable_basic() {
        let obs = Observable::new("test", 42);
        assert_eq!(obs.get(), 42);
        assert_eq!(obs.name(), "test");

        obs.publish(100);
        assert_eq!(obs.get(), 100);
    }

    #[test]
    fn test_listener_init_and_unsubscribe() {
        let obs = Observable::new("value", 5);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = Arc::clone(&seen);
        let id = obs.subscribe_with(true, move |v| seen_clone.lock().push(*v));
        obs.publish(6);
        assert!(obs.unsubscribe(id));
        obs.publish(7);

        assert_eq!(*seen.lock(), vec![5, 6]);
        assert!(!obs.unsubscribe(id));
        assert_eq!(obs.listener_count(), 0);
    }

    #[test]
    fn test_clones_share_listeners() {
        let obs = Observable::new("value", 0);
        let clone = obs.clone();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = Arc::clone(&count);
        obs.subscribe_with(false, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        clone.publish(1);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(obs.get(), 1);
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let obs = Observable::new("value", 0);
        let obs_clone = obs.clone();
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let slot_clone = Arc::clone(&slot);
        let id = obs.subscribe_with(false, move |_| {
            if let Some(id) = *slot_clone.lock() {
                obs_clone.unsubscribe(id);
            }
        });
        *slot.lock() = Some(id);

        obs.publish(1);
        assert_eq!(obs.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_observable_subscription() {
        let obs = Observable::new("value", 0);
        let mut rx = obs.subscribe();

        // Initial value
        assert_eq!(*rx.borrow(), 0);

        // Update and check
        obs.publish(42);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 42);
    }
}
