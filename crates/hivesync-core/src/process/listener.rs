//! Typed result listeners with exactly-once delivery.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<T> = Box<dyn FnOnce(&T) + Send>;

enum Registry<T> {
    Pending(Vec<(ListenerId, Listener<T>)>),
    Delivered,
}

/// Listener registry of a result-bearing process.
///
/// The registry is taken out under the lock in one step when the result is
/// delivered, so a listener runs exactly once or, if it attaches after
/// delivery, not at all. Listeners run outside the lock in attachment order.
pub struct ResultListeners<T> {
    next_id: AtomicU64,
    registry: Mutex<Registry<T>>,
}

impl<T> Default for ResultListeners<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            registry: Mutex::new(Registry::Pending(Vec::new())),
        }
    }
}

impl<T> ResultListeners<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener`. Returns `None` once the result was delivered.
    pub fn attach<F>(&self, listener: F) -> Option<ListenerId>
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let mut registry = self.registry.lock();
        match &mut *registry {
            Registry::Pending(listeners) => {
                let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
                listeners.push((id, Box::new(listener)));
                Some(id)
            }
            Registry::Delivered => None,
        }
    }

    pub fn detach(&self, id: ListenerId) -> bool {
        let mut registry = self.registry.lock();
        match &mut *registry {
            Registry::Pending(listeners) => {
                let before = listeners.len();
                listeners.retain(|(l, _)| *l != id);
                listeners.len() != before
            }
            Registry::Delivered => false,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(*self.registry.lock(), Registry::Delivered)
    }

    pub fn pending(&self) -> usize {
        match &*self.registry.lock() {
            Registry::Pending(listeners) => listeners.len(),
            Registry::Delivered => 0,
        }
    }

    /// Deliver `value` to every attached listener. Only the first call
    /// delivers; returns how many listeners ran.
    pub fn notify(&self, value: &T) -> usize {
        let taken = std::mem::replace(&mut *self.registry.lock(), Registry::Delivered);
        match taken {
            Registry::Pending(listeners) => {
                let count = listeners.len();
                for (_, listener) in listeners {
                    listener(value);
                }
                count
            }
            Registry::Delivered => 0,
        }
    }
}
