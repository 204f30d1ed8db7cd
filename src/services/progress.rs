//! In-process progress notifications.
//!
//! Advisory only: nothing here crosses the process boundary. Callers poll
//! job status; listeners exist for instrumentation and future streaming.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::models::job::ProgressEvent;

/// Destination for progress events raised by the worker and reconciler.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, event: &ProgressEvent);
}

type Listener = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

/// Listener registry invoking callbacks synchronously in registration order.
#[derive(Default, Clone)]
pub struct ProgressBus {
    registry: Arc<Registry>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. It stays registered until the returned handle is cancelled.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.registry
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl ProgressSink for ProgressBus {
    fn publish(&self, event: &ProgressEvent) {
        // Snapshot first so listeners may subscribe or cancel while being notified.
        let listeners: Vec<Listener> = self
            .registry
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(event);
        }
    }
}

/// Handle returned by [`ProgressBus::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Unregister the listener. Returns false if it was already gone.
    pub fn cancel(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut listeners = registry
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != self.id);
        listeners.len() != before
    }
}
