//! Registry of `ConnectionListener`s notified on connect and disconnect.

use std::sync::{Arc, PoisonError, RwLock};

use super::listener::ConnectionListener;

#[derive(Default)]
pub(crate) struct ConnectionListeners {
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
}

impl ConnectionListeners {
    pub(crate) fn add(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.write().unwrap_or_else(PoisonError::into_inner).push(listener);
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub(crate) fn notify_connected(&self) {
        for listener in self.snapshot() {
            listener.on_connection();
        }
    }

    pub(crate) fn notify_disconnected(&self) {
        for listener in self.snapshot() {
            listener.on_disconnection();
        }
    }

    // Callbacks run outside the lock so a listener may register another one.
    fn snapshot(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[derive(Default)]
    struct Balance(AtomicI32);

    impl ConnectionListener for Balance {
        fn on_connection(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn on_disconnection(&self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_notifies_every_listener() {
        let registry = ConnectionListeners::default();
        let a = Arc::new(Balance::default());
        let b = Arc::new(Balance::default());
        registry.add(a.clone());
        registry.add(b.clone());

        registry.notify_connected();
        registry.notify_connected();
        registry.notify_disconnected();

        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 2);
    }
}
