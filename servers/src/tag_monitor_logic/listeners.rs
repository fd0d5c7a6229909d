//! # Monitor Listeners
//!
//! Log-only observers wired into the proxy by the tag monitor.

use lib_tagstream::{ConnectionListener, ServerUpdate, SupervisionListener, UpdateListener};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// Logs every update arriving on one topic.
#[derive(Default)]
pub struct TopicLogger {
    received: AtomicU64,
}

impl TopicLogger {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

impl UpdateListener for TopicLogger {
    fn on_update(&self, update: &ServerUpdate<'_>) {
        let count = self.received.fetch_add(1, Ordering::Relaxed) + 1;
        log::info!("[{} #{}] update {}: {}", update.topic, update.subscription_id, count, update.payload);
    }
}

/// Logs supervision events and connection changes, and publishes the
/// connection state on a watch channel.
pub struct LinkMonitor {
    connected: watch::Sender<bool>,
}

impl Default for LinkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkMonitor {
    pub fn new() -> Self {
        let (connected, _) = watch::channel(false);
        Self { connected }
    }

    /// A receiver that observes every connect and disconnect.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}

impl SupervisionListener for LinkMonitor {
    fn on_supervision_event(&self, payload: &str) {
        log::warn!("Supervision event: {}", payload);
    }
}

impl ConnectionListener for LinkMonitor {
    fn on_connection(&self) {
        log::info!("Broker connection established.");
        self.connected.send_replace(true);
    }

    fn on_disconnection(&self) {
        log::warn!("Broker connection lost.");
        self.connected.send_replace(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_monitor_tracks_connection() {
        let monitor = LinkMonitor::new();
        let rx = monitor.subscribe();
        monitor.on_connection();
        assert!(*rx.borrow());
        monitor.on_disconnection();
        assert!(!*rx.borrow());
    }

    #[test]
    fn test_topic_logger_counts_updates() {
        let logger = TopicLogger::default();
        logger.on_update(&ServerUpdate { topic: "t", subscription_id: 1, payload: "x" });
        logger.on_update(&ServerUpdate { topic: "t", subscription_id: 1, payload: "y" });
        assert_eq!(logger.received(), 2);
    }
}
