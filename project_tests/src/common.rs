//! Shared fixtures for the proxy integration tests.
#![allow(dead_code)]

use lib_tagstream::broker::MemoryBroker;
use lib_tagstream::{ConnectionListener, ProxyConfig, ServerUpdate, TagProxy, UpdateListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Fast reconnects so failure scenarios settle in milliseconds.
pub fn fast_config() -> ProxyConfig {
    ProxyConfig { reconnect_interval_ms: 20, request_timeout_ms: 500, ..ProxyConfig::default() }
}

pub fn proxy_on(broker: &MemoryBroker) -> TagProxy {
    TagProxy::new(broker.connection_factory(), fast_config()).expect("valid config")
}

/// Starts a proxy on `broker` and waits until it is connected.
pub async fn connected_proxy(broker: &MemoryBroker) -> TagProxy {
    let proxy = proxy_on(broker);
    proxy.start().expect("start");
    wait_until("initial connection", || proxy.is_connected()).await;
    proxy
}

/// Polls `condition` every 5ms for up to 5s.
pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Records every update as `(subscription id, payload)`.
#[derive(Default)]
pub struct Recorder {
    updates: Mutex<Vec<(u64, String)>>,
}

impl Recorder {
    pub fn updates(&self) -> Vec<(u64, String)> {
        self.updates.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }
}

impl UpdateListener for Recorder {
    fn on_update(&self, update: &ServerUpdate<'_>) {
        self.updates.lock().unwrap().push((update.subscription_id, update.payload.to_string()));
    }
}

pub fn recorder() -> (Arc<Recorder>, Arc<dyn UpdateListener>) {
    let concrete = Arc::new(Recorder::default());
    let erased: Arc<dyn UpdateListener> = concrete.clone();
    (concrete, erased)
}

/// Counts connection events.
#[derive(Default)]
pub struct LinkCounter {
    pub connections: AtomicUsize,
    pub disconnections: AtomicUsize,
}

impl LinkCounter {
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn disconnections(&self) -> usize {
        self.disconnections.load(Ordering::SeqCst)
    }
}

impl ConnectionListener for LinkCounter {
    fn on_connection(&self) {
        self.connections.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnection(&self) {
        self.disconnections.fetch_add(1, Ordering::SeqCst);
    }
}
