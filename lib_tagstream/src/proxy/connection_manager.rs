//! # Connection Manager
//!
//! Owns the broker connection and its lifecycle.
//!
//! ## Connect loop
//!
//! Until connected or shut down: create a connection, then under the refresh
//! write lock install the exception listener, replay every recorded subscription
//! onto it, resubscribe the supervision channel, start delivery and mark the
//! proxy connected. A failed attempt closes whatever it half-opened and sleeps
//! for the reconnect interval. Connection listeners hear `on_connection` once the
//! loop succeeds.
//!
//! ## Reconnect
//!
//! Triggered by the broker's exception listener or by a failed session close.
//! Serialized by the connecting lock and the `reconnecting` flag, so concurrent
//! triggers produce at most one disconnect and one connect loop.
//!
//! A failure reported while the connect loop still owns the connection cannot
//! start a reconnect itself. It is recorded against the connection's generation
//! instead, and the loop hands it back to its caller once it lets go.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, Notify, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::connection_listeners::ConnectionListeners;
use crate::broker::{BrokerConnection, BrokerError, ConnectionFactory, ExceptionListener};

/// Where the proxy's connection lifecycle currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    /// `start` has not been called yet.
    Unstarted,
    /// The connect loop is running.
    Connecting,
    /// Connected with every subscription active.
    Connected,
    /// Connection lost; a connect loop is pending or sleeping.
    Disconnected,
    /// Stopped for good.
    Shutdown,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Disconnected,
            4 => ConnectionState::Shutdown,
            _ => ConnectionState::Unstarted,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Unstarted => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Disconnected => 3,
            ConnectionState::Shutdown => 4,
        }
    }
}

/// Re-establishes every subscription on a freshly created connection.
#[async_trait]
pub(crate) trait Resubscribe: Send + Sync {
    async fn resubscribe(&self, connection: &dyn BrokerConnection) -> Result<(), BrokerError>;
}

pub(crate) struct ConnectionManager {
    factory: Arc<dyn ConnectionFactory>,
    reconnect_interval: Duration,
    connection: RwLock<Option<Arc<dyn BrokerConnection>>>,
    generation: AtomicU64,
    failed_generation: AtomicU64,
    state: AtomicU8,
    connected: AtomicBool,
    running: AtomicBool,
    shutdown_requested: AtomicBool,
    reconnecting: AtomicBool,
    connecting_lock: Mutex<()>,
    refresh_lock: RwLock<()>,
    shutdown_signal: Notify,
    pub(crate) listeners: ConnectionListeners,
}

impl ConnectionManager {
    pub(crate) fn new(factory: Arc<dyn ConnectionFactory>, reconnect_interval: Duration) -> Self {
        Self {
            factory,
            reconnect_interval,
            connection: RwLock::new(None),
            generation: AtomicU64::new(0),
            failed_generation: AtomicU64::new(0),
            state: AtomicU8::new(ConnectionState::Unstarted.as_u8()),
            connected: AtomicBool::new(false),
            running: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            connecting_lock: Mutex::new(()),
            refresh_lock: RwLock::new(()),
            shutdown_signal: Notify::new(),
            listeners: ConnectionListeners::default(),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    // Shutdown is terminal: later transitions are ignored.
    fn set_state(&self, state: ConnectionState) {
        let shutdown = ConnectionState::Shutdown.as_u8();
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| (current != shutdown).then_some(state.as_u8()));
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Records that connection `generation` reported a broker failure.
    pub(crate) fn report_failure(&self, generation: u64) {
        self.failed_generation.fetch_max(generation, Ordering::SeqCst);
    }

    /// Shared side of the refresh lock, held around every registry operation.
    pub(crate) async fn refresh_read(&self) -> RwLockReadGuard<'_, ()> {
        self.refresh_lock.read().await
    }

    /// Exclusive side of the refresh lock.
    pub(crate) async fn refresh_write(&self) -> RwLockWriteGuard<'_, ()> {
        self.refresh_lock.write().await
    }

    /// The live connection, or `None` while disconnected.
    pub(crate) async fn live_connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        if !self.is_connected() {
            return None;
        }
        self.connection.read().await.clone()
    }

    /// Marks the manager running and claims the connect loop. Returns `false` if
    /// already started or shut down, in which case no loop must be spawned.
    pub(crate) fn begin_start(&self) -> bool {
        if self.is_shutdown() || self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.reconnecting.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting);
        true
    }

    /// # Connect Loop
    ///
    /// Runs until connected or shut down. The caller must have claimed the loop
    /// through `begin_start` or `begin_reconnect`.
    ///
    /// Returns the generation of the new connection if it already reported a
    /// failure that nobody acted on; the caller must then reconnect it.
    pub(crate) async fn connect_loop<F>(&self, target: &dyn Resubscribe, exception_listener: F) -> Option<u64>
    where
        F: Fn(u64) -> ExceptionListener + Send + Sync,
    {
        while !self.is_connected() && !self.is_shutdown() {
            self.set_state(ConnectionState::Connecting);
            match self.attempt(target, &exception_listener).await {
                Ok(()) => {
                    log::info!("Connection to broker established; all subscriptions active.");
                }
                Err(e) => {
                    log::error!(
                        "Exception caught while trying to refresh the broker connection; sleeping {:?} before retrying: {}",
                        self.reconnect_interval,
                        e
                    );
                    self.set_state(ConnectionState::Disconnected);
                    tokio::select! {
                        _ = tokio::time::sleep(self.reconnect_interval) => {}
                        _ = self.shutdown_signal.notified() => {}
                    }
                }
            }
        }
        self.reconnecting.store(false, Ordering::SeqCst);

        if !self.is_connected() || self.is_shutdown() {
            return None;
        }
        self.listeners.notify_connected();
        let generation = self.generation();
        (self.failed_generation.load(Ordering::SeqCst) >= generation).then_some(generation)
    }

    async fn attempt<F>(&self, target: &dyn Resubscribe, exception_listener: &F) -> Result<(), BrokerError>
    where
        F: Fn(u64) -> ExceptionListener + Send + Sync,
    {
        let connection = self.factory.create_connection().await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let result = self.activate(&connection, target, exception_listener(generation)).await;
        if result.is_err() {
            if let Err(close_err) = connection.close().await {
                log::warn!("Failed to close half-opened connection: {}", close_err);
            }
        }
        result
    }

    // --- Refresh: everything below runs under the refresh write lock ---
    async fn activate(
        &self,
        connection: &Arc<dyn BrokerConnection>,
        target: &dyn Resubscribe,
        exception_listener: ExceptionListener,
    ) -> Result<(), BrokerError> {
        let _refresh = self.refresh_lock.write().await;
        if self.is_shutdown() {
            return Err(BrokerError::ConnectionClosed("proxy shut down while connecting".to_string()));
        }
        connection.set_exception_listener(exception_listener);
        target.resubscribe(connection.as_ref()).await?;
        connection.start().await?;

        // Committed under the connection slot lock so a concurrent `stop` either
        // sees this connection and closes it, or is seen here.
        let mut slot = self.connection.write().await;
        if self.is_shutdown() {
            return Err(BrokerError::ConnectionClosed("proxy shut down while connecting".to_string()));
        }
        *slot = Some(Arc::clone(connection));
        self.connected.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    /// # Begin Reconnect
    ///
    /// Disconnects and claims a new connect loop, unless not connected, a loop
    /// is already active, or the live connection is not `generation` (when
    /// given). Returns whether the caller must spawn the loop.
    pub(crate) async fn begin_reconnect(&self, generation: Option<u64>) -> bool {
        let _connecting = self.connecting_lock.lock().await;
        if !self.is_connected() || self.is_shutdown() {
            return false;
        }
        if generation.is_some_and(|g| g != self.generation()) {
            return false;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.disconnect().await;
        true
    }

    /// Drops the live connection, notifies listeners and closes it.
    pub(crate) async fn disconnect(&self) {
        let previous = {
            let mut slot = self.connection.write().await;
            self.connected.store(false, Ordering::SeqCst);
            slot.take()
        };
        self.set_state(ConnectionState::Disconnected);
        let Some(previous) = previous else {
            return;
        };
        self.listeners.notify_disconnected();
        if let Err(e) = previous.close().await {
            log::error!("Exception caught while attempting to disconnect from broker: {}", e);
        }
    }

    /// Stops for good: no further connect attempts, connection closed.
    pub(crate) async fn shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.shutdown_signal.notify_waiters();
        let _connecting = self.connecting_lock.lock().await;
        self.disconnect().await;
        self.running.store(false, Ordering::SeqCst);
        self.state.store(ConnectionState::Shutdown.as_u8(), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingTarget(AtomicUsize);

    #[async_trait]
    impl Resubscribe for CountingTarget {
        async fn resubscribe(&self, _connection: &dyn BrokerConnection) -> Result<(), BrokerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn ignore(_generation: u64) -> ExceptionListener {
        Arc::new(|_err: BrokerError| {})
    }

    #[test]
    fn test_state_round_trips_through_atomic() {
        for state in [
            ConnectionState::Unstarted,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
            ConnectionState::Shutdown,
        ] {
            assert_eq!(ConnectionState::from_u8(state.as_u8()), state);
        }
    }

    #[tokio::test]
    async fn test_connect_loop_connects_and_resubscribes() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(broker.connection_factory(), Duration::from_millis(10));
        let target = CountingTarget::default();

        assert!(manager.begin_start());
        assert!(!manager.begin_start());
        manager.connect_loop(&target, ignore).await;

        assert!(manager.is_connected());
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(target.0.load(Ordering::SeqCst), 1);
        assert_eq!(manager.generation(), 1);
        assert!(manager.live_connection().await.is_some());
    }

    #[tokio::test]
    async fn test_connect_loop_retries_until_broker_available() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let manager = Arc::new(ConnectionManager::new(broker.connection_factory(), Duration::from_millis(20)));

        assert!(manager.begin_start());
        let loop_manager = Arc::clone(&manager);
        let handle = tokio::spawn(async move {
            let target = CountingTarget::default();
            loop_manager.connect_loop(&target, ignore).await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!manager.is_connected());
        broker.set_available(true);
        handle.await.unwrap();
        assert!(manager.is_connected());
        assert_eq!(broker.connections_created(), 1);
    }

    #[tokio::test]
    async fn test_begin_reconnect_only_once_while_active() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(broker.connection_factory(), Duration::from_millis(10));
        manager.begin_start();
        manager.connect_loop(&CountingTarget::default(), ignore).await;

        assert!(manager.begin_reconnect(None).await);
        assert!(!manager.begin_reconnect(None).await);
        assert!(!manager.is_connected());
        assert_eq!(broker.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_failure_while_activating_is_handed_back() {
        let broker = MemoryBroker::new();
        let manager = Arc::new(ConnectionManager::new(broker.connection_factory(), Duration::from_millis(10)));
        let reporter = Arc::downgrade(&manager);
        let report = move |generation: u64| -> ExceptionListener {
            let reporter = reporter.clone();
            Arc::new(move |_err: BrokerError| {
                if let Some(manager) = reporter.upgrade() {
                    manager.report_failure(generation);
                }
            })
        };

        broker.sever_next_started_connection();
        assert!(manager.begin_start());
        let failed = manager.connect_loop(&CountingTarget::default(), &report).await;

        // The loop committed a connection that is already dead.
        assert_eq!(failed, Some(1));
        assert!(manager.is_connected());
        assert_eq!(broker.live_connections(), 0);

        assert!(!manager.begin_reconnect(Some(0)).await);
        assert!(manager.begin_reconnect(Some(1)).await);
        let failed = manager.connect_loop(&CountingTarget::default(), &report).await;
        assert_eq!(failed, None);
        assert_eq!(manager.generation(), 2);
        assert_eq!(broker.live_connections(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connection() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(broker.connection_factory(), Duration::from_millis(10));
        manager.begin_start();
        manager.connect_loop(&CountingTarget::default(), ignore).await;

        manager.shutdown().await;
        assert_eq!(manager.state(), ConnectionState::Shutdown);
        assert!(!manager.is_running());
        assert!(manager.live_connection().await.is_none());
        assert_eq!(broker.live_connections(), 0);
        assert!(!manager.begin_start());
    }
}
