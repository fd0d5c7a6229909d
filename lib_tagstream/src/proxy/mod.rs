//! # Tag Proxy
//!
//! The client-side connection and subscription manager. One `TagProxy` owns one
//! broker connection and multiplexes every update subscription, the supervision
//! feed and request/reply calls over it.
//!
//! ## Guarantees
//! - At most one channel session exists per topic, whatever the interleaving of
//!   register and unregister calls.
//! - Every registration made since start, connected or not, is active again once
//!   a reconnect completes.
//! - Connectivity failures never surface as terminal errors. Calls made while
//!   disconnected fail with `ProxyError::NotConnected`; registrations made then
//!   are still recorded and activated by the next reconnect.
//!
//! ## Locking
//! Registry operations hold the refresh lock's read side, then the listener's own
//! lock. The reconnect replay takes the write side, so it never interleaves with
//! a registry operation. The connecting lock only guards entry into the
//! reconnect path.

mod channel_session;
mod connection_listeners;
mod connection_manager;
mod listener;
mod registry;
mod request_gateway;
mod supervision;

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;

pub use connection_manager::ConnectionState;
pub use listener::{
    ConnectionListener, ListenerKey, ServerUpdate, SupervisionListener, TopicRegistrationDetails, UpdateListener,
};

use crate::broker::{BrokerConnection, BrokerError, ConnectionFactory, ExceptionListener};
use crate::codec::ClientRequest;
use crate::configs::ProxyConfig;
use crate::error::ProxyError;
use connection_manager::{ConnectionManager, Resubscribe};
use registry::{SubscriptionRegistry, Unregistered};
use supervision::SupervisionChannel;

/// # Tag Proxy
///
/// Cheap to clone; all clones drive the same connection. Must be used from
/// within a Tokio runtime.
#[derive(Clone)]
pub struct TagProxy {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    config: ProxyConfig,
    manager: ConnectionManager,
    registry: SubscriptionRegistry,
    supervision: SupervisionChannel,
}

#[async_trait]
impl Resubscribe for ProxyInner {
    async fn resubscribe(&self, connection: &dyn BrokerConnection) -> Result<(), BrokerError> {
        self.registry.replay(connection).await?;
        self.supervision.subscribe(connection).await
    }
}

impl ProxyInner {
    fn spawn_connect_loop(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let weak = Arc::downgrade(&inner);
            let failed = inner
                .manager
                .connect_loop(inner.as_ref(), move |generation| exception_listener(weak.clone(), generation))
                .await;
            if let Some(generation) = failed {
                log::warn!("Connection {} failed while it was being established; reconnecting.", generation);
                inner.reconnect(Some(generation)).await;
            }
        });
    }

    async fn reconnect(self: &Arc<Self>, generation: Option<u64>) {
        if self.manager.begin_reconnect(generation).await {
            log::info!("Reconnecting to broker in the background.");
            self.spawn_connect_loop();
        }
    }

    async fn on_broker_exception(self: &Arc<Self>, generation: u64, error: BrokerError) {
        if generation != self.manager.generation() {
            log::debug!("Ignoring failure reported by a previous connection: {}", error);
            return;
        }
        log::error!("Broker connection failure; starting reconnection: {}", error);
        self.manager.report_failure(generation);
        self.reconnect(Some(generation)).await;
    }
}

/// The exception callback installed on connection `generation`.
fn exception_listener(proxy: Weak<ProxyInner>, generation: u64) -> ExceptionListener {
    Arc::new(move |error: BrokerError| {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::error!("Broker failure reported outside a Tokio runtime, cannot reconnect: {}", error);
            return;
        };
        let proxy = proxy.clone();
        runtime.spawn(async move {
            if let Some(inner) = proxy.upgrade() {
                inner.on_broker_exception(generation, error).await;
            }
        });
    })
}

impl TagProxy {
    /// Creates a proxy on `factory`. Starts it right away when
    /// `config.auto_startup` is set.
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: ProxyConfig) -> Result<Self, ProxyError> {
        config.validate()?;
        let inner = Arc::new(ProxyInner {
            manager: ConnectionManager::new(factory, config.reconnect_interval()),
            registry: SubscriptionRegistry::default(),
            supervision: SupervisionChannel::new(&config.supervision_topic),
            config,
        });
        let proxy = Self { inner };
        if proxy.inner.config.auto_startup {
            proxy.start()?;
        }
        Ok(proxy)
    }

    /// The configuration this proxy runs with.
    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    // --- Lifecycle ---

    /// # Start
    ///
    /// Spawns the connect loop and returns immediately. Calling it again while
    /// running is a no-op; after `stop` it fails with `ProxyError::Shutdown`.
    pub fn start(&self) -> Result<(), ProxyError> {
        if self.inner.manager.is_shutdown() {
            return Err(ProxyError::Shutdown);
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ProxyError::IllegalState("start must be called within a Tokio runtime".to_string()));
        }
        if self.inner.manager.begin_start() {
            log::info!("Starting broker proxy (supervision topic {}).", self.inner.config.supervision_topic);
            self.inner.spawn_connect_loop();
        }
        Ok(())
    }

    /// # Stop
    ///
    /// Stops reconnecting, closes the connection (and with it every session),
    /// notifies connection listeners and marks the proxy not running. Terminal.
    pub async fn stop(&self) {
        log::info!("Stopping broker proxy.");
        self.inner.manager.shutdown().await;
        let _refresh = self.inner.manager.refresh_write().await;
        self.inner.registry.clear_sessions();
    }

    /// Stops, then runs `callback`.
    pub async fn stop_with<F: FnOnce()>(&self, callback: F) {
        self.stop().await;
        callback();
    }

    /// True between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.inner.manager.is_running()
    }

    /// True while connected with every subscription active.
    pub fn is_connected(&self) -> bool {
        self.inner.manager.is_connected()
    }

    /// Current lifecycle state.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.manager.state()
    }

    // --- Update listeners ---

    /// # Register Update Listener
    ///
    /// Subscribes `listener` to `details.topic_name` under `details.id`, sharing
    /// the topic's session with other listeners. Registering the same listener
    /// twice is a no-op.
    ///
    /// While disconnected the registration is recorded and
    /// `ProxyError::NotConnected` returned; the next reconnect activates it, so
    /// the caller need not retry.
    pub async fn register_update_listener(
        &self,
        listener: Arc<dyn UpdateListener>,
        details: TopicRegistrationDetails,
    ) -> Result<(), ProxyError> {
        if details.topic_name.trim().is_empty() {
            return Err(ProxyError::InvalidArgument("topic name must not be empty".to_string()));
        }
        let _refresh = self.inner.manager.refresh_read().await;
        let connection = self.inner.manager.live_connection().await;
        self.inner.registry.register(listener, details, connection.as_deref()).await
    }

    /// # Unregister Update Listener
    ///
    /// Removes `listener`, closing its topic session once empty. A failure to
    /// close that session is logged and triggers a reconnect; the listener is
    /// unregistered regardless.
    pub async fn unregister_update_listener(&self, listener: &Arc<dyn UpdateListener>) -> Result<(), ProxyError> {
        let outcome = {
            let _refresh = self.inner.manager.refresh_read().await;
            self.inner.registry.unregister(listener).await?
        };
        if outcome == Unregistered::SessionCloseFailed {
            self.inner.reconnect(None).await;
        }
        Ok(())
    }

    /// Hands `old`'s subscription over to `new` without any broker call.
    pub async fn replace_listener(
        &self,
        old: &Arc<dyn UpdateListener>,
        new: Arc<dyn UpdateListener>,
    ) -> Result<(), ProxyError> {
        let _refresh = self.inner.manager.refresh_read().await;
        self.inner.registry.replace(old, new).await
    }

    /// Lock-free; false right after a successful unregister.
    pub fn is_registered_listener<T: ?Sized>(&self, listener: &Arc<T>) -> bool {
        self.inner.registry.is_registered(ListenerKey::of(listener))
    }

    // --- Supervision and connection listeners ---

    /// Adds an observer of the supervision topic. Survives reconnects.
    pub fn register_supervision_listener(&self, listener: Arc<dyn SupervisionListener>) {
        self.inner.supervision.add_listener(listener);
    }

    /// Removes a supervision observer; false if it was not registered.
    pub fn unregister_supervision_listener(&self, listener: &Arc<dyn SupervisionListener>) -> bool {
        self.inner.supervision.remove_listener(listener)
    }

    /// Adds an observer of connection establishment and loss.
    pub fn register_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.inner.manager.listeners.add(listener);
    }

    // --- Request/reply ---

    /// # Send Request
    ///
    /// Sends `request` to `queue_name` and waits at most `timeout` for the
    /// reply on a temporary queue.
    ///
    /// # Errors
    /// `NotConnected` while down, `InvalidArgument` for an empty queue name,
    /// `Timeout` when no reply arrives, `Codec` for a malformed reply.
    pub async fn send_request<R>(&self, request: &R, queue_name: &str, timeout: Duration) -> Result<R::Response, ProxyError>
    where
        R: ClientRequest + ?Sized,
    {
        let connection = self.inner.manager.live_connection().await;
        request_gateway::send_request(connection.as_deref(), request, queue_name, timeout).await
    }

    /// `send_request` with the configured `requestTimeoutMs`.
    pub async fn send_request_with_default_timeout<R>(&self, request: &R, queue_name: &str) -> Result<R::Response, ProxyError>
    where
        R: ClientRequest + ?Sized,
    {
        self.send_request(request, queue_name, self.inner.config.request_timeout()).await
    }

    // --- Diagnostics ---

    /// Topic sessions currently open. Zero after `stop`.
    pub fn channel_session_count(&self) -> usize {
        self.inner.registry.channel_session_count()
    }

    /// Update listeners recorded, active or awaiting replay.
    pub fn registered_listener_count(&self) -> usize {
        self.inner.registry.registered_count()
    }

    /// Topics with an open session, sorted.
    pub fn active_topics(&self) -> Vec<String> {
        self.inner.registry.active_topics()
    }

    /// Every recorded registration, sorted by topic then id.
    pub fn registrations(&self) -> Vec<TopicRegistrationDetails> {
        self.inner.registry.registered_details()
    }

    /// Supervision observers currently registered.
    pub fn supervision_listener_count(&self) -> usize {
        self.inner.supervision.listener_count()
    }

    /// Connection observers currently registered.
    pub fn connection_listener_count(&self) -> usize {
        self.inner.manager.listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use std::sync::Mutex;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn config() -> ProxyConfig {
        ProxyConfig { reconnect_interval_ms: 20, ..ProxyConfig::default() }
    }

    async fn wait_connected(proxy: &TagProxy) {
        for _ in 0..200 {
            if proxy.is_connected() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("proxy did not connect");
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl UpdateListener for Recorder {
        fn on_update(&self, update: &ServerUpdate<'_>) {
            self.0.lock().unwrap().push(update.payload.to_string());
        }
    }

    impl SupervisionListener for Recorder {
        fn on_supervision_event(&self, payload: &str) {
            self.0.lock().unwrap().push(payload.to_string());
        }
    }

    #[tokio::test]
    async fn test_start_connects_and_delivers() {
        init_logging();
        let broker = MemoryBroker::new();
        let proxy = TagProxy::new(broker.connection_factory(), config()).unwrap();
        assert_eq!(proxy.connection_state(), ConnectionState::Unstarted);

        proxy.start().unwrap();
        wait_connected(&proxy).await;
        assert!(proxy.is_running());

        let recorder = Arc::new(Recorder::default());
        proxy
            .register_update_listener(recorder.clone(), TopicRegistrationDetails::new("tags.1", 1))
            .await
            .unwrap();
        broker.publish("tags.1", "42");
        assert_eq!(*recorder.0.lock().unwrap(), vec!["42".to_string()]);

        proxy.stop().await;
        assert_eq!(proxy.connection_state(), ConnectionState::Shutdown);
        assert!(matches!(proxy.start(), Err(ProxyError::Shutdown)));
    }

    #[tokio::test]
    async fn test_stop_forgets_topic_sessions() {
        init_logging();
        let broker = MemoryBroker::new();
        let proxy = TagProxy::new(broker.connection_factory(), config()).unwrap();
        proxy.start().unwrap();
        wait_connected(&proxy).await;
        let recorder: Arc<dyn UpdateListener> = Arc::new(Recorder::default());
        proxy
            .register_update_listener(recorder.clone(), TopicRegistrationDetails::new("tags.7", 7))
            .await
            .unwrap();
        assert_eq!(proxy.active_topics(), vec!["tags.7".to_string()]);

        proxy.stop().await;
        assert_eq!(proxy.channel_session_count(), 0);
        assert!(proxy.active_topics().is_empty());
        assert!(proxy.is_registered_listener(&recorder));
    }

    #[tokio::test]
    async fn test_connection_lost_during_startup_is_replaced() {
        init_logging();
        let broker = MemoryBroker::new();
        broker.sever_next_started_connection();
        let proxy = TagProxy::new(broker.connection_factory(), config()).unwrap();
        proxy.start().unwrap();

        for _ in 0..400 {
            if broker.connections_created() >= 2 && proxy.is_connected() && broker.live_connections() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(broker.connections_created(), 2);
        assert_eq!(broker.live_connections(), 1);
        assert!(proxy.is_connected());

        let recorder = Arc::new(Recorder::default());
        proxy
            .register_update_listener(recorder.clone(), TopicRegistrationDetails::new("tags.2", 2))
            .await
            .unwrap();
        broker.publish("tags.2", "alive");
        assert_eq!(*recorder.0.lock().unwrap(), vec!["alive".to_string()]);
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_supervision_listener_receives_events() {
        init_logging();
        let broker = MemoryBroker::new();
        let proxy = TagProxy::new(broker.connection_factory(), config()).unwrap();
        let recorder = Arc::new(Recorder::default());
        proxy.register_supervision_listener(recorder.clone());
        proxy.start().unwrap();
        wait_connected(&proxy).await;

        let supervision_topic = proxy.config().supervision_topic.clone();
        broker.publish(&supervision_topic, "DOWN");
        assert_eq!(*recorder.0.lock().unwrap(), vec!["DOWN".to_string()]);

        let as_supervision: Arc<dyn SupervisionListener> = recorder;
        assert!(proxy.unregister_supervision_listener(&as_supervision));
        assert_eq!(proxy.supervision_listener_count(), 0);
        proxy.stop().await;
    }

    #[tokio::test]
    async fn test_empty_topic_is_rejected() {
        let broker = MemoryBroker::new();
        let proxy = TagProxy::new(broker.connection_factory(), config()).unwrap();
        let result = proxy
            .register_update_listener(Arc::new(Recorder::default()), TopicRegistrationDetails::new("", 1))
            .await;
        assert!(matches!(result, Err(ProxyError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_stop_with_runs_callback_after_shutdown() {
        let broker = MemoryBroker::new();
        let proxy = TagProxy::new(broker.connection_factory(), config()).unwrap();
        proxy.start().unwrap();
        wait_connected(&proxy).await;

        let observed = Arc::new(Mutex::new(None));
        let seen = observed.clone();
        let handle = proxy.clone();
        proxy.stop_with(move || *seen.lock().unwrap() = Some(handle.is_running())).await;
        assert_eq!(*observed.lock().unwrap(), Some(false));
        assert_eq!(broker.live_connections(), 0);
    }
}
