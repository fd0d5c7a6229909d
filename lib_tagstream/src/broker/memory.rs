//! # In-Memory Loopback Broker
//!
//! A complete broker living inside the process. Topics fan out synchronously to
//! every consumer bound on a started connection; queues are FIFO buffers with an
//! async wake-up for receivers. It backs the test suites and local demos.
//!
//! ## Diagnostics
//! The broker counts what it is asked to do (`connections_created`,
//! `subscribe_calls`) and what is still alive (`live_sessions`,
//! `live_temporary_queues`, `topic_consumer_count`), so tests can assert that the
//! proxy neither re-subscribes needlessly nor leaks resources.
//!
//! ## Fault Injection
//! - `set_available(false)` refuses new connections.
//! - `sever_connections()` kills every live connection and raises its exception
//!   listener, the way a dropped TCP socket would.
//! - `fail_next_session_close()` makes the next session close report an error
//!   and leave the session half-released.
//! - `sever_next_started_connection()` lets the next `start` succeed and then
//!   kills that connection straight away.
//! - `set_session_open_delay` / `set_session_close_delay` slow the broker side of
//!   session creation and teardown, widening race windows.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{
    BrokerConnection, BrokerError, BrokerMessage, BrokerSession, ConnectionFactory, Destination,
    ExceptionListener, MessageListener, SessionMode,
};

/// Computes the reply text for a request text; `None` sends no reply.
pub type Responder = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn pause(delay_ms: &AtomicU64) {
    let millis = delay_ms.load(Ordering::SeqCst);
    if millis > 0 {
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

struct Subscription {
    connection_id: u64,
    session_id: u64,
    topic: String,
    listener: Arc<dyn MessageListener>,
}

struct ConnectionState {
    id: u64,
    started: AtomicBool,
    closed: AtomicBool,
    exception_listener: Mutex<Option<ExceptionListener>>,
}

#[derive(Default)]
struct MemoryQueue {
    items: Mutex<VecDeque<BrokerMessage>>,
    notify: Notify,
}

impl MemoryQueue {
    fn push(&self, message: BrokerMessage) {
        lock(&self.items).push_back(message);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<BrokerMessage> {
        lock(&self.items).pop_front()
    }
}

#[derive(Default)]
struct BrokerState {
    unavailable: AtomicBool,
    next_id: AtomicU64,
    connections_created: AtomicU64,
    subscribe_calls: AtomicU64,
    pending_close_failures: AtomicUsize,
    pending_start_severs: AtomicUsize,
    session_open_delay_ms: AtomicU64,
    session_close_delay_ms: AtomicU64,
    connections: DashMap<u64, Arc<ConnectionState>>,
    // session id -> owning connection id
    sessions: DashMap<u64, u64>,
    subscriptions: DashMap<u64, Subscription>,
    queues: DashMap<String, Arc<MemoryQueue>>,
    // temporary queue name -> owning session id
    temporary_queues: DashMap<String, u64>,
    responders: DashMap<String, Responder>,
}

impl BrokerState {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn publish(&self, topic: &str, message: &BrokerMessage) -> usize {
        // Collect first so no map guard is held while listeners run.
        let listeners: Vec<Arc<dyn MessageListener>> = self
            .subscriptions
            .iter()
            .filter(|sub| sub.topic == topic)
            .filter(|sub| {
                self.connections
                    .get(&sub.connection_id)
                    .map(|c| c.started.load(Ordering::Acquire) && !c.closed.load(Ordering::Acquire))
                    .unwrap_or(false)
            })
            .map(|sub| Arc::clone(&sub.listener))
            .collect();

        for listener in &listeners {
            listener.on_message(message);
        }
        listeners.len()
    }

    fn deliver(self: &Arc<Self>, destination: &Destination, message: BrokerMessage) -> Result<(), BrokerError> {
        match destination {
            Destination::Topic(name) => {
                self.publish(name, &message);
                Ok(())
            }
            Destination::TemporaryQueue(name) => {
                let queue = self
                    .queues
                    .get(name)
                    .map(|q| Arc::clone(q.value()))
                    .ok_or_else(|| BrokerError::UnknownDestination(destination.to_string()))?;
                queue.push(message);
                Ok(())
            }
            Destination::Queue(name) => {
                if let Some(responder) = self.responders.get(name).map(|r| Arc::clone(r.value())) {
                    let state = Arc::clone(self);
                    tokio::spawn(async move {
                        let Some(reply_to) = message.reply_to.clone() else {
                            log::warn!("Request received without reply destination; dropping it.");
                            return;
                        };
                        if let Some(reply) = responder(&message.text) {
                            if let Err(e) = state.deliver(&reply_to, BrokerMessage::text(reply)) {
                                log::debug!("Reply to {} not delivered: {}", reply_to, e);
                            }
                        }
                    });
                    return Ok(());
                }
                let queue = self.queues.entry(name.clone()).or_default().clone();
                queue.push(message);
                Ok(())
            }
        }
    }

    fn release_session(&self, session_id: u64) {
        self.subscriptions.retain(|_, sub| sub.session_id != session_id);
        let owned: Vec<String> = self
            .temporary_queues
            .iter()
            .filter(|entry| *entry.value() == session_id)
            .map(|entry| entry.key().clone())
            .collect();
        for name in owned {
            self.temporary_queues.remove(&name);
            self.queues.remove(&name);
        }
        self.sessions.remove(&session_id);
    }

    fn sever(&self, connection: &ConnectionState) {
        self.release_connection(connection);
        let listener = lock(&connection.exception_listener).clone();
        if let Some(listener) = listener {
            listener(BrokerError::ConnectionClosed(format!("connection {} severed", connection.id)));
        }
    }

    fn release_connection(&self, connection: &ConnectionState) {
        connection.closed.store(true, Ordering::Release);
        let sessions: Vec<u64> = self
            .sessions
            .iter()
            .filter(|entry| *entry.value() == connection.id)
            .map(|entry| *entry.key())
            .collect();
        for session_id in sessions {
            self.release_session(session_id);
        }
        self.connections.remove(&connection.id);
    }
}

/// # Memory Broker
///
/// Handle on the loopback broker. Cheap to clone; every clone drives the same
/// broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    /// Creates an empty, available broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection factory producing connections to this broker.
    pub fn connection_factory(&self) -> Arc<MemoryConnectionFactory> {
        Arc::new(MemoryConnectionFactory { state: Arc::clone(&self.state) })
    }

    /// Makes new connection attempts succeed (`true`) or be refused (`false`).
    pub fn set_available(&self, available: bool) {
        self.state.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Kills every live connection and raises its exception listener.
    pub fn sever_connections(&self) {
        let live: Vec<Arc<ConnectionState>> =
            self.state.connections.iter().map(|c| Arc::clone(c.value())).collect();
        for connection in live {
            self.state.sever(&connection);
        }
    }

    /// Severs the next connection right after its `start` returned successfully.
    pub fn sever_next_started_connection(&self) {
        self.state.pending_start_severs.fetch_add(1, Ordering::SeqCst);
    }

    /// Delays every `create_session` by `delay`.
    pub fn set_session_open_delay(&self, delay: Duration) {
        self.state.session_open_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delays every `BrokerSession::close` by `delay` before it releases anything.
    pub fn set_session_close_delay(&self, delay: Duration) {
        self.state.session_close_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Makes the next `BrokerSession::close` fail without releasing the session.
    pub fn fail_next_session_close(&self) {
        self.state.pending_close_failures.fetch_add(1, Ordering::SeqCst);
    }

    /// Publishes `text` on `topic`; returns how many consumers received it.
    pub fn publish(&self, topic: &str, text: &str) -> usize {
        self.state.publish(topic, &BrokerMessage::text(text))
    }

    /// Answers every request arriving on `queue` with `responder`.
    pub fn respond_to<F>(&self, queue: &str, responder: F)
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.state.responders.insert(queue.to_string(), Arc::new(responder));
    }

    /// Takes the oldest message waiting on a durable queue.
    pub fn pop_from_queue(&self, queue: &str) -> Option<BrokerMessage> {
        self.state.queues.get(queue).and_then(|q| q.pop())
    }

    /// Number of connections ever opened.
    pub fn connections_created(&self) -> u64 {
        self.state.connections_created.load(Ordering::SeqCst)
    }

    /// Number of `subscribe` calls ever made.
    pub fn subscribe_calls(&self) -> u64 {
        self.state.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Connections not yet closed.
    pub fn live_connections(&self) -> usize {
        self.state.connections.len()
    }

    /// Sessions not yet closed.
    pub fn live_sessions(&self) -> usize {
        self.state.sessions.len()
    }

    /// Temporary queues not yet released.
    pub fn live_temporary_queues(&self) -> usize {
        self.state.temporary_queues.len()
    }

    /// Consumers currently bound to `topic`, across all connections.
    pub fn topic_consumer_count(&self, topic: &str) -> usize {
        self.state.subscriptions.iter().filter(|sub| sub.topic == topic).count()
    }
}

/// Opens connections on a `MemoryBroker`.
pub struct MemoryConnectionFactory {
    state: Arc<BrokerState>,
}

#[async_trait]
impl ConnectionFactory for MemoryConnectionFactory {
    async fn create_connection(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionRefused("memory broker unavailable".to_string()));
        }
        let connection = Arc::new(ConnectionState {
            id: self.state.next_id(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            exception_listener: Mutex::new(None),
        });
        self.state.connections.insert(connection.id, Arc::clone(&connection));
        self.state.connections_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection { state: Arc::clone(&self.state), connection }))
    }
}

struct MemoryConnection {
    state: Arc<BrokerState>,
    connection: Arc<ConnectionState>,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.connection.closed.load(Ordering::Acquire) {
            Err(BrokerError::ConnectionClosed(format!("connection {} is closed", self.connection.id)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_session(&self, mode: SessionMode) -> Result<Box<dyn BrokerSession>, BrokerError> {
        self.ensure_open()?;
        pause(&self.state.session_open_delay_ms).await;
        self.ensure_open()?;
        let id = self.state.next_id();
        self.state.sessions.insert(id, self.connection.id);
        Ok(Box::new(MemorySession {
            id,
            mode,
            state: Arc::clone(&self.state),
            connection: Arc::clone(&self.connection),
            closed: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
        }))
    }

    fn set_exception_listener(&self, listener: ExceptionListener) {
        *lock(&self.connection.exception_listener) = Some(listener);
    }

    async fn start(&self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.connection.started.store(true, Ordering::Release);
        let sever = self
            .state
            .pending_start_severs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if sever {
            self.state.sever(&self.connection);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.release_connection(&self.connection);
        Ok(())
    }
}

struct MemorySession {
    id: u64,
    mode: SessionMode,
    state: Arc<BrokerState>,
    connection: Arc<ConnectionState>,
    closed: AtomicBool,
    pending: Mutex<Vec<(Destination, BrokerMessage)>>,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.connection.closed.load(Ordering::Acquire) {
            return Err(BrokerError::ConnectionClosed(format!("connection {} is closed", self.connection.id)));
        }
        if self.closed.load(Ordering::Acquire) || !self.state.sessions.contains_key(&self.id) {
            return Err(BrokerError::SessionClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn subscribe(
        &self,
        destination: &Destination,
        listener: Arc<dyn MessageListener>,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let Destination::Topic(topic) = destination else {
            return Err(BrokerError::InvalidDestination {
                operation: "subscribe",
                destination: destination.to_string(),
            });
        };
        self.state.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.state.subscriptions.insert(
            self.state.next_id(),
            Subscription {
                connection_id: self.connection.id,
                session_id: self.id,
                topic: topic.clone(),
                listener,
            },
        );
        Ok(())
    }

    async fn create_temporary_queue(&self) -> Result<Destination, BrokerError> {
        self.ensure_open()?;
        let name = format!("tmp.queue.{}", self.state.next_id());
        self.state.queues.insert(name.clone(), Arc::new(MemoryQueue::default()));
        self.state.temporary_queues.insert(name.clone(), self.id);
        Ok(Destination::TemporaryQueue(name))
    }

    async fn send(&self, destination: &Destination, message: BrokerMessage) -> Result<(), BrokerError> {
        self.ensure_open()?;
        match self.mode {
            SessionMode::Transacted => {
                lock(&self.pending).push((destination.clone(), message));
                Ok(())
            }
            SessionMode::AutoAcknowledge => self.state.deliver(destination, message),
        }
    }

    async fn commit(&self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let pending = std::mem::take(&mut *lock(&self.pending));
        for (destination, message) in pending {
            self.state.deliver(&destination, message)?;
        }
        Ok(())
    }

    async fn receive(
        &self,
        destination: &Destination,
        timeout: Duration,
    ) -> Result<Option<BrokerMessage>, BrokerError> {
        self.ensure_open()?;
        if !destination.is_queue() {
            return Err(BrokerError::InvalidDestination {
                operation: "receive",
                destination: destination.to_string(),
            });
        }
        let queue = match destination {
            Destination::TemporaryQueue(name) => self
                .state
                .queues
                .get(name)
                .map(|q| Arc::clone(q.value()))
                .ok_or_else(|| BrokerError::UnknownDestination(destination.to_string()))?,
            _ => self.state.queues.entry(destination.name().to_string()).or_default().clone(),
        };

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = queue.pop() {
                return Ok(Some(message));
            }
            if tokio::time::timeout_at(deadline, queue.notify.notified()).await.is_err() {
                return Ok(queue.pop());
            }
            self.ensure_open()?;
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        pause(&self.state.session_close_delay_ms).await;
        let injected = self
            .state
            .pending_close_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BrokerError::Transport(format!("injected failure closing session {}", self.id)));
        }
        self.closed.store(true, Ordering::Release);
        self.state.release_session(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Collecting(StdMutex<Vec<String>>);

    impl MessageListener for Collecting {
        fn on_message(&self, message: &BrokerMessage) {
            self.0.lock().unwrap().push(message.text.clone());
        }
    }

    #[tokio::test]
    async fn test_topic_delivery_requires_started_connection() {
        let broker = MemoryBroker::new();
        let conn = broker.connection_factory().create_connection().await.unwrap();
        let session = conn.create_session(SessionMode::AutoAcknowledge).await.unwrap();
        let sink = Arc::new(Collecting::default());
        session.subscribe(&Destination::Topic("t".into()), sink.clone()).await.unwrap();

        assert_eq!(broker.publish("t", "before start"), 0);
        conn.start().await.unwrap();
        assert_eq!(broker.publish("t", "after start"), 1);
        assert_eq!(*sink.0.lock().unwrap(), vec!["after start".to_string()]);
    }

    #[tokio::test]
    async fn test_closing_connection_releases_sessions_and_temp_queues() {
        let broker = MemoryBroker::new();
        let conn = broker.connection_factory().create_connection().await.unwrap();
        let session = conn.create_session(SessionMode::Transacted).await.unwrap();
        session.create_temporary_queue().await.unwrap();
        assert_eq!(broker.live_sessions(), 1);
        assert_eq!(broker.live_temporary_queues(), 1);

        conn.close().await.unwrap();
        assert_eq!(broker.live_sessions(), 0);
        assert_eq!(broker.live_temporary_queues(), 0);
        assert_eq!(broker.live_connections(), 0);
        assert!(matches!(session.commit().await, Err(BrokerError::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn test_transacted_send_waits_for_commit() {
        let broker = MemoryBroker::new();
        let conn = broker.connection_factory().create_connection().await.unwrap();
        let session = conn.create_session(SessionMode::Transacted).await.unwrap();
        let queue = Destination::Queue("requests".into());
        session.send(&queue, BrokerMessage::text("hello")).await.unwrap();
        assert!(broker.pop_from_queue("requests").is_none());
        session.commit().await.unwrap();
        assert_eq!(broker.pop_from_queue("requests").unwrap().text, "hello");
    }

    #[tokio::test]
    async fn test_receive_times_out_on_empty_queue() {
        let broker = MemoryBroker::new();
        let conn = broker.connection_factory().create_connection().await.unwrap();
        let session = conn.create_session(SessionMode::AutoAcknowledge).await.unwrap();
        let reply = session.create_temporary_queue().await.unwrap();
        let started = std::time::Instant::now();
        let got = session.receive(&reply, Duration::from_millis(50)).await.unwrap();
        assert!(got.is_none());
        assert!(started.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn test_unavailable_broker_refuses_connections() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let result = broker.connection_factory().create_connection().await;
        assert!(matches!(result, Err(BrokerError::ConnectionRefused(_))));
        assert_eq!(broker.connections_created(), 0);
    }

    #[tokio::test]
    async fn test_injected_close_failure_keeps_session_alive() {
        let broker = MemoryBroker::new();
        let conn = broker.connection_factory().create_connection().await.unwrap();
        let session = conn.create_session(SessionMode::AutoAcknowledge).await.unwrap();
        broker.fail_next_session_close();
        assert!(session.close().await.is_err());
        assert_eq!(broker.live_sessions(), 1);
        session.close().await.unwrap();
        assert_eq!(broker.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_connection_severed_right_after_start() {
        let broker = MemoryBroker::new();
        let raised = Arc::new(AtomicUsize::new(0));
        let conn = broker.connection_factory().create_connection().await.unwrap();
        let counter = raised.clone();
        conn.set_exception_listener(Arc::new(move |_err: BrokerError| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        broker.sever_next_started_connection();
        conn.start().await.unwrap();
        assert_eq!(raised.load(Ordering::SeqCst), 1);
        assert_eq!(broker.live_connections(), 0);
        assert!(conn.create_session(SessionMode::AutoAcknowledge).await.is_err());
    }
}
