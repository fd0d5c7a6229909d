//! # Broker Abstraction
//!
//! Everything the proxy needs from a message broker, expressed as a small set of
//! async traits. The proxy never talks to a concrete client library directly; it
//! asks a `ConnectionFactory` for a `BrokerConnection`, opens `BrokerSession`s on
//! it and binds consumers to `Destination`s.
//!
//! ## Lifetime Rules:
//! - Closing a `BrokerConnection` releases every session opened on it, and with
//!   them every consumer and temporary queue.
//! - Closing a `BrokerSession` releases its consumers and the temporary queues it
//!   created.
//! - A connection reports asynchronous failures (dropped socket, failed health
//!   check) through the `ExceptionListener` installed with
//!   `set_exception_listener`. The callback may run on any task.
//!
//! ## Backends:
//! - **`memory`**: a complete loopback broker with diagnostics counters and fault
//!   injection, used by the test suites and demos.
//! - **`redis_broker`** (feature `redis-broker`): topics on Redis pub/sub, queues on
//!   Redis lists.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The in-memory loopback broker.
pub mod memory;
/// The Redis-backed broker.
#[cfg(feature = "redis-broker")]
pub mod redis_broker;

pub use memory::{MemoryBroker, MemoryConnectionFactory};
#[cfg(feature = "redis-broker")]
pub use redis_broker::RedisConnectionFactory;

/// Errors raised by broker backends.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker could not be reached when opening a connection.
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// The connection was closed or severed underneath the caller.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// An operation was attempted on a session that is already closed.
    #[error("Session closed")]
    SessionClosed,

    /// The destination does not exist (e.g. a released temporary queue).
    #[error("Unknown destination: {0}")]
    UnknownDestination(String),

    /// The destination kind is not valid for the requested operation.
    #[error("Invalid destination for {operation}: {destination}")]
    InvalidDestination {
        /// The operation that was attempted.
        operation: &'static str,
        /// The offending destination.
        destination: String,
    },

    /// Any other failure reported by the underlying client library.
    #[error("Transport error: {0}")]
    Transport(String),
}

#[cfg(feature = "redis-broker")]
impl From<redis::RedisError> for BrokerError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() {
            BrokerError::ConnectionRefused(err.to_string())
        } else if err.is_connection_dropped() || err.is_io_error() {
            BrokerError::ConnectionClosed(err.to_string())
        } else {
            BrokerError::Transport(err.to_string())
        }
    }
}

/// A broker-side address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "camelCase")]
pub enum Destination {
    /// A publish/subscribe channel.
    Topic(String),
    /// A point-to-point queue.
    Queue(String),
    /// A broker-allocated queue that lives as long as the session that created it.
    TemporaryQueue(String),
}

impl Destination {
    /// The raw broker name, without the kind.
    pub fn name(&self) -> &str {
        match self {
            Destination::Topic(name) | Destination::Queue(name) | Destination::TemporaryQueue(name) => name,
        }
    }

    /// True for both durable and temporary queues.
    pub fn is_queue(&self) -> bool {
        matches!(self, Destination::Queue(_) | Destination::TemporaryQueue(_))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Topic(name) => write!(f, "topic://{}", name),
            Destination::Queue(name) => write!(f, "queue://{}", name),
            Destination::TemporaryQueue(name) => write!(f, "temp-queue://{}", name),
        }
    }
}

/// # Broker Message
///
/// An opaque text payload plus the optional reply destination used by
/// request/reply exchanges. The proxy never looks inside `text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerMessage {
    /// The wire payload.
    pub text: String,
    /// Where the receiver should send its answer, if anywhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Destination>,
}

impl BrokerMessage {
    /// A plain text message with no reply destination.
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), reply_to: None }
    }

    /// Sets the reply destination.
    pub fn with_reply_to(mut self, destination: Destination) -> Self {
        self.reply_to = Some(destination);
        self
    }
}

/// Acknowledgement mode of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Messages are acknowledged as soon as they are delivered; sends are immediate.
    AutoAcknowledge,
    /// Sends are buffered until `commit`.
    Transacted,
}

/// Receives messages for a consumer bound with `BrokerSession::subscribe`.
///
/// Called from the backend's delivery tasks; different topics may be delivered
/// concurrently, so implementations must be `Send + Sync`.
pub trait MessageListener: Send + Sync {
    /// Handles one delivered message.
    fn on_message(&self, message: &BrokerMessage);
}

/// Callback raised by a connection when it fails out-of-band.
pub type ExceptionListener = Arc<dyn Fn(BrokerError) + Send + Sync>;

/// Produces fresh broker connections on demand.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Opens a new, not yet started, connection.
    async fn create_connection(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// One physical broker connection, shared by many sessions.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a session on this connection.
    async fn create_session(&self, mode: SessionMode) -> Result<Box<dyn BrokerSession>, BrokerError>;

    /// Installs the callback raised on asynchronous connection failure.
    fn set_exception_listener(&self, listener: ExceptionListener);

    /// Starts message delivery to consumers.
    async fn start(&self) -> Result<(), BrokerError>;

    /// Closes the connection and every session opened on it.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A single-threaded unit of work on a connection.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Binds a consumer on `destination` that hands every message to `listener`.
    async fn subscribe(
        &self,
        destination: &Destination,
        listener: Arc<dyn MessageListener>,
    ) -> Result<(), BrokerError>;

    /// Allocates a temporary queue owned by this session.
    async fn create_temporary_queue(&self) -> Result<Destination, BrokerError>;

    /// Sends a message. Buffered until `commit` on transacted sessions.
    async fn send(&self, destination: &Destination, message: BrokerMessage) -> Result<(), BrokerError>;

    /// Flushes the sends buffered by a transacted session. No-op otherwise.
    async fn commit(&self) -> Result<(), BrokerError>;

    /// Waits up to `timeout` for one message on a queue.
    async fn receive(
        &self,
        destination: &Destination,
        timeout: Duration,
    ) -> Result<Option<BrokerMessage>, BrokerError>;

    /// Closes the session, its consumers and its temporary queues.
    async fn close(&self) -> Result<(), BrokerError>;
}
