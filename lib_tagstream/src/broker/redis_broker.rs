//! # Redis Broker
//!
//! Maps the broker traits onto a Redis server:
//!
//! | Broker concept   | Redis                                              |
//! |------------------|----------------------------------------------------|
//! | topic            | pub/sub channel, one dedicated pub/sub connection per consumer |
//! | queue            | list; `LPUSH` to send, `RPOP` polled to receive    |
//! | temporary queue  | list named `tmp.queue.<uuid>`, `DEL`eted on session close |
//! | transaction      | buffered sends flushed in one `MULTI` pipeline     |
//!
//! Every message sent through this backend travels as a JSON envelope tagged
//! with a format marker. Any payload without that exact envelope shape is
//! delivered untouched, so external publishers can use `PUBLISH` directly.
//!
//! ## Failure Detection
//! After `start`, a task `PING`s the server every health-check interval. A failed
//! ping or the end of a pub/sub stream raises the connection's exception listener
//! (once per connection).

use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
    BrokerConnection, BrokerError, BrokerMessage, BrokerSession, ConnectionFactory, Destination,
    ExceptionListener, MessageListener, SessionMode,
};

const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(25);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// Written into every envelope; anything else on the wire is someone else's payload.
const ENVELOPE_FORMAT: &str = "tagstream.v1";

/// Wire form of a `BrokerMessage` sent through this backend.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct Envelope {
    format: String,
    text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<Destination>,
}

fn encode(message: &BrokerMessage) -> Result<String, BrokerError> {
    let envelope = Envelope {
        format: ENVELOPE_FORMAT.to_string(),
        text: message.text.clone(),
        reply_to: message.reply_to.clone(),
    };
    serde_json::to_string(&envelope).map_err(|e| BrokerError::Transport(format!("envelope encoding failed: {}", e)))
}

/// Unwraps our own envelopes; every other payload is delivered byte for byte.
fn decode(payload: String) -> BrokerMessage {
    match serde_json::from_str::<Envelope>(&payload) {
        Ok(envelope) if envelope.format == ENVELOPE_FORMAT => {
            BrokerMessage { text: envelope.text, reply_to: envelope.reply_to }
        }
        _ => BrokerMessage::text(payload),
    }
}

/// Opens connections to one Redis server.
pub struct RedisConnectionFactory {
    client: Client,
    health_check_interval: Duration,
}

impl RedisConnectionFactory {
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1/").
    /// * `health_check_interval` - Period of the liveness `PING`.
    pub fn new(url: &str, health_check_interval: Duration) -> Result<Self, BrokerError> {
        let client = Client::open(url)?;
        Ok(Self { client, health_check_interval })
    }
}

#[async_trait]
impl ConnectionFactory for RedisConnectionFactory {
    async fn create_connection(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let mut commands = self.client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut commands).await?;
        let (started, _) = watch::channel(false);
        log::debug!("Opened Redis connection");
        Ok(Arc::new(RedisConnection {
            shared: Arc::new(Shared {
                client: self.client.clone(),
                commands,
                started,
                cancel: CancellationToken::new(),
                exception_listener: Mutex::new(None),
                failed: AtomicBool::new(false),
            }),
            health_check_interval: self.health_check_interval,
        }))
    }
}

/// State shared by a connection, its sessions and their background tasks.
struct Shared {
    client: Client,
    commands: MultiplexedConnection,
    started: watch::Sender<bool>,
    cancel: CancellationToken,
    exception_listener: Mutex<Option<ExceptionListener>>,
    failed: AtomicBool,
}

impl Shared {
    fn raise(&self, error: BrokerError) {
        if self.cancel.is_cancelled() || self.failed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::warn!("Redis connection failure: {}", error);
        let listener = lock(&self.exception_listener).clone();
        if let Some(listener) = listener {
            listener(error);
        }
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.cancel.is_cancelled() {
            Err(BrokerError::ConnectionClosed("redis connection is closed".to_string()))
        } else {
            Ok(())
        }
    }
}

struct RedisConnection {
    shared: Arc<Shared>,
    health_check_interval: Duration,
}

#[async_trait]
impl BrokerConnection for RedisConnection {
    async fn create_session(&self, mode: SessionMode) -> Result<Box<dyn BrokerSession>, BrokerError> {
        self.shared.ensure_open()?;
        Ok(Box::new(RedisSession {
            shared: Arc::clone(&self.shared),
            mode,
            cancel: self.shared.cancel.child_token(),
            pending: Mutex::new(Vec::new()),
            temporary_queues: Mutex::new(Vec::new()),
        }))
    }

    fn set_exception_listener(&self, listener: ExceptionListener) {
        *lock(&self.shared.exception_listener) = Some(Arc::clone(&listener));
        // A failure raised before any listener was installed is reported now.
        if self.shared.failed.load(Ordering::SeqCst) && !self.shared.cancel.is_cancelled() {
            listener(BrokerError::ConnectionClosed("redis connection failed before listener was set".to_string()));
        }
    }

    async fn start(&self) -> Result<(), BrokerError> {
        self.shared.ensure_open()?;
        if self.shared.started.send_replace(true) {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let interval = self.health_check_interval;
        tokio::spawn(async move {
            let mut commands = shared.commands.clone();
            loop {
                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let ping: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut commands).await;
                if let Err(e) = ping {
                    shared.raise(BrokerError::from(e));
                    break;
                }
            }
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shared.cancel.cancel();
        Ok(())
    }
}

struct RedisSession {
    shared: Arc<Shared>,
    mode: SessionMode,
    cancel: CancellationToken,
    pending: Mutex<Vec<(Destination, String)>>,
    temporary_queues: Mutex<Vec<String>>,
}

impl RedisSession {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        self.shared.ensure_open()?;
        if self.cancel.is_cancelled() {
            return Err(BrokerError::SessionClosed);
        }
        Ok(())
    }

    fn command_for(destination: &Destination, payload: &str) -> redis::Cmd {
        let mut cmd = match destination {
            Destination::Topic(_) => redis::cmd("PUBLISH"),
            Destination::Queue(_) | Destination::TemporaryQueue(_) => redis::cmd("LPUSH"),
        };
        cmd.arg(destination.name()).arg(payload);
        cmd
    }
}

#[async_trait]
impl BrokerSession for RedisSession {
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

        let mut pubsub = self.shared.client.get_async_pubsub().await?;
        pubsub.subscribe(topic.as_str()).await?;

        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        let topic = topic.clone();
        let mut started = self.shared.started.subscribe();
        tokio::spawn(async move {
            let mut messages = pin!(pubsub.into_on_message());
            // Messages published before `start` stay buffered on the stream.
            tokio::select! {
                _ = cancel.cancelled() => return,
                ready = async { started.wait_for(|s| *s).await.is_ok() } => if !ready { return },
            }
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = messages.next() => match next {
                        Some(msg) => match msg.get_payload::<String>() {
                            Ok(payload) => listener.on_message(&decode(payload)),
                            Err(e) => log::warn!("Dropping undecodable message on {}: {}", topic, e),
                        },
                        None => {
                            shared.raise(BrokerError::ConnectionClosed(format!("pub/sub stream for {} ended", topic)));
                            break;
                        }
                    }
                }
            }
            log::debug!("Consumer on {} stopped", topic);
        });
        Ok(())
    }

    async fn create_temporary_queue(&self) -> Result<Destination, BrokerError> {
        self.ensure_open()?;
        let name = format!("tmp.queue.{}", uuid::Uuid::new_v4());
        lock(&self.temporary_queues).push(name.clone());
        Ok(Destination::TemporaryQueue(name))
    }

    async fn send(&self, destination: &Destination, message: BrokerMessage) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let payload = encode(&message)?;
        match self.mode {
            SessionMode::Transacted => {
                lock(&self.pending).push((destination.clone(), payload));
                Ok(())
            }
            SessionMode::AutoAcknowledge => {
                let mut commands = self.shared.commands.clone();
                let _: redis::Value = Self::command_for(destination, &payload).query_async(&mut commands).await?;
                Ok(())
            }
        }
    }

    async fn commit(&self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let pending = std::mem::take(&mut *lock(&self.pending));
        if pending.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (destination, payload) in &pending {
            pipe.add_command(Self::command_for(destination, payload)).ignore();
        }
        let mut commands = self.shared.commands.clone();
        let _: () = pipe.query_async(&mut commands).await?;
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

        let deadline = Instant::now() + timeout;
        let mut commands = self.shared.commands.clone();
        loop {
            let popped: Option<String> = redis::cmd("RPOP").arg(destination.name()).query_async(&mut commands).await?;
            if let Some(payload) = popped {
                return Ok(Some(decode(payload)));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(BrokerError::SessionClosed),
                _ = tokio::time::sleep(RECEIVE_POLL_INTERVAL.min(deadline - now)) => {}
            }
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.cancel.cancel();
        let queues = std::mem::take(&mut *lock(&self.temporary_queues));
        if queues.is_empty() || self.shared.cancel.is_cancelled() {
            return Ok(());
        }
        let mut commands = self.shared.commands.clone();
        let _: () = redis::cmd("DEL").arg(&queues).query_async(&mut commands).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_unwraps_own_envelope() {
        let sent = BrokerMessage::text("hello").with_reply_to(Destination::TemporaryQueue("tmp.queue.1".to_string()));
        let message = decode(encode(&sent).unwrap());
        assert_eq!(message, sent);

        let plain = decode("42.5".to_string());
        assert_eq!(plain.text, "42.5");
        assert!(plain.reply_to.is_none());
    }

    #[test]
    fn test_decode_passes_foreign_json_through_unchanged() {
        for payload in [
            r#"{"text":"OK","tagId":42,"value":17.5}"#,
            r#"{"text":"OK"}"#,
            r#"{"format":"other","text":"OK"}"#,
        ] {
            let message = decode(payload.to_string());
            assert_eq!(message.text, payload);
            assert!(message.reply_to.is_none());
        }
    }

    #[test]
    fn test_factory_rejects_malformed_url() {
        assert!(RedisConnectionFactory::new("not a url", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_queue_commands_use_lpush() {
        let cmd = RedisSession::command_for(&Destination::Queue("requests".to_string()), "{}");
        let packed = String::from_utf8_lossy(&cmd.get_packed_command()).to_string();
        assert!(packed.contains("LPUSH"));
        assert!(packed.contains("requests"));
    }
}
