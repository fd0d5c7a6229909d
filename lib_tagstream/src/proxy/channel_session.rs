//! # Channel Session
//!
//! One broker session with one consumer on one topic. Every message that
//! arrives is handed to each listener in the topic's fan-out, together with the
//! subscription id that listener registered under.
//!
//! The fan-out is shared with the broker's delivery task, so adding, swapping or
//! removing a listener never touches the broker.

use std::sync::Arc;

use dashmap::DashMap;

use super::listener::{ListenerKey, ServerUpdate, UpdateListener};
use crate::broker::{BrokerConnection, BrokerError, BrokerMessage, BrokerSession, Destination, MessageListener, SessionMode};

/// Subscription id -> listener map for one topic.
pub(crate) struct TopicFanout {
    topic: String,
    listeners: DashMap<u64, Arc<dyn UpdateListener>>,
}

impl TopicFanout {
    fn new(topic: &str) -> Self {
        Self { topic: topic.to_string(), listeners: DashMap::new() }
    }
}

impl MessageListener for TopicFanout {
    fn on_message(&self, message: &BrokerMessage) {
        let targets: Vec<(u64, Arc<dyn UpdateListener>)> =
            self.listeners.iter().map(|e| (*e.key(), Arc::clone(e.value()))).collect();
        for (subscription_id, listener) in targets {
            listener.on_update(&ServerUpdate { topic: &self.topic, subscription_id, payload: &message.text });
        }
    }
}

/// # Channel Session
///
/// Created on the first subscription to a topic, closed when its fan-out
/// empties or when the connection it lives on is replaced.
pub(crate) struct ChannelSession {
    session: Box<dyn BrokerSession>,
    fanout: Arc<TopicFanout>,
}

impl ChannelSession {
    /// Opens a session on `connection`, binds a consumer on `topic` and files
    /// `listener` under `id` as its first subscriber.
    pub(crate) async fn open(
        connection: &dyn BrokerConnection,
        topic: &str,
        id: u64,
        listener: Arc<dyn UpdateListener>,
    ) -> Result<Self, BrokerError> {
        let session = connection.create_session(SessionMode::AutoAcknowledge).await?;
        let fanout = Arc::new(TopicFanout::new(topic));
        fanout.listeners.insert(id, listener);
        if let Err(e) = session
            .subscribe(&Destination::Topic(topic.to_string()), Arc::clone(&fanout) as Arc<dyn MessageListener>)
            .await
        {
            if let Err(close_err) = session.close().await {
                log::warn!("Failed to release session after subscribe error on {}: {}", topic, close_err);
            }
            return Err(e);
        }
        Ok(Self { session, fanout })
    }

    /// Files `listener` under `id`, replacing whoever held that id.
    pub(crate) fn add_listener(&self, id: u64, listener: Arc<dyn UpdateListener>) {
        self.fanout.listeners.insert(id, listener);
    }

    /// Removes the listener filed under `id`, but only if it is `key`.
    pub(crate) fn remove_listener(&self, id: u64, key: ListenerKey) -> bool {
        self.fanout.listeners.remove_if(&id, |_, l| ListenerKey::of(l) == key).is_some()
    }

    /// True when no listener is left.
    pub(crate) fn is_empty(&self) -> bool {
        self.fanout.listeners.is_empty()
    }

    /// Number of listeners in the fan-out.
    pub(crate) fn listener_count(&self) -> usize {
        self.fanout.listeners.len()
    }

    /// Closes the underlying broker session.
    pub(crate) async fn close(&self) -> Result<(), BrokerError> {
        self.session.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ConnectionFactory, MemoryBroker};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(u64, String)>>);

    impl UpdateListener for Recorder {
        fn on_update(&self, update: &ServerUpdate<'_>) {
            self.0.lock().unwrap().push((update.subscription_id, update.payload.to_string()));
        }
    }

    #[tokio::test]
    async fn test_fanout_delivers_to_every_listener_with_its_id() {
        let broker = MemoryBroker::new();
        let conn = broker.connection_factory().create_connection().await.unwrap();
        conn.start().await.unwrap();

        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let channel = ChannelSession::open(conn.as_ref(), "tags.a", 1, first.clone()).await.unwrap();
        channel.add_listener(2, second.clone());

        assert_eq!(broker.publish("tags.a", "v1"), 1);
        assert_eq!(*first.0.lock().unwrap(), vec![(1, "v1".to_string())]);
        assert_eq!(*second.0.lock().unwrap(), vec![(2, "v1".to_string())]);
        assert_eq!(channel.listener_count(), 2);
    }

    #[tokio::test]
    async fn test_remove_listener_checks_identity() {
        let broker = MemoryBroker::new();
        let conn = broker.connection_factory().create_connection().await.unwrap();
        let owner: Arc<dyn UpdateListener> = Arc::new(Recorder::default());
        let stranger: Arc<dyn UpdateListener> = Arc::new(Recorder::default());
        let channel = ChannelSession::open(conn.as_ref(), "tags.b", 7, owner.clone()).await.unwrap();

        assert!(!channel.remove_listener(7, ListenerKey::of(&stranger)));
        assert!(!channel.is_empty());
        assert!(channel.remove_listener(7, ListenerKey::of(&owner)));
        assert!(channel.is_empty());

        channel.close().await.unwrap();
        assert_eq!(broker.live_sessions(), 0);
    }
}
