//! # Supervision Channel
//!
//! The one always-present subscription: a session on the well-known supervision
//! topic whose messages go to every registered `SupervisionListener`. Observers
//! are kept across reconnects; only the broker session is recreated.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use super::listener::{ListenerKey, SupervisionListener};
use crate::broker::{BrokerConnection, BrokerError, BrokerMessage, BrokerSession, Destination, MessageListener, SessionMode};

#[derive(Default)]
struct SupervisionFanout {
    observers: DashMap<ListenerKey, Arc<dyn SupervisionListener>>,
}

impl MessageListener for SupervisionFanout {
    fn on_message(&self, message: &BrokerMessage) {
        let observers: Vec<Arc<dyn SupervisionListener>> =
            self.observers.iter().map(|e| Arc::clone(e.value())).collect();
        for observer in observers {
            observer.on_supervision_event(&message.text);
        }
    }
}

pub(crate) struct SupervisionChannel {
    topic: Destination,
    fanout: Arc<SupervisionFanout>,
    session: Mutex<Option<Box<dyn BrokerSession>>>,
}

impl SupervisionChannel {
    pub(crate) fn new(topic: &str) -> Self {
        Self {
            topic: Destination::Topic(topic.to_string()),
            fanout: Arc::new(SupervisionFanout::default()),
            session: Mutex::new(None),
        }
    }

    pub(crate) fn add_listener(&self, listener: Arc<dyn SupervisionListener>) {
        self.fanout.observers.insert(ListenerKey::of(&listener), listener);
    }

    pub(crate) fn remove_listener(&self, listener: &Arc<dyn SupervisionListener>) -> bool {
        self.fanout.observers.remove(&ListenerKey::of(listener)).is_some()
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.fanout.observers.len()
    }

    /// Binds a fresh consumer on `connection`. The previous session, if any, is
    /// dropped without a broker call: it belonged to the connection being
    /// replaced, whose close already released it.
    pub(crate) async fn subscribe(&self, connection: &dyn BrokerConnection) -> Result<(), BrokerError> {
        let session = connection.create_session(SessionMode::AutoAcknowledge).await?;
        session
            .subscribe(&self.topic, Arc::clone(&self.fanout) as Arc<dyn MessageListener>)
            .await?;
        *self.session.lock().await = Some(session);
        log::debug!("Subscribed to supervision topic {}", self.topic);
        Ok(())
    }
}
