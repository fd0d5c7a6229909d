//! Callback traits implemented by the domain layer, plus the identity key the
//! registry uses for them.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// # Topic Registration Details
///
/// What a listener wants delivered: the topic to consume and the opaque
/// subscription id (typically the id of the monitored tag) under which the
/// listener is filed in that topic's fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicRegistrationDetails {
    /// Broker topic carrying the updates.
    pub topic_name: String,
    /// Subscription id, unique per topic.
    pub id: u64,
}

impl TopicRegistrationDetails {
    /// Builds registration details for `id` on `topic_name`.
    pub fn new(topic_name: impl Into<String>, id: u64) -> Self {
        Self { topic_name: topic_name.into(), id }
    }
}

/// One update delivered to an `UpdateListener`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUpdate<'a> {
    /// Topic the message arrived on.
    pub topic: &'a str,
    /// The subscription id the receiving listener registered with.
    pub subscription_id: u64,
    /// Opaque wire payload.
    pub payload: &'a str,
}

/// Receives updates for a registered topic subscription.
pub trait UpdateListener: Send + Sync {
    /// Called from the broker's delivery task for every message on the topic.
    fn on_update(&self, update: &ServerUpdate<'_>);
}

/// Receives every message published on the supervision topic.
pub trait SupervisionListener: Send + Sync {
    /// Called with the opaque supervision event payload.
    fn on_supervision_event(&self, payload: &str);
}

/// Observes connection establishment and loss.
pub trait ConnectionListener: Send + Sync {
    /// The connection and all subscriptions are (re)established.
    fn on_connection(&self);
    /// The connection was lost or shut down.
    fn on_disconnection(&self);
}

/// Identity of a listener `Arc`, derived from the address of the value it points
/// to.
///
/// The registry keeps a clone of every registered `Arc`, so a key cannot be
/// reused by another allocation while it is registered.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerKey(usize);

impl ListenerKey {
    /// The key of `listener`.
    pub fn of<T: ?Sized>(listener: &Arc<T>) -> Self {
        ListenerKey(Arc::as_ptr(listener) as *const () as usize)
    }
}

impl fmt::Debug for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerKey({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;
    impl UpdateListener for Nop {
        fn on_update(&self, _update: &ServerUpdate<'_>) {}
    }

    #[test]
    fn test_listener_key_follows_arc_identity() {
        let a: Arc<dyn UpdateListener> = Arc::new(Nop);
        let a2 = Arc::clone(&a);
        let b: Arc<dyn UpdateListener> = Arc::new(Nop);
        assert_eq!(ListenerKey::of(&a), ListenerKey::of(&a2));
        assert_ne!(ListenerKey::of(&a), ListenerKey::of(&b));
    }
}
