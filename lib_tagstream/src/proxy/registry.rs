//! # Subscription Registry
//!
//! The authoritative record of who listens to what:
//!
//! - `registered`: listener identity -> (listener, topic, subscription id). Every
//!   registration lands here, active or not, so a reconnect can replay it.
//! - `topics`: topic name -> slot holding that topic's `ChannelSession`. A slot
//!   is created on first interest. When its session empties, the session is
//!   closed with the slot still mapped and locked, and only then is the slot
//!   retired. Whoever was queued on a retired slot notices and starts over on a
//!   fresh one, so a topic never has two sessions at once.
//! - `listener_locks`: one mutex per listener identity, created on first use and
//!   retired by unregister or replace while it is held. `replace` holds both
//!   identities' locks, taken in `ListenerKey` order.
//!
//! Callers hold the refresh lock's read side around every operation here except
//! `replay`, which runs under the write side and therefore takes no per-listener
//! lock.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::channel_session::ChannelSession;
use super::listener::{ListenerKey, TopicRegistrationDetails, UpdateListener};
use crate::broker::{BrokerConnection, BrokerError};
use crate::error::ProxyError;

struct Registration {
    listener: Arc<dyn UpdateListener>,
    details: TopicRegistrationDetails,
}

#[derive(Default)]
struct TopicSlot {
    channel: Mutex<Option<ChannelSession>>,
}

/// Result of a successful unregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Unregistered {
    /// Bookkeeping done, broker state consistent.
    Clean,
    /// Bookkeeping done, but closing the emptied session failed.
    SessionCloseFailed,
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    registered: DashMap<ListenerKey, Registration>,
    topics: DashMap<String, Arc<TopicSlot>>,
    listener_locks: DashMap<ListenerKey, Arc<Mutex<()>>>,
}

impl SubscriptionRegistry {
    pub(crate) fn is_registered(&self, key: ListenerKey) -> bool {
        self.registered.contains_key(&key)
    }

    pub(crate) fn registered_count(&self) -> usize {
        self.registered.len()
    }

    pub(crate) fn channel_session_count(&self) -> usize {
        self.topics.len()
    }

    pub(crate) fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.iter().map(|e| e.key().clone()).collect();
        topics.sort();
        topics
    }

    pub(crate) fn registered_details(&self) -> Vec<TopicRegistrationDetails> {
        let mut details: Vec<TopicRegistrationDetails> =
            self.registered.iter().map(|e| e.value().details.clone()).collect();
        details.sort_by(|a, b| (&a.topic_name, a.id).cmp(&(&b.topic_name, b.id)));
        details
    }

    /// Registers `listener`. With no live `connection` the registration is only
    /// recorded and `NotConnected` is returned; a broker failure is recorded too
    /// and then propagated.
    pub(crate) async fn register(
        &self,
        listener: Arc<dyn UpdateListener>,
        details: TopicRegistrationDetails,
        connection: Option<&dyn BrokerConnection>,
    ) -> Result<(), ProxyError> {
        let key = ListenerKey::of(&listener);
        let (_lock, _guard) = self.lock_listener(key).await;

        if self.registered.contains_key(&key) {
            log::debug!("Update listener already registered; skipping registration (for Tag {})", details.id);
            return Ok(());
        }

        let Some(connection) = connection else {
            log::warn!(
                "Not connected; Tag {} on {} will be subscribed on reconnection.",
                details.id,
                details.topic_name
            );
            self.registered.insert(key, Registration { listener, details });
            return Err(ProxyError::NotConnected(
                "registration recorded, will subscribe on reconnection".to_string(),
            ));
        };

        let attached = self.attach(connection, &listener, &details).await;
        self.registered.insert(key, Registration { listener, details });
        attached.map_err(|e| {
            log::error!("Failed to subscribe to topic - will do so on reconnection: {}", e);
            ProxyError::from(e)
        })
    }

    /// Unregisters `listener`, closing its topic's session if it was the last one.
    pub(crate) async fn unregister(&self, listener: &Arc<dyn UpdateListener>) -> Result<Unregistered, ProxyError> {
        let key = ListenerKey::of(listener);
        let Some((lock, _guard)) = self.lock_existing(key).await else {
            return Err(ProxyError::IllegalState("Tried to unregister an unrecognized update listener.".to_string()));
        };

        let outcome = match self.registered.get(&key).map(|r| r.details.clone()) {
            Some(details) => self.detach(key, &details).await,
            None => Unregistered::Clean,
        };
        self.registered.remove(&key);
        self.listener_locks.remove_if(&key, |_, l| Arc::ptr_eq(l, &lock));
        Ok(outcome)
    }

    /// Moves `old`'s registration to `new` without touching the broker.
    pub(crate) async fn replace(
        &self,
        old: &Arc<dyn UpdateListener>,
        new: Arc<dyn UpdateListener>,
    ) -> Result<(), ProxyError> {
        let old_key = ListenerKey::of(old);
        let new_key = ListenerKey::of(&new);
        if old_key == new_key {
            return match self.lock_existing(old_key).await {
                Some(_) => Ok(()),
                None => Err(unrecognized_replace()),
            };
        }

        let (old_lock, _old_guard, new_lock, _new_guard) = if old_key < new_key {
            let Some((old_lock, old_guard)) = self.lock_existing(old_key).await else {
                return Err(unrecognized_replace());
            };
            let (new_lock, new_guard) = self.lock_listener(new_key).await;
            (old_lock, old_guard, new_lock, new_guard)
        } else {
            let (new_lock, new_guard) = self.lock_listener(new_key).await;
            let Some((old_lock, old_guard)) = self.lock_existing(old_key).await else {
                self.release_unused_lock(new_key, &new_lock);
                return Err(unrecognized_replace());
            };
            (old_lock, old_guard, new_lock, new_guard)
        };

        let result = self.hand_over(old_key, new_key, new).await;
        match result {
            Ok(()) => {
                self.listener_locks.remove_if(&old_key, |_, l| Arc::ptr_eq(l, &old_lock));
            }
            Err(_) => self.release_unused_lock(new_key, &new_lock),
        }
        result
    }

    // Both listeners' locks are held by the caller.
    async fn hand_over(
        &self,
        old_key: ListenerKey,
        new_key: ListenerKey,
        new: Arc<dyn UpdateListener>,
    ) -> Result<(), ProxyError> {
        if self.registered.contains_key(&new_key) {
            return Err(ProxyError::IllegalState("Replacement listener is already registered.".to_string()));
        }
        let Some(details) = self.registered.get(&old_key).map(|r| r.details.clone()) else {
            return Err(unrecognized_replace());
        };

        let slot = self.topics.get(&details.topic_name).map(|s| Arc::clone(s.value()));
        if let Some(slot) = slot {
            if let Some(channel) = slot.channel.lock().await.as_ref() {
                channel.add_listener(details.id, Arc::clone(&new));
            }
        }

        self.registered.insert(new_key, Registration { listener: new, details });
        self.registered.remove(&old_key);
        Ok(())
    }

    /// Recreates one session per topic for every recorded registration on a new
    /// connection. Only called under the refresh write lock.
    pub(crate) async fn replay(&self, connection: &dyn BrokerConnection) -> Result<(), BrokerError> {
        // Sessions of the previous connection died with it.
        self.topics.clear();
        let entries: Vec<(Arc<dyn UpdateListener>, TopicRegistrationDetails)> = self
            .registered
            .iter()
            .map(|e| (Arc::clone(&e.value().listener), e.value().details.clone()))
            .collect();
        for (listener, details) in &entries {
            self.attach(connection, listener, details).await?;
        }
        log::info!("Replayed {} registrations on {} topics.", entries.len(), self.topics.len());
        Ok(())
    }

    async fn attach(
        &self,
        connection: &dyn BrokerConnection,
        listener: &Arc<dyn UpdateListener>,
        details: &TopicRegistrationDetails,
    ) -> Result<(), BrokerError> {
        let topic = &details.topic_name;
        loop {
            let slot = self.topics.entry(topic.clone()).or_default().clone();
            let mut channel = slot.channel.lock().await;
            if !self.is_current_slot(topic, &slot) {
                continue;
            }
            if let Some(existing) = channel.as_ref() {
                existing.add_listener(details.id, Arc::clone(listener));
                return Ok(());
            }
            return match ChannelSession::open(connection, topic, details.id, Arc::clone(listener)).await {
                Ok(opened) => {
                    *channel = Some(opened);
                    Ok(())
                }
                Err(e) => {
                    self.topics.remove_if(topic, |_, s| Arc::ptr_eq(s, &slot));
                    Err(e)
                }
            };
        }
    }

    async fn detach(&self, key: ListenerKey, details: &TopicRegistrationDetails) -> Unregistered {
        let topic = &details.topic_name;
        let Some(slot) = self.topics.get(topic).map(|s| Arc::clone(s.value())) else {
            return Unregistered::Clean;
        };
        let mut channel = slot.channel.lock().await;
        let emptied = match channel.as_ref() {
            Some(existing) => {
                existing.remove_listener(details.id, key);
                existing.is_empty()
            }
            None => false,
        };
        if !emptied {
            return Unregistered::Clean;
        }

        let Some(closing) = channel.take() else {
            return Unregistered::Clean;
        };
        // The slot stays mapped and locked while closing: attaches for this topic
        // queue on it and only move to a fresh slot once it is retired below.
        let outcome = match closing.close().await {
            Ok(()) => Unregistered::Clean,
            Err(e) => {
                log::error!("Failed to unregister properly from {} ({}); subscriptions will be refreshed.", topic, e);
                Unregistered::SessionCloseFailed
            }
        };
        self.topics.remove_if(topic, |_, s| Arc::ptr_eq(s, &slot));
        drop(channel);
        outcome
    }

    /// Forgets every topic session. Used once the connection carrying them is
    /// gone for good.
    pub(crate) fn clear_sessions(&self) {
        self.topics.clear();
    }

    fn is_current_slot(&self, topic: &str, slot: &Arc<TopicSlot>) -> bool {
        self.topics.get(topic).map(|s| Arc::ptr_eq(s.value(), slot)).unwrap_or(false)
    }

    fn is_current_lock(&self, key: ListenerKey, lock: &Arc<Mutex<()>>) -> bool {
        self.listener_locks.get(&key).map(|l| Arc::ptr_eq(l.value(), lock)).unwrap_or(false)
    }

    async fn lock_listener(&self, key: ListenerKey) -> (Arc<Mutex<()>>, OwnedMutexGuard<()>) {
        loop {
            let lock = self.listener_locks.entry(key).or_default().clone();
            let guard = Arc::clone(&lock).lock_owned().await;
            if self.is_current_lock(key, &lock) {
                return (lock, guard);
            }
        }
    }

    // Drops a lock created for a listener that did not end up registered.
    fn release_unused_lock(&self, key: ListenerKey, lock: &Arc<Mutex<()>>) {
        if !self.registered.contains_key(&key) {
            self.listener_locks.remove_if(&key, |_, l| Arc::ptr_eq(l, lock));
        }
    }

    async fn lock_existing(&self, key: ListenerKey) -> Option<(Arc<Mutex<()>>, OwnedMutexGuard<()>)> {
        loop {
            let lock = self.listener_locks.get(&key).map(|l| Arc::clone(l.value()))?;
            let guard = Arc::clone(&lock).lock_owned().await;
            if self.is_current_lock(key, &lock) {
                return Some((lock, guard));
            }
        }
    }
}

fn unrecognized_replace() -> ProxyError {
    ProxyError::IllegalState("Tried to replace an unrecognized update listener.".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ConnectionFactory, MemoryBroker};
    use crate::proxy::listener::ServerUpdate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl UpdateListener for Counter {
        fn on_update(&self, _update: &ServerUpdate<'_>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn listener() -> Arc<dyn UpdateListener> {
        Arc::new(Counter::default())
    }

    async fn started(broker: &MemoryBroker) -> Arc<dyn BrokerConnection> {
        let conn = broker.connection_factory().create_connection().await.unwrap();
        conn.start().await.unwrap();
        conn
    }

    #[tokio::test]
    async fn test_listeners_on_same_topic_share_one_session() {
        let broker = MemoryBroker::new();
        let conn = started(&broker).await;
        let registry = SubscriptionRegistry::default();

        for id in 0..3 {
            registry
                .register(listener(), TopicRegistrationDetails::new("t.shared", id), Some(conn.as_ref()))
                .await
                .unwrap();
        }
        assert_eq!(registry.channel_session_count(), 1);
        assert_eq!(registry.registered_count(), 3);
        assert_eq!(broker.subscribe_calls(), 1);
    }

    #[tokio::test]
    async fn test_double_register_is_noop() {
        let broker = MemoryBroker::new();
        let conn = started(&broker).await;
        let registry = SubscriptionRegistry::default();
        let l = listener();
        let details = TopicRegistrationDetails::new("t", 1);
        registry.register(l.clone(), details.clone(), Some(conn.as_ref())).await.unwrap();
        registry.register(l.clone(), details, Some(conn.as_ref())).await.unwrap();
        assert_eq!(registry.registered_count(), 1);
        assert_eq!(broker.subscribe_calls(), 1);
    }

    #[tokio::test]
    async fn test_register_without_connection_records_and_fails() {
        let registry = SubscriptionRegistry::default();
        let l = listener();
        let result = registry.register(l.clone(), TopicRegistrationDetails::new("t", 1), None).await;
        assert!(matches!(result, Err(ProxyError::NotConnected(_))));
        assert!(registry.is_registered(ListenerKey::of(&l)));
        assert_eq!(registry.channel_session_count(), 0);
    }

    #[tokio::test]
    async fn test_last_unregister_closes_session() {
        let broker = MemoryBroker::new();
        let conn = started(&broker).await;
        let registry = SubscriptionRegistry::default();
        let a = listener();
        let b = listener();
        registry.register(a.clone(), TopicRegistrationDetails::new("t", 1), Some(conn.as_ref())).await.unwrap();
        registry.register(b.clone(), TopicRegistrationDetails::new("t", 2), Some(conn.as_ref())).await.unwrap();

        assert_eq!(registry.unregister(&a).await.unwrap(), Unregistered::Clean);
        assert_eq!(registry.channel_session_count(), 1);
        assert_eq!(broker.live_sessions(), 1);

        assert_eq!(registry.unregister(&b).await.unwrap(), Unregistered::Clean);
        assert_eq!(registry.channel_session_count(), 0);
        assert_eq!(broker.live_sessions(), 0);
        assert!(!registry.is_registered(ListenerKey::of(&b)));
    }

    #[tokio::test]
    async fn test_unregister_unknown_listener_is_illegal_state() {
        let registry = SubscriptionRegistry::default();
        let result = registry.unregister(&listener()).await;
        assert!(matches!(result, Err(ProxyError::IllegalState(_))));
    }

    #[tokio::test]
    async fn test_failed_close_still_clears_bookkeeping() {
        let broker = MemoryBroker::new();
        let conn = started(&broker).await;
        let registry = SubscriptionRegistry::default();
        let a = listener();
        registry.register(a.clone(), TopicRegistrationDetails::new("t", 1), Some(conn.as_ref())).await.unwrap();

        broker.fail_next_session_close();
        assert_eq!(registry.unregister(&a).await.unwrap(), Unregistered::SessionCloseFailed);
        assert_eq!(registry.registered_count(), 0);
        assert_eq!(registry.channel_session_count(), 0);
    }

    #[tokio::test]
    async fn test_replay_rebuilds_sessions_on_new_connection() {
        let broker = MemoryBroker::new();
        let registry = SubscriptionRegistry::default();
        for (topic, id) in [("a", 1), ("a", 2), ("b", 3)] {
            let _ = registry.register(listener(), TopicRegistrationDetails::new(topic, id), None).await;
        }
        assert_eq!(registry.channel_session_count(), 0);

        let conn = started(&broker).await;
        registry.replay(conn.as_ref()).await.unwrap();
        assert_eq!(registry.active_topics(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(broker.topic_consumer_count("a"), 1);
        assert_eq!(broker.topic_consumer_count("b"), 1);
    }

    #[tokio::test]
    async fn test_replace_waits_for_in_flight_registration_of_new_listener() {
        let broker = MemoryBroker::new();
        let conn = started(&broker).await;
        let registry = Arc::new(SubscriptionRegistry::default());
        let old = listener();
        let new = Arc::new(Counter::default());
        let new_dyn: Arc<dyn UpdateListener> = new.clone();
        registry.register(old.clone(), TopicRegistrationDetails::new("topic.a", 1), Some(conn.as_ref())).await.unwrap();

        broker.set_session_open_delay(Duration::from_millis(150));
        let registering = {
            let registry = Arc::clone(&registry);
            let conn = Arc::clone(&conn);
            let new_dyn = Arc::clone(&new_dyn);
            tokio::spawn(async move {
                registry.register(new_dyn, TopicRegistrationDetails::new("topic.b", 2), Some(conn.as_ref())).await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let replaced = registry.replace(&old, Arc::clone(&new_dyn)).await;
        assert!(matches!(replaced, Err(ProxyError::IllegalState(_))));
        registering.await.unwrap().unwrap();
        broker.set_session_open_delay(Duration::ZERO);
        assert!(registry.is_registered(ListenerKey::of(&old)));

        registry.unregister(&new_dyn).await.unwrap();
        assert_eq!(registry.active_topics(), vec!["topic.a".to_string()]);
        broker.publish("topic.a", "after unregister");
        assert_eq!(new.0.load(Ordering::SeqCst), 0);

        registry.unregister(&old).await.unwrap();
        assert_eq!(registry.channel_session_count(), 0);
        assert_eq!(registry.listener_locks.len(), 0);
    }

    #[tokio::test]
    async fn test_replace_moves_lock_and_fan_out_to_new_listener() {
        let broker = MemoryBroker::new();
        let conn = started(&broker).await;
        let registry = SubscriptionRegistry::default();
        let old = listener();
        let new = Arc::new(Counter::default());
        let new_dyn: Arc<dyn UpdateListener> = new.clone();
        registry.register(old.clone(), TopicRegistrationDetails::new("t", 1), Some(conn.as_ref())).await.unwrap();

        registry.replace(&old, Arc::clone(&new_dyn)).await.unwrap();
        assert!(!registry.is_registered(ListenerKey::of(&old)));
        assert!(!registry.listener_locks.contains_key(&ListenerKey::of(&old)));
        broker.publish("t", "tick");
        assert_eq!(new.0.load(Ordering::SeqCst), 1);

        let again = registry.replace(&old, listener()).await;
        assert!(matches!(again, Err(ProxyError::IllegalState(_))));
        assert_eq!(registry.listener_locks.len(), 1);
        assert_eq!(broker.subscribe_calls(), 1);
    }

    #[tokio::test]
    async fn test_topic_reopens_only_after_old_session_closed() {
        let broker = MemoryBroker::new();
        let conn = started(&broker).await;
        let registry = Arc::new(SubscriptionRegistry::default());
        let a = listener();
        registry.register(a.clone(), TopicRegistrationDetails::new("hot", 1), Some(conn.as_ref())).await.unwrap();

        broker.set_session_close_delay(Duration::from_millis(150));
        let closing = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.unregister(&a).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        let opening = {
            let registry = Arc::clone(&registry);
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                registry.register(listener(), TopicRegistrationDetails::new("hot", 2), Some(conn.as_ref())).await
            })
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(broker.topic_consumer_count("hot"), 1);
        assert!(!opening.is_finished());

        assert_eq!(closing.await.unwrap().unwrap(), Unregistered::Clean);
        opening.await.unwrap().unwrap();
        assert_eq!(broker.topic_consumer_count("hot"), 1);
        assert_eq!(broker.subscribe_calls(), 2);
        assert_eq!(registry.channel_session_count(), 1);
    }
}
