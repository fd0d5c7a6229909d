//! # Reconnect & Replay Tests
//!
//! Drives the proxy through broker outages: registrations made while down,
//! severed connections, and the replay that restores every subscription.

mod common;

use common::{connected_proxy, init_logging, proxy_on, recorder, wait_until, LinkCounter};
use lib_tagstream::broker::MemoryBroker;
use lib_tagstream::{ConnectionState, ProxyError, TopicRegistrationDetails};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_registration_while_disconnected_is_activated_on_connect() {
    init_logging();
    let broker = MemoryBroker::new();
    broker.set_available(false);
    let proxy = proxy_on(&broker);
    proxy.start().unwrap();

    let (rec, listener) = recorder();
    let result = proxy.register_update_listener(listener.clone(), TopicRegistrationDetails::new("tags.late", 5)).await;
    assert!(matches!(result, Err(ProxyError::NotConnected(_))));
    assert!(proxy.is_registered_listener(&listener));
    assert_eq!(proxy.channel_session_count(), 0);

    // A few failed attempts go by before the broker comes back.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_ne!(proxy.connection_state(), ConnectionState::Connected);
    broker.set_available(true);
    wait_until("connection after outage", || proxy.is_connected()).await;

    assert_eq!(proxy.active_topics(), vec!["tags.late".to_string()]);
    broker.publish("tags.late", "arrived");
    assert_eq!(rec.updates(), vec![(5, "arrived".to_string())]);

    proxy.stop().await;
}

#[tokio::test]
async fn test_registration_before_start_is_replayed() {
    init_logging();
    let broker = MemoryBroker::new();
    let proxy = proxy_on(&broker);
    assert_eq!(proxy.connection_state(), ConnectionState::Unstarted);

    let (rec, listener) = recorder();
    let result = proxy.register_update_listener(listener, TopicRegistrationDetails::new("tags.early", 1)).await;
    assert!(matches!(result, Err(ProxyError::NotConnected(_))));

    proxy.start().unwrap();
    wait_until("connection", || proxy.is_connected()).await;
    broker.publish("tags.early", "v");
    assert_eq!(rec.count(), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn test_replay_restores_identical_subscriptions() {
    init_logging();
    let broker = MemoryBroker::new();
    let proxy = connected_proxy(&broker).await;

    let recorders: Vec<_> = (0..3).map(|_| recorder()).collect();
    let topics = ["tags.a", "tags.a", "tags.b"];
    for (i, ((_, listener), topic)) in recorders.iter().zip(topics).enumerate() {
        proxy
            .register_update_listener(listener.clone(), TopicRegistrationDetails::new(topic, i as u64))
            .await
            .unwrap();
    }
    let registrations_before = proxy.registrations();
    let topics_before = proxy.active_topics();
    let subscribes_before = broker.subscribe_calls();

    broker.sever_connections();
    wait_until("reconnect", || broker.connections_created() == 2 && proxy.is_connected()).await;

    assert_eq!(proxy.registrations(), registrations_before);
    assert_eq!(proxy.active_topics(), topics_before);
    // One consumer per topic plus supervision, nothing more.
    assert_eq!(broker.subscribe_calls(), subscribes_before * 2);
    assert_eq!(broker.topic_consumer_count("tags.a"), 1);
    assert_eq!(broker.topic_consumer_count("tags.b"), 1);

    broker.publish("tags.a", "a1");
    broker.publish("tags.b", "b1");
    assert_eq!(recorders[0].0.updates(), vec![(0, "a1".to_string())]);
    assert_eq!(recorders[1].0.updates(), vec![(1, "a1".to_string())]);
    assert_eq!(recorders[2].0.updates(), vec![(2, "b1".to_string())]);

    proxy.stop().await;
}

#[tokio::test]
async fn test_connection_listeners_follow_the_link() {
    init_logging();
    let broker = MemoryBroker::new();
    let proxy = proxy_on(&broker);
    let counter = Arc::new(LinkCounter::default());
    proxy.register_connection_listener(counter.clone());
    assert_eq!(proxy.connection_listener_count(), 1);

    proxy.start().unwrap();
    wait_until("first on_connection", || counter.connections() == 1).await;

    broker.sever_connections();
    wait_until("second on_connection", || counter.connections() == 2).await;
    assert_eq!(counter.disconnections(), 1);

    proxy.stop().await;
    assert_eq!(counter.disconnections(), 2);
    assert_eq!(counter.connections(), 2);
    assert!(!proxy.is_running());
}

#[tokio::test]
async fn test_supervision_survives_reconnect() {
    init_logging();
    let broker = MemoryBroker::new();
    let proxy = connected_proxy(&broker).await;
    let events = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));

    struct Collect(Arc<std::sync::Mutex<Vec<String>>>);
    impl lib_tagstream::SupervisionListener for Collect {
        fn on_supervision_event(&self, payload: &str) {
            self.0.lock().unwrap().push(payload.to_string());
        }
    }
    proxy.register_supervision_listener(Arc::new(Collect(events.clone())));

    let topic = proxy.config().supervision_topic.clone();
    broker.publish(&topic, "PROCESS DOWN");
    broker.sever_connections();
    wait_until("reconnect", || broker.connections_created() == 2 && proxy.is_connected()).await;
    broker.publish(&topic, "PROCESS UP");

    assert_eq!(*events.lock().unwrap(), vec!["PROCESS DOWN".to_string(), "PROCESS UP".to_string()]);
    proxy.stop().await;
}

#[tokio::test]
async fn test_stop_prevents_further_reconnects() {
    init_logging();
    let broker = MemoryBroker::new();
    broker.set_available(false);
    let proxy = proxy_on(&broker);
    proxy.start().unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    proxy.stop().await;
    broker.set_available(true);
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert_eq!(broker.connections_created(), 0);
    assert_eq!(proxy.connection_state(), ConnectionState::Shutdown);
    assert!(matches!(proxy.start(), Err(ProxyError::Shutdown)));
}
