//! # Subscription Lifecycle Tests
//!
//! Register, unregister and replace against a connected proxy on the in-memory
//! broker, checking both the proxy's bookkeeping and what the broker sees.

mod common;

use common::{connected_proxy, init_logging, recorder, wait_until};
use lib_tagstream::broker::MemoryBroker;
use lib_tagstream::{ProxyError, TopicRegistrationDetails};

#[tokio::test]
async fn test_listeners_share_one_session_per_topic() {
    init_logging();
    let broker = MemoryBroker::new();
    let proxy = connected_proxy(&broker).await;

    let (first, first_listener) = recorder();
    let (second, second_listener) = recorder();
    let (third, third_listener) = recorder();
    proxy.register_update_listener(first_listener, TopicRegistrationDetails::new("tags.a", 1)).await.unwrap();
    proxy.register_update_listener(second_listener, TopicRegistrationDetails::new("tags.a", 2)).await.unwrap();
    proxy.register_update_listener(third_listener, TopicRegistrationDetails::new("tags.b", 3)).await.unwrap();

    assert_eq!(proxy.channel_session_count(), 2);
    assert_eq!(proxy.active_topics(), vec!["tags.a".to_string(), "tags.b".to_string()]);
    assert_eq!(broker.topic_consumer_count("tags.a"), 1);

    broker.publish("tags.a", "17.5");
    assert_eq!(first.updates(), vec![(1, "17.5".to_string())]);
    assert_eq!(second.updates(), vec![(2, "17.5".to_string())]);
    assert_eq!(third.count(), 0);

    proxy.stop().await;
}

#[tokio::test]
async fn test_unregister_closes_session_only_when_empty() {
    init_logging();
    let broker = MemoryBroker::new();
    let proxy = connected_proxy(&broker).await;
    // Supervision session is always there.
    assert_eq!(broker.live_sessions(), 1);

    let (_, a) = recorder();
    let (b_rec, b) = recorder();
    proxy.register_update_listener(a.clone(), TopicRegistrationDetails::new("tags.a", 1)).await.unwrap();
    proxy.register_update_listener(b.clone(), TopicRegistrationDetails::new("tags.a", 2)).await.unwrap();

    proxy.unregister_update_listener(&a).await.unwrap();
    assert!(!proxy.is_registered_listener(&a));
    assert!(proxy.is_registered_listener(&b));
    assert_eq!(proxy.channel_session_count(), 1);

    broker.publish("tags.a", "x");
    assert_eq!(b_rec.count(), 1);

    proxy.unregister_update_listener(&b).await.unwrap();
    assert_eq!(proxy.channel_session_count(), 0);
    assert_eq!(proxy.registered_listener_count(), 0);
    assert_eq!(broker.live_sessions(), 1);
    assert_eq!(broker.topic_consumer_count("tags.a"), 0);

    proxy.stop().await;
}

#[tokio::test]
async fn test_double_registration_is_a_noop() {
    init_logging();
    let broker = MemoryBroker::new();
    let proxy = connected_proxy(&broker).await;
    let subscribes_before = broker.subscribe_calls();

    let (rec, listener) = recorder();
    let details = TopicRegistrationDetails::new("tags.a", 9);
    proxy.register_update_listener(listener.clone(), details.clone()).await.unwrap();
    proxy.register_update_listener(listener.clone(), details).await.unwrap();

    assert_eq!(proxy.registered_listener_count(), 1);
    assert_eq!(broker.subscribe_calls(), subscribes_before + 1);
    broker.publish("tags.a", "once");
    assert_eq!(rec.count(), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn test_unknown_listener_is_illegal_state() {
    init_logging();
    let broker = MemoryBroker::new();
    let proxy = connected_proxy(&broker).await;
    let (_, stranger) = recorder();
    let (_, other) = recorder();

    assert!(matches!(
        proxy.unregister_update_listener(&stranger).await,
        Err(ProxyError::IllegalState(_))
    ));
    assert!(matches!(
        proxy.replace_listener(&stranger, other).await,
        Err(ProxyError::IllegalState(_))
    ));

    proxy.stop().await;
}

#[tokio::test]
async fn test_replace_keeps_delivery_without_resubscribing() {
    init_logging();
    let broker = MemoryBroker::new();
    let proxy = connected_proxy(&broker).await;

    let (old_rec, old) = recorder();
    let (new_rec, new) = recorder();
    proxy.register_update_listener(old.clone(), TopicRegistrationDetails::new("tags.r", 4)).await.unwrap();
    broker.publish("tags.r", "before");
    let subscribes_before = broker.subscribe_calls();

    proxy.replace_listener(&old, new.clone()).await.unwrap();

    assert_eq!(broker.subscribe_calls(), subscribes_before);
    assert!(!proxy.is_registered_listener(&old));
    assert!(proxy.is_registered_listener(&new));
    broker.publish("tags.r", "after");
    assert_eq!(old_rec.updates(), vec![(4, "before".to_string())]);
    assert_eq!(new_rec.updates(), vec![(4, "after".to_string())]);

    // The replacement owns the subscription from now on.
    proxy.unregister_update_listener(&new).await.unwrap();
    assert_eq!(proxy.channel_session_count(), 0);

    proxy.stop().await;
}

#[tokio::test]
async fn test_replace_with_registered_listener_is_rejected() {
    init_logging();
    let broker = MemoryBroker::new();
    let proxy = connected_proxy(&broker).await;
    let (_, a) = recorder();
    let (_, b) = recorder();
    proxy.register_update_listener(a.clone(), TopicRegistrationDetails::new("t", 1)).await.unwrap();
    proxy.register_update_listener(b.clone(), TopicRegistrationDetails::new("t", 2)).await.unwrap();

    assert!(matches!(proxy.replace_listener(&a, b).await, Err(ProxyError::IllegalState(_))));
    assert_eq!(proxy.registered_listener_count(), 2);

    proxy.stop().await;
}

#[tokio::test]
async fn test_failed_session_close_triggers_reconnect() {
    init_logging();
    let broker = MemoryBroker::new();
    let proxy = connected_proxy(&broker).await;

    let (_, doomed) = recorder();
    let (survivor_rec, survivor) = recorder();
    proxy.register_update_listener(doomed.clone(), TopicRegistrationDetails::new("tags.x", 1)).await.unwrap();
    proxy.register_update_listener(survivor, TopicRegistrationDetails::new("tags.y", 2)).await.unwrap();

    broker.fail_next_session_close();
    proxy.unregister_update_listener(&doomed).await.unwrap();
    assert!(!proxy.is_registered_listener(&doomed));

    wait_until("reconnect after failed close", || broker.connections_created() == 2 && proxy.is_connected()).await;
    assert_eq!(proxy.active_topics(), vec!["tags.y".to_string()]);
    assert_eq!(broker.topic_consumer_count("tags.x"), 0);

    broker.publish("tags.y", "still here");
    assert_eq!(survivor_rec.count(), 1);

    proxy.stop().await;
}
