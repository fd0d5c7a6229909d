//! # Concurrent Registration Stress Tests
//!
//! Many tasks registering and unregistering at once, optionally while the
//! connection is being torn down and rebuilt. Each scenario runs several rounds
//! on a multi-threaded runtime.

mod common;

use common::{connected_proxy, init_logging, recorder, wait_until, Recorder};
use futures_util::future::join_all;
use lib_tagstream::broker::MemoryBroker;
use lib_tagstream::{TopicRegistrationDetails, UpdateListener};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

const ROUNDS: usize = 5;
const LISTENERS: usize = 100;
const TOPICS: usize = 10;

fn topic(i: usize) -> String {
    format!("tags.stress.{}", i % TOPICS)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hundred_listeners_on_ten_topics() {
    init_logging();
    for round in 0..ROUNDS {
        let broker = MemoryBroker::new();
        let proxy = connected_proxy(&broker).await;
        let listeners: Vec<(Arc<Recorder>, Arc<dyn UpdateListener>)> = (0..LISTENERS).map(|_| recorder()).collect();

        let registrations = listeners.iter().enumerate().map(|(i, (_, listener))| {
            let proxy = proxy.clone();
            let listener = listener.clone();
            tokio::spawn(async move {
                proxy.register_update_listener(listener, TopicRegistrationDetails::new(topic(i), i as u64)).await
            })
        });
        for result in join_all(registrations).await {
            result.unwrap().unwrap();
        }

        assert_eq!(proxy.channel_session_count(), TOPICS, "round {}", round);
        assert_eq!(proxy.registered_listener_count(), LISTENERS, "round {}", round);
        for t in 0..TOPICS {
            assert_eq!(broker.topic_consumer_count(&topic(t)), 1, "round {} topic {}", round, t);
        }
        // Supervision plus one subscribe per topic.
        assert_eq!(broker.subscribe_calls(), 1 + TOPICS as u64);

        for t in 0..TOPICS {
            broker.publish(&topic(t), "tick");
        }
        assert!(listeners.iter().all(|(rec, _)| rec.count() == 1));

        let unregistrations = listeners.iter().map(|(_, listener)| {
            let proxy = proxy.clone();
            let listener = listener.clone();
            tokio::spawn(async move { proxy.unregister_update_listener(&listener).await })
        });
        for result in join_all(unregistrations).await {
            result.unwrap().unwrap();
        }

        assert_eq!(proxy.channel_session_count(), 0);
        assert_eq!(proxy.registered_listener_count(), 0);
        assert_eq!(broker.live_sessions(), 1);
        proxy.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_churn_never_opens_two_sessions_for_one_topic() {
    init_logging();
    for _ in 0..ROUNDS {
        let broker = MemoryBroker::new();
        let proxy = connected_proxy(&broker).await;
        let done = Arc::new(AtomicBool::new(false));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let watcher = {
            let broker = broker.clone();
            let done = done.clone();
            let max_seen = max_seen.clone();
            tokio::spawn(async move {
                while !done.load(Ordering::SeqCst) {
                    max_seen.fetch_max(broker.topic_consumer_count("tags.hot"), Ordering::SeqCst);
                    tokio::task::yield_now().await;
                }
            })
        };

        let workers = (0..20u64).map(|id| {
            let proxy = proxy.clone();
            tokio::spawn(async move {
                let (_, listener) = recorder();
                for _ in 0..10 {
                    proxy
                        .register_update_listener(listener.clone(), TopicRegistrationDetails::new("tags.hot", id))
                        .await
                        .unwrap();
                    proxy.unregister_update_listener(&listener).await.unwrap();
                }
            })
        });
        for worker in join_all(workers).await {
            worker.unwrap();
        }
        done.store(true, Ordering::SeqCst);
        watcher.await.unwrap();

        assert!(max_seen.load(Ordering::SeqCst) <= 1);
        assert_eq!(proxy.channel_session_count(), 0);
        assert_eq!(broker.topic_consumer_count("tags.hot"), 0);
        proxy.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registrations_racing_a_reconnect_all_end_up_active() {
    init_logging();
    for _ in 0..ROUNDS {
        let broker = MemoryBroker::new();
        let proxy = connected_proxy(&broker).await;
        let listeners: Vec<(Arc<Recorder>, Arc<dyn UpdateListener>)> = (0..50).map(|_| recorder()).collect();

        let registrations: Vec<_> = listeners
            .iter()
            .enumerate()
            .map(|(i, (_, listener))| {
                let proxy = proxy.clone();
                let listener = listener.clone();
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    proxy.register_update_listener(listener, TopicRegistrationDetails::new(topic(i), i as u64)).await
                })
            })
            .collect();
        broker.sever_connections();

        for result in join_all(registrations).await {
            // Registrations that hit the outage are recorded and replayed.
            if let Err(e) = result.unwrap() {
                assert!(e.is_transient(), "unexpected error: {}", e);
            }
        }
        wait_until("reconnect", || broker.connections_created() == 2 && proxy.is_connected()).await;

        assert_eq!(proxy.registered_listener_count(), 50);
        assert_eq!(proxy.channel_session_count(), TOPICS);
        for t in 0..TOPICS {
            assert_eq!(broker.topic_consumer_count(&topic(t)), 1);
            broker.publish(&topic(t), "after");
        }
        assert!(listeners.iter().all(|(rec, _)| rec.count() == 1));
        proxy.stop().await;
    }
}
