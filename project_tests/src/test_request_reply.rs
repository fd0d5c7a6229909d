//! # Request/Reply Tests

mod common;

use common::{connected_proxy, init_logging, proxy_on};
use lib_tagstream::broker::MemoryBroker;
use lib_tagstream::{JsonRequest, ProxyError};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TagQuery {
    tag_ids: Vec<u64>,
}

#[derive(Deserialize, Debug, PartialEq)]
struct TagValue {
    id: u64,
    value: f64,
}

fn query(ids: &[u64]) -> JsonRequest<TagQuery, TagValue> {
    JsonRequest::new(TagQuery { tag_ids: ids.to_vec() })
}

#[tokio::test]
async fn test_request_returns_decoded_reply() {
    init_logging();
    let broker = MemoryBroker::new();
    broker.respond_to("tags.request", |body| {
        let parsed: serde_json::Value = serde_json::from_str(body).ok()?;
        let values: Vec<serde_json::Value> = parsed["tagIds"]
            .as_array()?
            .iter()
            .map(|id| serde_json::json!({ "id": id, "value": 1.5 }))
            .collect();
        Some(serde_json::Value::Array(values).to_string())
    });
    let proxy = connected_proxy(&broker).await;

    let reply = proxy.send_request(&query(&[7, 8]), "tags.request", Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply, vec![TagValue { id: 7, value: 1.5 }, TagValue { id: 8, value: 1.5 }]);
    assert_eq!(broker.live_temporary_queues(), 0);

    proxy.stop().await;
}

#[tokio::test]
async fn test_request_times_out_and_releases_reply_queue() {
    init_logging();
    let broker = MemoryBroker::new();
    let proxy = connected_proxy(&broker).await;
    let timeout = Duration::from_millis(100);

    let started = Instant::now();
    let result = proxy.send_request(&query(&[1]), "nobody.listening", timeout).await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(ProxyError::Timeout { .. })));
    assert!(elapsed >= Duration::from_millis(95), "returned early: {:?}", elapsed);
    assert!(elapsed < timeout + Duration::from_millis(500), "returned late: {:?}", elapsed);
    assert_eq!(broker.live_temporary_queues(), 0);
    // Only the supervision session remains.
    assert_eq!(broker.live_sessions(), 1);

    // The request itself was committed to the queue.
    assert!(broker.pop_from_queue("nobody.listening").is_some());

    proxy.stop().await;
}

#[tokio::test]
async fn test_default_timeout_comes_from_config() {
    init_logging();
    let broker = MemoryBroker::new();
    let proxy = connected_proxy(&broker).await;

    let started = Instant::now();
    let result = proxy.send_request_with_default_timeout(&query(&[1]), "silent").await;
    assert!(matches!(result, Err(ProxyError::Timeout { timeout, .. }) if timeout == Duration::from_millis(500)));
    assert!(started.elapsed() >= Duration::from_millis(450));

    proxy.stop().await;
}

#[tokio::test]
async fn test_malformed_reply_is_a_codec_error() {
    init_logging();
    let broker = MemoryBroker::new();
    broker.respond_to("tags.request", |_| Some("<html>".to_string()));
    let proxy = connected_proxy(&broker).await;

    let result = proxy.send_request(&query(&[1]), "tags.request", Duration::from_secs(2)).await;
    assert!(matches!(result, Err(ProxyError::Codec(_))));
    assert_eq!(broker.live_temporary_queues(), 0);

    proxy.stop().await;
}

#[tokio::test]
async fn test_request_rejected_while_disconnected_or_without_queue() {
    init_logging();
    let broker = MemoryBroker::new();
    let proxy = proxy_on(&broker);
    let result = proxy.send_request(&query(&[1]), "tags.request", Duration::from_millis(50)).await;
    assert!(matches!(result, Err(ProxyError::NotConnected(_))));

    proxy.start().unwrap();
    common::wait_until("connection", || proxy.is_connected()).await;
    let result = proxy.send_request(&query(&[1]), "", Duration::from_millis(50)).await;
    assert!(matches!(result, Err(ProxyError::InvalidArgument(_))));

    proxy.stop().await;
}
