use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

use lib_tagstream::broker::RedisConnectionFactory;
use lib_tagstream::loggers::setup_logging;
use lib_tagstream::{JsonRequest, TagProxy, TopicRegistrationDetails};

mod tag_monitor_logic;
use tag_monitor_logic::{config, listeners};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config();
    let log_dir = config.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"));
    setup_logging(&log_dir, config.log_level.as_deref().unwrap_or("info"), "tag_monitor")?;

    let proxy_config = config.to_proxy_config();
    let factory = Arc::new(RedisConnectionFactory::new(
        &proxy_config.broker_url,
        proxy_config.health_check_interval(),
    )?);
    let proxy = TagProxy::new(factory, proxy_config)?;

    let monitor = Arc::new(listeners::LinkMonitor::new());
    proxy.register_connection_listener(monitor.clone());
    proxy.register_supervision_listener(monitor.clone());

    // Registered before start: recorded now, activated by the first connect.
    let mut topic_loggers = Vec::new();
    for (id, topic) in config.topics.iter().flatten().enumerate() {
        let topic_logger = Arc::new(listeners::TopicLogger::default());
        let details = TopicRegistrationDetails::new(topic.as_str(), id as u64);
        if let Err(e) = proxy.register_update_listener(topic_logger.clone(), details).await {
            if !e.is_transient() {
                return Err(e.into());
            }
        }
        log::info!("Monitoring topic {}", topic);
        topic_loggers.push((topic.clone(), topic_logger));
    }

    proxy.start()?;

    if let (Some(queue), Some(body)) = (config.request_queue.clone(), config.request_body.clone()) {
        let body: serde_json::Value = serde_json::from_str(&body)?;
        let proxy = proxy.clone();
        let mut connected = monitor.subscribe();
        tokio::spawn(async move {
            if connected.wait_for(|c| *c).await.is_err() {
                return;
            }
            let request: JsonRequest<serde_json::Value, serde_json::Value> = JsonRequest::new(body);
            match proxy.send_request_with_default_timeout(&request, &queue).await {
                Ok(reply) => log::info!("Reply from {}: {} item(s): {:?}", queue, reply.len(), reply),
                Err(e) => log::error!("Request to {} failed: {}", queue, e),
            }
        });
    }

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    proxy
        .stop_with(|| {
            for (topic, topic_logger) in &topic_loggers {
                log::info!("{}: {} update(s) received", topic, topic_logger.received());
            }
            log::info!("Shutdown complete.");
        })
        .await;
    Ok(())
}
