//! # lib_tagstream
//!
//! Client-side broker proxy for tag update streams: one shared broker
//! connection, one session per subscribed topic fanned out to any number of
//! listeners, automatic reconnection with subscription replay, a supervision
//! feed and request/reply over temporary queues.
//!
//! Brokers plug in through the traits in [`broker`]. An in-memory broker is
//! always available; a Redis backend ships behind the `redis-broker` feature.

pub mod broker;
pub mod codec;
pub mod configs;
pub mod error;
pub mod proxy;

#[cfg(feature = "loggers")]
pub mod loggers;

pub use codec::{ClientRequest, CodecError, JsonRequest};
pub use configs::{ConfigError, ProxyConfig};
pub use error::ProxyError;
pub use proxy::{
    ConnectionListener, ConnectionState, ServerUpdate, SupervisionListener, TagProxy, TopicRegistrationDetails,
    UpdateListener,
};
