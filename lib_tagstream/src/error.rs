//! # Proxy Errors
//!
//! The typed failures every public `TagProxy` operation can return. Connectivity
//! problems are never terminal: they surface only as `NotConnected` while the
//! reconnect loop works in the background.

use std::time::Duration;

use thiserror::Error;

use crate::broker::BrokerError;
use crate::codec::CodecError;
use crate::configs::ConfigError;

/// Errors returned by the proxy's public operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The broker connection is currently down. For registrations the request
    /// has still been recorded and will be activated on reconnection.
    #[error("Not currently connected: {0}")]
    NotConnected(String),

    /// A caller-supplied argument is unusable.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation does not fit the current registry state (e.g. an unknown listener).
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// No reply arrived on the temporary queue in time.
    #[error("No reply received on {queue} within {timeout:?}")]
    Timeout {
        /// The queue the request was sent to.
        queue: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The request could not be encoded or the reply could not be decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// A broker call failed while the connection was believed to be up.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// The proxy was given an unusable configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The proxy was stopped and will not reconnect.
    #[error("Proxy has been shut down")]
    Shutdown,
}

impl ProxyError {
    /// True for the transient failures the reconnect loop will clear by itself.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProxyError::NotConnected(_) | ProxyError::Broker(_))
    }
}
