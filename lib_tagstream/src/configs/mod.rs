//! # Configuration Modules
//!
//! Settings for the proxy and its broker connection.

/// File-backed proxy configuration and its validation.
pub mod config_proxy;

pub use config_proxy::{ConfigError, ProxyConfig};
