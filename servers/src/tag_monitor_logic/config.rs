use clap::Parser;
use lib_tagstream::ProxyConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Tag stream monitor: subscribes to broker topics and logs every update", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "TAGSTREAM_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "TAGSTREAM_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "TAGSTREAM_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "TAGSTREAM_BROKER_URL", help = "Redis broker URL.")]
    pub broker_url: Option<String>,

    #[clap(long, env = "TAGSTREAM_SUPERVISION_TOPIC", help = "Topic carrying supervision events.")]
    pub supervision_topic: Option<String>,

    #[clap(long, env = "TAGSTREAM_RECONNECT_INTERVAL_MS", help = "Pause in milliseconds between connection attempts.")]
    pub reconnect_interval_ms: Option<u64>,

    #[clap(long, env = "TAGSTREAM_REQUEST_TIMEOUT_MS", help = "Default request/reply timeout in milliseconds.")]
    pub request_timeout_ms: Option<u64>,

    #[clap(long, env = "TAGSTREAM_HEALTH_CHECK_INTERVAL_MS", help = "Broker liveness check period in milliseconds.")]
    pub health_check_interval_ms: Option<u64>,

    #[clap(long = "topic", env = "TAGSTREAM_TOPICS", value_delimiter = ',', help = "Topic to monitor (repeatable).")]
    pub topics: Option<Vec<String>>,

    #[clap(long, env = "TAGSTREAM_REQUEST_QUEUE", help = "Queue to send a one-off JSON request to once connected.")]
    pub request_queue: Option<String>,

    #[clap(long, env = "TAGSTREAM_REQUEST_BODY", help = "JSON body of the one-off request.")]
    pub request_body: Option<String>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            broker_url: other.broker_url.or(self.broker_url),
            supervision_topic: other.supervision_topic.or(self.supervision_topic),
            reconnect_interval_ms: other.reconnect_interval_ms.or(self.reconnect_interval_ms),
            request_timeout_ms: other.request_timeout_ms.or(self.request_timeout_ms),
            health_check_interval_ms: other.health_check_interval_ms.or(self.health_check_interval_ms),
            topics: other.topics.or(self.topics),
            request_queue: other.request_queue.or(self.request_queue),
            request_body: other.request_body.or(self.request_body),
        }
    }

    /// Settings the proxy runs with; unset values take the proxy defaults.
    pub fn to_proxy_config(&self) -> ProxyConfig {
        let defaults = ProxyConfig::default();
        ProxyConfig {
            broker_url: self.broker_url.clone().unwrap_or(defaults.broker_url),
            supervision_topic: self.supervision_topic.clone().unwrap_or(defaults.supervision_topic),
            reconnect_interval_ms: self.reconnect_interval_ms.unwrap_or(defaults.reconnect_interval_ms),
            // The monitor starts the proxy itself once its listeners are in place
            auto_startup: false,
            request_timeout_ms: self.request_timeout_ms.unwrap_or(defaults.request_timeout_ms),
            health_check_interval_ms: self.health_check_interval_ms.unwrap_or(defaults.health_check_interval_ms),
        }
    }
}

fn defaults() -> Config {
    Config {
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        ..Default::default()
    }
}

/// Layers defaults, then the config file, then `cli` (CLI arguments and
/// environment variables).
pub fn resolve(cli: Config) -> Config {
    let mut current_config = defaults();

    let config_file_path = cli.config_path.clone().unwrap_or_else(|| PathBuf::from("tag_monitor.conf"));

    if config_file_path.exists() {
        if let Ok(config_str) = fs::read_to_string(&config_file_path) {
            if let Ok(file_config) = serde_json::from_str::<Config>(&config_str) {
                current_config = current_config.merge(file_config);
            } else {
                log::warn!("Failed to parse config file: {}. Falling back to other sources.", config_file_path.display());
            }
        } else {
            log::warn!("Failed to read config file: {}. Falling back to other sources.", config_file_path.display());
        }
    } else {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", config_file_path.display());
    }

    current_config.merge(cli)
}

pub fn load_config() -> Config {
    resolve(Config::parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cli_overrides_file_and_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"brokerUrl":"redis://file/","logLevel":"debug","topics":["a","b"]}}"#
        )
        .unwrap();

        let cli = Config {
            config_path: Some(file.path().to_path_buf()),
            broker_url: Some("redis://cli/".to_string()),
            ..Default::default()
        };
        let config = resolve(cli);

        assert_eq!(config.broker_url.as_deref(), Some("redis://cli/"));
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.log_dir, Some(PathBuf::from("./logs")));
        assert_eq!(config.topics, Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn test_proxy_config_falls_back_to_defaults() {
        let config = Config { reconnect_interval_ms: Some(250), ..Default::default() };
        let proxy = config.to_proxy_config();
        assert_eq!(proxy.reconnect_interval_ms, 250);
        assert_eq!(proxy.supervision_topic, ProxyConfig::default().supervision_topic);
        assert!(proxy.validate().is_ok());
    }

    #[test]
    fn test_cli_parses_repeated_topics() {
        let cli = Config::parse_from(["tag_monitor", "--topic", "t1", "--topic", "t2,t3"]);
        assert_eq!(cli.topics, Some(vec!["t1".to_string(), "t2".to_string(), "t3".to_string()]));
    }
}
