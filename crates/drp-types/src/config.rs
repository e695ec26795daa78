//! Node configuration.
//!
//! Every field has a default so an empty or missing config file yields a
//! usable node. Command-line flags override file values in the binary.

use crate::error::{DrpError, DrpResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Inbound WebSocket frames larger than this are rejected (512 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 512 * 1024 * 1024;

/// Configuration shared by every node role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identifier this node registers under (ProviderID / brokerID).
    pub node_id: String,
    /// Socket address the listening adapter binds.
    pub listen_addr: String,
    /// URL other nodes use to reach this one. Derived from `listen_addr` when unset.
    pub advertised_url: Option<String>,
    /// Registry to connect to (brokers and providers).
    pub registry_url: Option<String>,
    /// Broker to connect to (consumers).
    pub broker_url: Option<String>,
    /// Fixed delay before an initiating adapter reconnects.
    pub reconnect_delay_secs: u64,
    /// How many times a broker polls a provider connection for the open state.
    pub provider_connect_attempts: u32,
    /// Interval between those polls.
    pub provider_connect_poll_ms: u64,
    /// Largest accepted inbound frame in bytes.
    pub max_message_size: usize,
    /// Optional TTL for outstanding replies. `None` waits forever.
    pub reply_ttl_secs: Option<u64>,
    /// Webhook sink settings.
    pub webhook: WebhookConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: "0.0.0.0:8080".to_string(),
            advertised_url: None,
            registry_url: None,
            broker_url: None,
            reconnect_delay_secs: 10,
            provider_connect_attempts: 50,
            provider_connect_poll_ms: 100,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            reply_ttl_secs: None,
            webhook: WebhookConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn provider_connect_poll(&self) -> Duration {
        Duration::from_millis(self.provider_connect_poll_ms)
    }

    pub fn reply_ttl(&self) -> Option<Duration> {
        self.reply_ttl_secs.map(Duration::from_secs)
    }

    /// The URL peers should dial to reach `route` on this node.
    pub fn advertised_url_for(&self, route: &str) -> String {
        match &self.advertised_url {
            Some(url) => url.clone(),
            None => {
                let host = self.listen_addr.replace("0.0.0.0", "127.0.0.1");
                format!("ws://{host}{route}")
            }
        }
    }
}

/// Settings for relays that deliver stream data to HTTP endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Consecutive delivery failures before the relay unsubscribes.
    pub max_errors: u32,
    /// Per-request timeout.
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_errors: 5,
            timeout_secs: 10,
        }
    }
}

/// `~/.drp/config.toml`, or `./config.toml` when there is no home directory.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".drp").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

/// Parse a TOML document. Fields it leaves out keep their defaults.
pub fn parse_config(contents: &str) -> DrpResult<NodeConfig> {
    toml::from_str(contents).map_err(|e| DrpError::Config(e.to_string()))
}

/// Load configuration from `path` (or the default location).
///
/// Missing or unreadable files fall back to defaults with a warning.
pub fn load_config(path: Option<&Path>) -> NodeConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return NodeConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match parse_config(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                NodeConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            NodeConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.reconnect_delay(), Duration::from_secs(10));
        assert_eq!(config.provider_connect_attempts, 50);
        assert_eq!(config.provider_connect_poll(), Duration::from_millis(100));
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert!(config.reply_ttl().is_none());
        assert_eq!(config.webhook.max_errors, 5);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "node_id = \"broker-1\"\nreconnect_delay_secs = 3\n\n[webhook]\nmax_errors = 2"
        )
        .unwrap();

        let config = load_config(Some(file.path()));
        assert_eq!(config.node_id, "broker-1");
        assert_eq!(config.reconnect_delay_secs, 3);
        assert_eq!(config.webhook.max_errors, 2);
        assert_eq!(config.webhook.timeout_secs, 10);
        assert_eq!(config.provider_connect_attempts, 50);
    }

    #[test]
    fn test_invalid_file_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "node_id = [[[").unwrap();
        let config = load_config(Some(file.path()));
        assert_eq!(config.reconnect_delay_secs, 10);
    }

    #[test]
    fn test_parse_error_is_config_error() {
        match parse_config("reconnect_delay_secs = \"soon\"") {
            Err(DrpError::Config(msg)) => assert!(msg.contains("soon")),
            other => panic!("Expected config error, got {other:?}"),
        }
        assert_eq!(parse_config("").unwrap().reconnect_delay_secs, 10);
    }

    #[test]
    fn test_missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.toml")));
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_advertised_url() {
        let mut config = NodeConfig {
            listen_addr: "0.0.0.0:9001".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.advertised_url_for("/provider"),
            "ws://127.0.0.1:9001/provider"
        );
        config.advertised_url = Some("wss://mesh.example.net/provider".to_string());
        assert_eq!(
            config.advertised_url_for("/provider"),
            "wss://mesh.example.net/provider"
        );
    }
}
