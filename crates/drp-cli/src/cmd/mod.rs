//! Command implementations by node role.

pub mod consumer;
pub mod node;

use crate::cli::NodeArgs;
use drp_types::{load_config, NodeConfig};
use std::path::PathBuf;

/// Load the config file and apply command-line overrides on top.
pub fn resolve_config(config: Option<PathBuf>, node: &NodeArgs) -> NodeConfig {
    let mut cfg = load_config(config.as_deref());
    apply_overrides(&mut cfg, node);
    cfg
}

fn apply_overrides(cfg: &mut NodeConfig, node: &NodeArgs) {
    if let Some(id) = &node.node_id {
        cfg.node_id = id.clone();
    }
    if let Some(listen) = &node.listen {
        cfg.listen_addr = listen.clone();
    }
    if let Some(url) = &node.advertise {
        cfg.advertised_url = Some(url.clone());
    }
    if let Some(url) = &node.registry {
        cfg.registry_url = Some(url.clone());
    }
}

pub fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Runtime::new()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_file_values() {
        let mut cfg = NodeConfig {
            node_id: "from-file".to_string(),
            registry_url: Some("ws://file/registry".to_string()),
            ..NodeConfig::default()
        };
        let args = NodeArgs {
            node_id: Some("from-flag".to_string()),
            listen: Some("127.0.0.1:9000".to_string()),
            ..NodeArgs::default()
        };
        apply_overrides(&mut cfg, &args);
        assert_eq!(cfg.node_id, "from-flag");
        assert_eq!(cfg.listen_addr, "127.0.0.1:9000");
        assert_eq!(cfg.registry_url.as_deref(), Some("ws://file/registry"));
        assert!(cfg.advertised_url.is_none());
    }

    #[test]
    fn test_missing_config_file_uses_defaults() {
        let cfg = resolve_config(
            Some(PathBuf::from("/nonexistent/drp/config.toml")),
            &NodeArgs::default(),
        );
        assert_eq!(cfg.listen_addr, "0.0.0.0:8080");
        assert_eq!(cfg.reconnect_delay_secs, 10);
    }
}
