//! Long-running node roles: registry, broker, demo provider.

use super::{resolve_config, runtime};
use crate::cli::NodeArgs;
use anyhow::Context;
use drp_mesh::{
    Broker, Connection, MeshServer, PathNode, PathRequest, Provider, Registry,
    ServiceDefinition, BROKER_ROUTE, PROVIDER_ROUTE, REGISTRY_ROUTE,
};
use drp_types::NodeConfig;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

fn server(cfg: &NodeConfig) -> MeshServer {
    MeshServer::new()
        .max_message_size(cfg.max_message_size)
        .reply_ttl(cfg.reply_ttl())
}

async fn wait_for_ctrl_c() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutdown requested");
    Ok(())
}

pub fn cmd_registry(config: Option<PathBuf>, node: NodeArgs) -> anyhow::Result<()> {
    let cfg = resolve_config(config, &node);
    runtime()?.block_on(async move {
        let registry = Registry::new(&cfg.node_id);
        let running = server(&cfg)
            .route(REGISTRY_ROUTE, registry.endpoint())
            .bind(&cfg.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", cfg.listen_addr))?;
        info!(registry = %registry.id(), url = %running.url(REGISTRY_ROUTE), "Registry listening");
        wait_for_ctrl_c().await?;
        running.shutdown().await;
        Ok(())
    })
}

pub fn cmd_broker(config: Option<PathBuf>, node: NodeArgs) -> anyhow::Result<()> {
    let cfg = resolve_config(config, &node);
    let registry_url = cfg
        .registry_url
        .clone()
        .context("A broker needs a registry: pass --registry or set registry_url")?;
    runtime()?.block_on(async move {
        let broker = Broker::new(cfg.clone());
        let running = server(&cfg)
            .route(BROKER_ROUTE, broker.endpoint())
            .bind(&cfg.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", cfg.listen_addr))?;
        info!(broker = %broker.id(), url = %running.url(BROKER_ROUTE), "Broker listening");
        broker.connect_registry(&registry_url);
        wait_for_ctrl_c().await?;
        broker.shutdown().await;
        running.shutdown().await;
        Ok(())
    })
}

pub fn cmd_provider(config: Option<PathBuf>, node: NodeArgs, interval_ms: u64) -> anyhow::Result<()> {
    let cfg = resolve_config(config, &node);
    let registry_url = cfg
        .registry_url
        .clone()
        .context("A provider needs a registry: pass --registry or set registry_url")?;
    let interval = Duration::from_millis(interval_ms.max(1));
    runtime()?.block_on(async move {
        let provider = Provider::new(cfg.clone());
        provider.add_stream(
            "ticks",
            json!({ "Description": "Monotonic counter with a timestamp", "IntervalMs": interval_ms }),
        );
        provider.add_path("Config", demo_config(&cfg, interval_ms));

        let running = server(&cfg)
            .route(PROVIDER_ROUTE, provider.endpoint())
            .bind(&cfg.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", cfg.listen_addr))?;
        if cfg.advertised_url.is_none() && cfg.listen_addr.ends_with(":0") {
            provider.set_provider_url(&running.url(PROVIDER_ROUTE));
        }
        info!(provider = %provider.id(), url = %running.url(PROVIDER_ROUTE), "Provider listening");

        provider.connect_registry(&registry_url);
        provider.add_service(demo_service()).await;

        let ticker = {
            let provider = Arc::clone(&provider);
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(interval);
                let mut n: u64 = 0;
                loop {
                    timer.tick().await;
                    n += 1;
                    provider.publish(
                        "ticks",
                        json!({ "n": n, "at": chrono::Utc::now().to_rfc3339() }),
                    );
                }
            })
        };

        wait_for_ctrl_c().await?;
        ticker.abort();
        provider.shutdown().await;
        running.shutdown().await;
        Ok(())
    })
}

/// Browsable demo tree: static settings plus a live clock.
fn demo_config(cfg: &NodeConfig, interval_ms: u64) -> PathNode {
    PathNode::map()
        .with("NodeID", json!(cfg.node_id))
        .with("IntervalMs", json!(interval_ms))
        .with(
            "Clock",
            PathNode::resolver(|_req: PathRequest| async move {
                Ok(json!({ "Now": chrono::Utc::now().to_rfc3339() }))
            }),
        )
}

fn demo_service() -> ServiceDefinition {
    ServiceDefinition::new("Demo")
        .command(
            "echo",
            |params: Value, _conn: Arc<Connection>, _token: Option<u64>| async move { Ok(params) },
        )
        .command(
            "time",
            |_params: Value, _conn: Arc<Connection>, _token: Option<u64>| async move {
                Ok(json!(chrono::Utc::now().to_rfc3339()))
            },
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_config_renders_static_values() {
        let cfg = NodeConfig {
            node_id: "demo".to_string(),
            ..NodeConfig::default()
        };
        let rendered = demo_config(&cfg, 250).to_json();
        assert_eq!(rendered["NodeID"], "demo");
        assert_eq!(rendered["IntervalMs"], 250);
        assert!(rendered.get("Clock").is_none());
    }
}
