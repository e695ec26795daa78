//! One-shot and streaming consumer commands against a broker.

use super::runtime;
use anyhow::{bail, Context};
use drp_mesh::Consumer;
use drp_types::{load_config, NodeConfig};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// How long one-shot commands wait for the broker connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn consumer_config(config: Option<PathBuf>, broker: Option<String>) -> anyhow::Result<(NodeConfig, String)> {
    let mut cfg = load_config(config.as_deref());
    if broker.is_some() {
        cfg.broker_url = broker;
    }
    let url = cfg
        .broker_url
        .clone()
        .context("No broker to talk to: pass --broker or set broker_url")?;
    Ok((cfg, url))
}

fn parse_json(label: &str, raw: &str) -> anyhow::Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("Invalid JSON in {label}: {raw}"))
}

fn print_json(value: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_default()
    );
}

async fn connected(url: &str, cfg: NodeConfig) -> anyhow::Result<Arc<Consumer>> {
    let consumer = Consumer::connect(url, cfg);
    tokio::time::timeout(CONNECT_TIMEOUT, consumer.connection())
        .await
        .with_context(|| format!("Timed out connecting to {url}"))?
        .with_context(|| format!("Could not connect to {url}"))?;
    Ok(consumer)
}

pub fn cmd_watch(
    config: Option<PathBuf>,
    broker: Option<String>,
    topic: &str,
    filter: Option<String>,
    webhook: Option<String>,
) -> anyhow::Result<()> {
    let (cfg, url) = consumer_config(config, broker)?;
    let filter = filter.map(|f| parse_json("--filter", &f)).transpose()?;
    if filter.is_some() && webhook.is_some() {
        bail!("--filter cannot be combined with --webhook");
    }
    runtime()?.block_on(async move {
        let consumer = connected(&url, cfg).await?;
        let _relay = match webhook {
            Some(hook) => {
                let relay = consumer.subscribe_webhook(topic, &hook).await?;
                info!(topic, webhook = %hook, "Relaying topic to webhook");
                Some(relay)
            }
            None => {
                let handle = consumer
                    .subscribe(topic, filter, |payload| {
                        println!("{}", serde_json::to_string(&payload).unwrap_or_default());
                    })
                    .await?;
                info!(topic, providers = %handle.providers(), "Watching topic");
                None
            }
        };
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        consumer.shutdown().await;
        Ok(())
    })
}

pub fn cmd_call(
    config: Option<PathBuf>,
    broker: Option<String>,
    cmd: &str,
    params: &str,
    service: Option<String>,
) -> anyhow::Result<()> {
    let (cfg, url) = consumer_config(config, broker)?;
    let params = parse_json("params", params)?;
    runtime()?.block_on(async move {
        let consumer = connected(&url, cfg).await?;
        let result = match service {
            Some(service) => consumer.service_cmd(&service, cmd, params).await,
            None => consumer.call(cmd, params).await,
        };
        consumer.shutdown().await;
        print_json(&result?);
        Ok(())
    })
}

pub fn cmd_path(
    config: Option<PathBuf>,
    broker: Option<String>,
    path: &str,
    list_only: bool,
) -> anyhow::Result<()> {
    let (cfg, url) = consumer_config(config, broker)?;
    runtime()?.block_on(async move {
        let consumer = connected(&url, cfg).await?;
        let result = consumer.get_path(path, list_only).await;
        consumer.shutdown().await;
        print_json(&result?);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_flag_wins_over_file() {
        let (cfg, url) = consumer_config(
            Some(PathBuf::from("/nonexistent/drp/config.toml")),
            Some("ws://127.0.0.1:9/broker".to_string()),
        )
        .unwrap();
        assert_eq!(url, "ws://127.0.0.1:9/broker");
        assert_eq!(cfg.broker_url.as_deref(), Some("ws://127.0.0.1:9/broker"));
    }

    #[test]
    fn test_missing_broker_is_an_error() {
        let err = consumer_config(Some(PathBuf::from("/nonexistent/drp/config.toml")), None)
            .unwrap_err();
        assert!(err.to_string().contains("--broker"));
    }

    #[test]
    fn test_parse_json_reports_label() {
        assert_eq!(parse_json("params", "{\"a\":1}").unwrap()["a"], 1);
        let err = parse_json("params", "{nope").unwrap_err();
        assert!(err.to_string().contains("params"));
    }
}
