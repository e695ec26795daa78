//! Registry role.
//!
//! The registry is the authoritative directory of providers and brokers.
//! Providers register their declarations over `/registry`; brokers register
//! their id and bootstrap with `getDeclarations`. Every provider change is
//! relayed fire-and-forget to all registered brokers. When a connection
//! closes, whatever it registered is removed.

use crate::connection::Connection;
use crate::directory::MeshDirectory;
use crate::endpoint::{method, ConnectionHooks, Endpoint};
use async_trait::async_trait;
use dashmap::DashMap;
use drp_types::{DrpError, DrpResult, ProviderDeclaration};
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Route the registry listens on.
pub const REGISTRY_ROUTE: &str = "/registry";

pub struct Registry {
    registry_id: String,
    endpoint: Arc<Endpoint>,
    directory: MeshDirectory,
    brokers: DashMap<String, Arc<Connection>>,
}

impl Registry {
    pub fn new(registry_id: &str) -> Arc<Self> {
        let registry = Arc::new(Self {
            registry_id: registry_id.to_string(),
            endpoint: Endpoint::new("registry"),
            directory: MeshDirectory::new(),
            brokers: DashMap::new(),
        });

        let ep = &registry.endpoint;
        ep.register_command("registerProvider", method(&registry, Registry::cmd_register_provider));
        ep.register_command("register", method(&registry, Registry::cmd_register_provider));
        ep.register_command("unregisterProvider", method(&registry, Registry::cmd_unregister_provider));
        ep.register_command("unregister", method(&registry, Registry::cmd_unregister_provider));
        ep.register_command("registerBroker", method(&registry, Registry::cmd_register_broker));
        ep.register_command("getDeclarations", method(&registry, Registry::cmd_get_declarations));
        ep.set_hooks(Arc::new(RegistryHooks {
            registry: Arc::downgrade(&registry),
        }));
        registry
    }

    pub fn id(&self) -> &str {
        &self.registry_id
    }

    /// Endpoint to mount on [`REGISTRY_ROUTE`].
    pub fn endpoint(&self) -> Arc<Endpoint> {
        Arc::clone(&self.endpoint)
    }

    pub fn directory(&self) -> &MeshDirectory {
        &self.directory
    }

    /// Insert or overwrite a provider and tell every broker.
    pub fn register_provider(&self, declaration: ProviderDeclaration, conn_id: Option<u64>) -> bool {
        let provider_id = declaration.provider_id.clone();
        let payload = serde_json::to_value(&declaration).unwrap_or(Value::Null);
        let is_new = self.directory.register_provider(declaration, conn_id);
        info!(provider = %provider_id, new = is_new, "Provider registered");
        self.relay_to_brokers("registerProvider", payload);
        is_new
    }

    /// Remove a provider and tell every broker. Returns whether it existed.
    pub fn unregister_provider(&self, provider_id: &str) -> bool {
        if self.directory.unregister_provider(provider_id).is_none() {
            return false;
        }
        info!(provider = %provider_id, "Provider unregistered");
        self.relay_to_brokers("unregisterProvider", json!(provider_id));
        true
    }

    fn relay_to_brokers(&self, cmd: &str, params: Value) {
        let mut dead = Vec::new();
        for entry in self.brokers.iter() {
            match entry.value().send_cmd_oneway(cmd, params.clone()) {
                Ok(()) => debug!(broker = %entry.key(), cmd, "Relayed to broker"),
                Err(_) => dead.push(entry.key().clone()),
            }
        }
        for broker_id in dead {
            self.brokers.remove(&broker_id);
            self.directory.unregister_broker(&broker_id);
        }
    }

    async fn cmd_register_provider(
        self: Arc<Self>,
        params: Value,
        conn: Arc<Connection>,
        _token: Option<u64>,
    ) -> DrpResult<Value> {
        let declaration: ProviderDeclaration = serde_json::from_value(params)
            .map_err(|e| DrpError::InvalidParams(format!("bad declaration: {e}")))?;
        if declaration.provider_id.is_empty() {
            return Ok(json!("NO PROVIDER ID"));
        }
        self.register_provider(declaration, Some(conn.id()));
        Ok(json!("OKAY"))
    }

    async fn cmd_unregister_provider(
        self: Arc<Self>,
        params: Value,
        _conn: Arc<Connection>,
        _token: Option<u64>,
    ) -> DrpResult<Value> {
        let provider_id = provider_id_param(&params)
            .ok_or_else(|| DrpError::InvalidParams("provider id required".to_string()))?;
        Ok(json!(self.unregister_provider(&provider_id)))
    }

    async fn cmd_register_broker(
        self: Arc<Self>,
        params: Value,
        conn: Arc<Connection>,
        _token: Option<u64>,
    ) -> DrpResult<Value> {
        let broker_id = match &params {
            Value::String(id) if !id.is_empty() => id.clone(),
            Value::Object(map) => match map.get("brokerID").and_then(Value::as_str) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => return Ok(json!("NO BROKER ID")),
            },
            _ => return Ok(json!("NO BROKER ID")),
        };
        info!(broker = %broker_id, conn = conn.id(), "Broker registered");
        self.directory.register_broker(&broker_id, conn.id());
        self.brokers.insert(broker_id, conn);
        Ok(json!("OKAY"))
    }

    async fn cmd_get_declarations(
        self: Arc<Self>,
        _params: Value,
        _conn: Arc<Connection>,
        _token: Option<u64>,
    ) -> DrpResult<Value> {
        Ok(serde_json::to_value(self.directory.declarations())?)
    }

    fn connection_closed(&self, conn: &Connection) {
        for broker_id in self.directory.brokers_owned_by(conn.id()) {
            info!(broker = %broker_id, "Broker connection closed");
            self.directory.unregister_broker(&broker_id);
            self.brokers.remove(&broker_id);
        }
        for provider_id in self.directory.providers_owned_by(conn.id()) {
            self.unregister_provider(&provider_id);
        }
    }
}

/// Accepts `"id"`, `{"ProviderID": "id"}` or `{"providerID": "id"}`.
pub(crate) fn provider_id_param(params: &Value) -> Option<String> {
    let id = match params {
        Value::String(id) => Some(id.as_str()),
        Value::Object(map) => map
            .get("ProviderID")
            .or_else(|| map.get("providerID"))
            .and_then(Value::as_str),
        _ => None,
    };
    id.filter(|id| !id.is_empty()).map(str::to_string)
}

struct RegistryHooks {
    registry: Weak<Registry>,
}

#[async_trait]
impl ConnectionHooks for RegistryHooks {
    async fn on_close(&self, conn: Arc<Connection>) {
        if let Some(registry) = self.registry.upgrade() {
            registry.connection_closed(&conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use crate::message::{CmdPacket, Packet, REPLY_OK};
    use tokio::sync::mpsc;

    fn make_conn() -> (Arc<Connection>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Connection::new("peer", tx), rx)
    }

    async fn run(registry: &Registry, conn: &Arc<Connection>, cmd: &str, params: Value) -> Value {
        let reply = registry
            .endpoint()
            .execute(CmdPacket::new(cmd, params, Some(1)), Arc::clone(conn))
            .await;
        assert_eq!(reply.status, REPLY_OK, "{cmd} failed: {}", reply.payload);
        reply.payload
    }

    fn sent_cmds(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<CmdPacket> {
        let mut out = Vec::new();
        while let Ok(Outbound::Text(text)) = rx.try_recv() {
            if let Ok(Packet::Cmd(cmd)) = serde_json::from_str::<Packet>(&text) {
                out.push(cmd);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_register_provider_requires_id() {
        let registry = Registry::new("reg");
        let (conn, _rx) = make_conn();
        assert_eq!(
            run(&registry, &conn, "registerProvider", json!({"Streams": {}})).await,
            json!("NO PROVIDER ID")
        );
        assert_eq!(
            run(&registry, &conn, "registerProvider", json!({"ProviderID": "p1", "Streams": {"ticks": {}}}))
                .await,
            json!("OKAY")
        );
        let decls = run(&registry, &conn, "getDeclarations", Value::Null).await;
        assert!(decls["p1"]["Streams"].get("ticks").is_some());
    }

    #[tokio::test]
    async fn test_register_broker_requires_id() {
        let registry = Registry::new("reg");
        let (conn, _rx) = make_conn();
        assert_eq!(
            run(&registry, &conn, "registerBroker", Value::Null).await,
            json!("NO BROKER ID")
        );
        assert_eq!(
            run(&registry, &conn, "registerBroker", json!("b1")).await,
            json!("OKAY")
        );
        assert_eq!(registry.directory().broker_count(), 1);
    }

    #[tokio::test]
    async fn test_changes_relayed_to_brokers() {
        let registry = Registry::new("reg");
        let (broker, mut broker_rx) = make_conn();
        let (provider, _prov_rx) = make_conn();
        run(&registry, &broker, "registerBroker", json!("b1")).await;

        run(&registry, &provider, "registerProvider", json!({"ProviderID": "p1"})).await;
        run(&registry, &provider, "unregisterProvider", json!("p1")).await;

        let cmds = sent_cmds(&mut broker_rx);
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].cmd, "registerProvider");
        assert_eq!(cmds[0].params["ProviderID"], "p1");
        assert!(cmds[0].replytoken.is_none());
        assert_eq!(cmds[1].cmd, "unregisterProvider");
        assert_eq!(cmds[1].params, json!("p1"));
    }

    #[tokio::test]
    async fn test_connection_close_unregisters() {
        let registry = Registry::new("reg");
        let (broker, mut broker_rx) = make_conn();
        let (provider, _prov_rx) = make_conn();
        run(&registry, &broker, "registerBroker", json!("b1")).await;
        run(&registry, &provider, "register", json!({"ProviderID": "p1"})).await;
        sent_cmds(&mut broker_rx);

        provider.mark_closed();
        registry.endpoint().connection_closed(&provider).await;
        assert!(registry.directory().provider("p1").is_none());
        let cmds = sent_cmds(&mut broker_rx);
        assert_eq!(cmds[0].cmd, "unregisterProvider");

        broker.mark_closed();
        registry.endpoint().connection_closed(&broker).await;
        assert_eq!(registry.directory().broker_count(), 0);
    }

    #[tokio::test]
    async fn test_dead_broker_pruned_on_relay() {
        let registry = Registry::new("reg");
        let (broker, broker_rx) = make_conn();
        let (provider, _prov_rx) = make_conn();
        run(&registry, &broker, "registerBroker", json!({"brokerID": "b1"})).await;
        drop(broker_rx);

        run(&registry, &provider, "registerProvider", json!({"ProviderID": "p1"})).await;
        assert_eq!(registry.directory().broker_count(), 0);
    }

    #[test]
    fn test_provider_id_param() {
        assert_eq!(provider_id_param(&json!("p1")).as_deref(), Some("p1"));
        assert_eq!(
            provider_id_param(&json!({"ProviderID": "p2"})).as_deref(),
            Some("p2")
        );
        assert_eq!(
            provider_id_param(&json!({"providerID": "p3"})).as_deref(),
            Some("p3")
        );
        assert!(provider_id_param(&json!("")).is_none());
        assert!(provider_id_param(&Value::Null).is_none());
    }
}
