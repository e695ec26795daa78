//! Provider role.
//!
//! A provider publishes topics and hosts services. It registers its
//! declaration with the registry and accepts broker connections on
//! [`PROVIDER_ROUTE`], where brokers subscribe to its topics, browse its
//! tree and call its services.

use crate::connection::Connection;
use crate::endpoint::{method, CommandHandler, ConnectionHooks, Endpoint};
use crate::path::{self, PathNode, PathRequest};
use crate::topic::{SubscribeParams, TopicManager, UnsubscribeParams};
use crate::transport::client::{ClientOptions, MeshClient, ReconnectPolicy};
use async_trait::async_trait;
use dashmap::DashMap;
use drp_types::{DrpError, DrpResult, NodeConfig, ProviderDeclaration, ServiceDeclaration};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, info, warn};

/// Route brokers connect to.
pub const PROVIDER_ROUTE: &str = "/provider";

/// A service to host: its declaration plus the handlers behind its commands.
pub struct ServiceDefinition {
    name: String,
    declaration: ServiceDeclaration,
    commands: Vec<(String, Arc<dyn CommandHandler>)>,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declaration: ServiceDeclaration::default(),
            commands: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, handler: impl CommandHandler) -> Self {
        self.commands.push((name.to_string(), Arc::new(handler)));
        self
    }

    pub fn persistence(mut self, persistent: bool) -> Self {
        self.declaration.persistence = persistent;
        self
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.declaration.weight = weight;
        self
    }

    pub fn zone(mut self, zone: impl Into<String>) -> Self {
        self.declaration.zone = Some(zone.into());
        self
    }
}

pub struct Provider {
    config: NodeConfig,
    declaration: RwLock<ProviderDeclaration>,
    endpoint: Arc<Endpoint>,
    registry_endpoint: Arc<Endpoint>,
    topics: TopicManager,
    brokers: DashMap<u64, String>,
    tree: RwLock<BTreeMap<String, PathNode>>,
    registry_clients: Mutex<Vec<Arc<MeshClient>>>,
}

impl Provider {
    pub fn new(config: NodeConfig) -> Arc<Self> {
        let mut declaration = ProviderDeclaration::new(config.node_id.clone());
        declaration.provider_url = Some(config.advertised_url_for(PROVIDER_ROUTE));

        let provider = Arc::new(Self {
            declaration: RwLock::new(declaration),
            endpoint: Endpoint::new("provider"),
            registry_endpoint: Endpoint::new("provider-registry-client"),
            topics: TopicManager::new(),
            brokers: DashMap::new(),
            tree: RwLock::new(BTreeMap::new()),
            registry_clients: Mutex::new(Vec::new()),
            config,
        });

        let ep = &provider.endpoint;
        ep.register_command("registerBroker", method(&provider, Provider::cmd_register_broker));
        ep.register_command("subscribe", method(&provider, Provider::cmd_subscribe));
        ep.register_command("unsubscribe", method(&provider, Provider::cmd_unsubscribe));
        ep.register_command("cliGetPath", method(&provider, Provider::cmd_path));
        ep.register_command("pathCmd", method(&provider, Provider::cmd_path));
        ep.register_command("serviceCommand", method(&provider, Provider::cmd_service_command));
        ep.register_command("getTopics", method(&provider, Provider::cmd_get_topics));
        ep.set_hooks(Arc::new(BrokerConnHooks {
            provider: Arc::downgrade(&provider),
        }));

        provider.registry_endpoint.set_hooks(Arc::new(RegistryClientHooks {
            provider: Arc::downgrade(&provider),
        }));
        provider
    }

    pub fn id(&self) -> &str {
        &self.config.node_id
    }

    /// Endpoint to mount on [`PROVIDER_ROUTE`].
    pub fn endpoint(&self) -> Arc<Endpoint> {
        Arc::clone(&self.endpoint)
    }

    /// Snapshot of the current declaration.
    pub fn declaration(&self) -> ProviderDeclaration {
        self.declaration
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Override the URL brokers dial, e.g. once the listener's port is known.
    pub fn set_provider_url(&self, url: &str) {
        self.declaration
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .provider_url = Some(url.to_string());
    }

    /// Declare a topic. Registries learn about it on the next [`announce`](Self::announce).
    pub fn add_stream(&self, name: &str, description: impl Into<Value>) {
        self.declaration
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .streams
            .insert(name.to_string(), description.into());
    }

    /// Host a service and re-announce the declaration.
    pub async fn add_service(&self, service: ServiceDefinition) {
        let ServiceDefinition {
            name,
            mut declaration,
            commands,
        } = service;
        let mut names = Vec::with_capacity(commands.len());
        for (cmd, handler) in commands {
            self.endpoint.register_service_handler(&name, &cmd, handler);
            names.push(cmd);
        }
        names.sort();
        declaration.client_cmds = names;
        info!(provider = %self.id(), service = %name, cmds = declaration.client_cmds.len(), "Service added");
        self.declaration
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .services
            .insert(name, declaration);
        self.announce().await;
    }

    /// Expose an extra branch under the provider's browsable tree.
    pub fn add_path(&self, name: &str, node: impl Into<PathNode>) {
        self.tree
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), node.into());
    }

    /// Publish to a topic. Returns how many subscribers were reached.
    pub fn publish(&self, topic: &str, payload: Value) -> usize {
        self.topics.send_to_topic(topic, payload)
    }

    pub fn topics(&self) -> &TopicManager {
        &self.topics
    }

    /// Number of brokers currently connected.
    pub fn broker_count(&self) -> usize {
        self.brokers.len()
    }

    /// Connect to a registry, register, and keep reconnecting with the configured delay.
    pub fn connect_registry(&self, url: &str) -> Arc<MeshClient> {
        info!(provider = %self.id(), url, "Connecting to registry");
        let client = MeshClient::start(
            url,
            Arc::clone(&self.registry_endpoint),
            ClientOptions {
                reconnect: ReconnectPolicy::FixedDelay(self.config.reconnect_delay()),
                max_message_size: self.config.max_message_size,
                reply_ttl: self.config.reply_ttl(),
            },
        );
        self.registry_clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&client));
        client
    }

    /// Send the current declaration to every connected registry.
    pub async fn announce(&self) {
        let conns: Vec<Arc<Connection>> = self
            .registry_clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|c| c.current())
            .collect();
        for conn in conns {
            if let Err(e) = self.register_with(&conn).await {
                warn!(provider = %self.id(), registry = %conn.peer(), error = %e, "Re-registration failed");
            }
        }
    }

    pub async fn shutdown(&self) {
        let clients: Vec<_> = self
            .registry_clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for client in clients {
            client.shutdown().await;
        }
        info!(provider = %self.id(), "Provider stopped");
    }

    async fn register_with(&self, conn: &Connection) -> DrpResult<()> {
        let declaration = serde_json::to_value(self.declaration())?;
        let status = conn.call("registerProvider", declaration).await?;
        if status != json!("OKAY") {
            return Err(DrpError::Remote(crate::message::payload_text(&status)));
        }
        Ok(())
    }

    async fn registry_handshake(&self, conn: &Arc<Connection>) -> DrpResult<()> {
        let cmds = conn.call("getCmds", Value::Null).await?;
        debug!(provider = %self.id(), cmds = %cmds, "Registry commands");
        self.register_with(conn).await?;
        let declarations = conn.call("getDeclarations", Value::Null).await?;
        let peers = declarations.as_object().map(|m| m.len()).unwrap_or(0);
        info!(provider = %self.id(), registry = %conn.peer(), providers = peers, "Registered with registry");
        Ok(())
    }

    fn base_object(&self) -> PathNode {
        let declaration = self.declaration();
        let counts = self.topics.topic_counts();

        let mut topic_names: Vec<&String> = declaration.streams.keys().chain(counts.keys()).collect();
        topic_names.sort();
        topic_names.dedup();
        let streams: Map<String, Value> = topic_names
            .into_iter()
            .map(|name| {
                let counts = counts.get(name).copied().unwrap_or_default();
                let stream = json!({
                    "Description": declaration.streams.get(name).cloned().unwrap_or(Value::Null),
                    "SubscriberCount": counts.subscribers,
                    "ReceivedMessages": counts.received_messages,
                    "SentMessages": counts.sent_messages,
                    "LastTen": self.topics.recent_messages(name),
                });
                (name.clone(), stream)
            })
            .collect();

        let mut base = PathNode::map()
            .with("Structure", Value::Object(declaration.structure.clone()))
            .with("Streams", Value::Object(streams))
            .with("Services", serde_json::to_value(&declaration.services).unwrap_or_default());
        for (name, node) in self.tree.read().unwrap_or_else(|e| e.into_inner()).iter() {
            base = base.with(name.clone(), node.clone());
        }
        base
    }

    // --- broker-facing commands ---

    async fn cmd_register_broker(
        self: Arc<Self>,
        params: Value,
        conn: Arc<Connection>,
        _token: Option<u64>,
    ) -> DrpResult<Value> {
        let broker_id = match params {
            Value::String(id) => id,
            other => other
                .get("brokerID")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        };
        info!(provider = %self.id(), broker = %broker_id, "Broker connected");
        self.brokers.insert(conn.id(), broker_id);
        Ok(json!("OKAY"))
    }

    async fn cmd_subscribe(
        self: Arc<Self>,
        params: Value,
        conn: Arc<Connection>,
        _token: Option<u64>,
    ) -> DrpResult<Value> {
        let params: SubscribeParams = serde_json::from_value(params)
            .map_err(|e| DrpError::InvalidParams(e.to_string()))?;
        self.topics
            .subscribe(&params.topic_name, conn, params.stream_token, params.filter);
        Ok(Value::Null)
    }

    async fn cmd_unsubscribe(
        self: Arc<Self>,
        params: Value,
        conn: Arc<Connection>,
        _token: Option<u64>,
    ) -> DrpResult<Value> {
        let params: UnsubscribeParams = serde_json::from_value(params)
            .map_err(|e| DrpError::InvalidParams(e.to_string()))?;
        let removed = match &params.topic_name {
            Some(topic) => usize::from(self.topics.unsubscribe(topic, conn.id(), params.stream_token)),
            None => self.topics.unsubscribe_all(conn.id(), params.stream_token),
        };
        debug!(provider = %self.id(), token = params.stream_token, removed, "Unsubscribed");
        Ok(Value::Null)
    }

    async fn cmd_path(
        self: Arc<Self>,
        params: Value,
        _conn: Arc<Connection>,
        _token: Option<u64>,
    ) -> DrpResult<Value> {
        let request: PathRequest = serde_json::from_value(params)
            .map_err(|e| DrpError::InvalidParams(e.to_string()))?;
        path::resolve(&self.base_object(), &request).await
    }

    async fn cmd_get_topics(
        self: Arc<Self>,
        _params: Value,
        _conn: Arc<Connection>,
        _token: Option<u64>,
    ) -> DrpResult<Value> {
        Ok(serde_json::to_value(self.topics.topic_counts())?)
    }

    /// `{serviceName, cmd, params}`; `method` is accepted in place of `cmd`.
    async fn cmd_service_command(
        self: Arc<Self>,
        params: Value,
        conn: Arc<Connection>,
        token: Option<u64>,
    ) -> DrpResult<Value> {
        let service = params
            .get("serviceName")
            .and_then(Value::as_str)
            .ok_or_else(|| DrpError::InvalidParams("serviceName required".to_string()))?;
        let cmd = params
            .get("cmd")
            .or_else(|| params.get("method"))
            .and_then(Value::as_str)
            .ok_or_else(|| DrpError::InvalidParams("cmd required".to_string()))?;
        let inner = params.get("params").cloned().unwrap_or(Value::Null);
        self.endpoint
            .call_service(service, cmd, inner, conn, token)
            .await
    }

    fn broker_closed(&self, conn: &Connection) {
        let removed = self.topics.remove_connection(conn.id());
        if let Some((_, broker_id)) = self.brokers.remove(&conn.id()) {
            info!(provider = %self.id(), broker = %broker_id, subscriptions = removed, "Broker disconnected");
        }
    }
}

struct BrokerConnHooks {
    provider: Weak<Provider>,
}

#[async_trait]
impl ConnectionHooks for BrokerConnHooks {
    async fn on_close(&self, conn: Arc<Connection>) {
        if let Some(provider) = self.provider.upgrade() {
            provider.broker_closed(&conn);
        }
    }
}

struct RegistryClientHooks {
    provider: Weak<Provider>,
}

#[async_trait]
impl ConnectionHooks for RegistryClientHooks {
    async fn on_open(&self, conn: Arc<Connection>) {
        let Some(provider) = self.provider.upgrade() else {
            return;
        };
        if let Err(e) = provider.registry_handshake(&conn).await {
            warn!(provider = %provider.id(), error = %e, "Registry handshake failed");
        }
    }

    async fn on_close(&self, conn: Arc<Connection>) {
        warn!(registry = %conn.peer(), "Registry connection closed");
    }
}
