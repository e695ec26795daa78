//! Broker role.
//!
//! Consumers connect to a broker on `/broker`. The broker keeps a replica of
//! the registry's directory (fed by its registry client), dials providers on
//! demand and relays their streams to consumers under the consumers' own
//! stream tokens. It also answers path browsing for the whole mesh by
//! forwarding sub-paths to providers and consumers.
//!
//! Three endpoints are involved:
//!
//! - the consumer-facing endpoint mounted on [`BROKER_ROUTE`]
//! - the registry client endpoint (`registerProvider` / `unregisterProvider`)
//! - the provider client endpoint, shared by every outbound provider connection

use crate::connection::Connection;
use crate::directory::MeshDirectory;
use crate::endpoint::{method, ConnectionHooks, Endpoint};
use crate::path::{self, PathNode, PathRequest};
use crate::registry::provider_id_param;
use crate::relay::{MeshSink, RelayHandle, RelaySink};
use crate::topic::{SubscribeParams, TopicManager, UnsubscribeParams};
use crate::transport::client::{ClientOptions, MeshClient, ReconnectPolicy};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use drp_types::{DrpError, DrpResult, NodeConfig, ProviderDeclaration};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

/// Route consumers connect to.
pub const BROKER_ROUTE: &str = "/broker";

/// Topic on which a broker publishes directory changes.
pub const REGISTRY_UPDATE_TOPIC: &str = "RegistryUpdate";

#[derive(Debug, Clone)]
struct Subscription {
    topic: String,
    filter: Option<Value>,
}

struct ConsumerEntry {
    conn: Arc<Connection>,
    info: Value,
    subscriptions: BTreeMap<u64, Subscription>,
}

impl ConsumerEntry {
    fn new(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            info: Value::Null,
            subscriptions: BTreeMap::new(),
        }
    }
}

struct ProviderRelay {
    provider_id: String,
    relay: Arc<RelayHandle>,
}

impl ProviderRelay {
    fn is_live(&self) -> bool {
        !self.relay.is_stopped() && self.relay.upstream().is_open()
    }
}

pub struct Broker {
    config: NodeConfig,
    endpoint: Arc<Endpoint>,
    registry_endpoint: Arc<Endpoint>,
    provider_endpoint: Arc<Endpoint>,
    directory: MeshDirectory,
    topics: TopicManager,
    provider_clients: DashMap<String, Arc<MeshClient>>,
    consumers: DashMap<u64, ConsumerEntry>,
    /// (consumer connection, consumer token) to the provider relays feeding it.
    relays: DashMap<(u64, u64), Vec<ProviderRelay>>,
    registry_clients: Mutex<Vec<Arc<MeshClient>>>,
}

impl Broker {
    pub fn new(config: NodeConfig) -> Arc<Self> {
        let broker = Arc::new(Self {
            endpoint: Endpoint::new("broker"),
            registry_endpoint: Endpoint::new("broker-registry-client"),
            provider_endpoint: Endpoint::new("broker-provider-client"),
            directory: MeshDirectory::new(),
            topics: TopicManager::new(),
            provider_clients: DashMap::new(),
            consumers: DashMap::new(),
            relays: DashMap::new(),
            registry_clients: Mutex::new(Vec::new()),
            config,
        });

        let ep = &broker.endpoint;
        ep.register_command("register", method(&broker, Broker::cmd_register));
        ep.register_command("subscribe", method(&broker, Broker::cmd_subscribe));
        ep.register_command("unsubscribe", method(&broker, Broker::cmd_unsubscribe));
        ep.register_command("pathCmd", method(&broker, Broker::cmd_path));
        ep.register_command("cliGetPath", method(&broker, Broker::cmd_path));
        ep.register_command("getRegistry", method(&broker, Broker::cmd_get_registry));
        ep.register_command("getTopics", method(&broker, Broker::cmd_get_topics));
        ep.register_command("serviceCommand", method(&broker, Broker::cmd_service_command));
        ep.set_hooks(Arc::new(ConsumerHooks {
            broker: Arc::downgrade(&broker),
        }));

        let rep = &broker.registry_endpoint;
        rep.register_command("registerProvider", method(&broker, Broker::cmd_provider_registered));
        rep.register_command("unregisterProvider", method(&broker, Broker::cmd_provider_unregistered));
        rep.set_hooks(Arc::new(RegistryClientHooks {
            broker: Arc::downgrade(&broker),
        }));

        broker.provider_endpoint.set_hooks(Arc::new(ProviderClientHooks {
            broker_id: broker.config.node_id.clone(),
        }));
        broker
    }

    pub fn id(&self) -> &str {
        &self.config.node_id
    }

    /// Endpoint to mount on [`BROKER_ROUTE`].
    pub fn endpoint(&self) -> Arc<Endpoint> {
        Arc::clone(&self.endpoint)
    }

    /// This broker's replica of the registry directory.
    pub fn directory(&self) -> &MeshDirectory {
        &self.directory
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Number of live provider relays feeding consumers.
    pub fn relay_count(&self) -> usize {
        self.relays
            .iter()
            .map(|e| e.value().iter().filter(|r| r.is_live()).count())
            .sum()
    }

    /// Connect to a registry and keep reconnecting with the configured delay.
    pub fn connect_registry(&self, url: &str) -> Arc<MeshClient> {
        info!(broker = %self.id(), url, "Connecting to registry");
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

    /// Stop every outbound client and relay.
    pub async fn shutdown(&self) {
        let registry_clients: Vec<_> = self
            .registry_clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for client in registry_clients {
            client.shutdown().await;
        }
        let keys: Vec<_> = self.relays.iter().map(|e| *e.key()).collect();
        for key in keys {
            self.stop_relays(key);
        }
        let providers: Vec<_> = self.provider_clients.iter().map(|e| e.key().clone()).collect();
        for provider_id in providers {
            if let Some((_, client)) = self.provider_clients.remove(&provider_id) {
                client.shutdown().await;
            }
        }
        info!(broker = %self.id(), "Broker stopped");
    }

    /// Return an open connection to `provider_id`, dialing it if needed.
    ///
    /// Polls for the open state `provider_connect_attempts` times before
    /// giving up with [`DrpError::ProviderUnavailable`].
    pub async fn provider_connection(&self, provider_id: &str) -> DrpResult<Arc<Connection>> {
        let url = self
            .directory
            .provider(provider_id)
            .and_then(|decl| decl.provider_url)
            .ok_or_else(|| DrpError::ProviderUnavailable(provider_id.to_string()))?;

        let client = match self.provider_clients.entry(provider_id.to_string()) {
            Entry::Occupied(mut e) if e.get().is_finished() || e.get().url() != url => {
                let stale = e.insert(self.dial_provider(&url));
                tokio::spawn(async move { stale.shutdown().await });
                Arc::clone(e.get())
            }
            Entry::Occupied(e) => Arc::clone(e.get()),
            Entry::Vacant(e) => Arc::clone(e.insert(self.dial_provider(&url)).value()),
        };

        client
            .wait_open(
                self.config.provider_connect_attempts,
                self.config.provider_connect_poll(),
            )
            .await
            .ok_or_else(|| DrpError::ProviderUnavailable(provider_id.to_string()))
    }

    fn dial_provider(&self, url: &str) -> Arc<MeshClient> {
        debug!(broker = %self.id(), url, "Dialing provider");
        MeshClient::start(
            url,
            Arc::clone(&self.provider_endpoint),
            ClientOptions {
                reconnect: ReconnectPolicy::Never,
                max_message_size: self.config.max_message_size,
                reply_ttl: self.config.reply_ttl(),
            },
        )
    }

    fn drop_provider_client(&self, provider_id: &str) {
        if let Some((_, client)) = self.provider_clients.remove(provider_id) {
            tokio::spawn(async move { client.shutdown().await });
        }
    }

    // --- consumer subscriptions ---

    fn is_subscribed(&self, conn_id: u64, token: u64) -> bool {
        self.consumers
            .get(&conn_id)
            .map(|c| c.subscriptions.contains_key(&token))
            .unwrap_or(false)
    }

    fn has_live_relay(&self, conn_id: u64, token: u64, provider_id: &str) -> bool {
        self.relays
            .get(&(conn_id, token))
            .map(|relays| {
                relays
                    .iter()
                    .any(|r| r.provider_id == provider_id && r.is_live())
            })
            .unwrap_or(false)
    }

    /// Subscribe on a provider and relay its messages to a consumer token.
    async fn relay_from_provider(
        &self,
        provider_id: &str,
        subscription: &Subscription,
        consumer: &Arc<Connection>,
        token: u64,
    ) -> DrpResult<()> {
        let upstream = self.provider_connection(provider_id).await?;
        let extra = match &subscription.filter {
            Some(filter) => json!({ "filter": filter }),
            None => json!({}),
        };
        let sink: Arc<dyn RelaySink> = Arc::new(MeshSink::new(Arc::clone(consumer), token));
        let relay = RelayHandle::subscribe(upstream, &subscription.topic, extra, sink, 1).await?;

        let mut relays = self.relays.entry((consumer.id(), token)).or_default();
        if !self.is_subscribed(consumer.id(), token) {
            drop(relays);
            relay.stop();
            return Err(DrpError::handler("subscription withdrawn"));
        }
        relays.retain(|r| r.is_live());
        relays.push(ProviderRelay {
            provider_id: provider_id.to_string(),
            relay,
        });
        Ok(())
    }

    fn stop_relays(&self, key: (u64, u64)) -> usize {
        match self.relays.remove(&key) {
            Some((_, relays)) => {
                for r in &relays {
                    r.relay.stop();
                }
                relays.len()
            }
            None => 0,
        }
    }

    /// Open relays from `provider_id` for every existing consumer
    /// subscription it can serve and is not already serving.
    async fn resubscribe_provider(&self, provider_id: &str) {
        let Some(declaration) = self.directory.provider(provider_id) else {
            return;
        };
        let wanted: Vec<(Arc<Connection>, u64, Subscription)> = self
            .consumers
            .iter()
            .flat_map(|consumer| {
                consumer
                    .subscriptions
                    .iter()
                    .filter(|(_, sub)| declaration.has_stream(&sub.topic))
                    .map(|(token, sub)| (Arc::clone(&consumer.conn), *token, sub.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        for (conn, token, sub) in wanted {
            if self.has_live_relay(conn.id(), token, provider_id) {
                continue;
            }
            match self.relay_from_provider(provider_id, &sub, &conn, token).await {
                Ok(()) => info!(provider = %provider_id, topic = %sub.topic, token, "Resubscribed consumer"),
                Err(e) => warn!(provider = %provider_id, topic = %sub.topic, error = %e, "Resubscribe failed"),
            }
        }
    }

    async fn resubscribe_all(&self) {
        for provider_id in self.directory.declarations().into_keys() {
            self.resubscribe_provider(&provider_id).await;
        }
    }

    fn consumer_closed(&self, conn: &Connection) {
        self.topics.remove_connection(conn.id());
        let Some((_, entry)) = self.consumers.remove(&conn.id()) else {
            return;
        };
        let mut stopped = 0;
        for token in entry.subscriptions.keys() {
            stopped += self.stop_relays((conn.id(), *token));
        }
        info!(conn = conn.id(), relays = stopped, "Consumer disconnected");
    }

    // --- consumer-facing commands ---

    async fn cmd_register(
        self: Arc<Self>,
        params: Value,
        conn: Arc<Connection>,
        _token: Option<u64>,
    ) -> DrpResult<Value> {
        self.consumers
            .entry(conn.id())
            .or_insert_with(|| ConsumerEntry::new(Arc::clone(&conn)))
            .info = params;
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
        let token = params.stream_token;
        let subscription = Subscription {
            topic: params.topic_name,
            filter: params.filter.filter(|f| !f.is_null()),
        };
        self.consumers
            .entry(conn.id())
            .or_insert_with(|| ConsumerEntry::new(Arc::clone(&conn)))
            .subscriptions
            .insert(token, subscription.clone());

        let mut results = Map::new();
        if subscription.topic == REGISTRY_UPDATE_TOPIC {
            self.topics
                .subscribe(&subscription.topic, Arc::clone(&conn), token, subscription.filter.clone());
            results.insert(self.id().to_string(), json!("OKAY"));
            return Ok(Value::Object(results));
        }

        let providers = self.directory.providers_for_stream(&subscription.topic);
        if providers.is_empty() {
            debug!(topic = %subscription.topic, "No provider yet; subscription kept");
        }
        for declaration in providers {
            let outcome = self
                .relay_from_provider(&declaration.provider_id, &subscription, &conn, token)
                .await;
            let status = match outcome {
                Ok(()) => json!("OKAY"),
                Err(e) => {
                    warn!(provider = %declaration.provider_id, topic = %subscription.topic, error = %e, "Relay not started");
                    json!(e.to_string())
                }
            };
            results.insert(declaration.provider_id, status);
        }
        Ok(Value::Object(results))
    }

    async fn cmd_unsubscribe(
        self: Arc<Self>,
        params: Value,
        conn: Arc<Connection>,
        _token: Option<u64>,
    ) -> DrpResult<Value> {
        let params: UnsubscribeParams = serde_json::from_value(params)
            .map_err(|e| DrpError::InvalidParams(e.to_string()))?;
        let token = params.stream_token;
        let removed = self
            .consumers
            .get_mut(&conn.id())
            .and_then(|mut c| c.subscriptions.remove(&token))
            .is_some();
        self.topics.unsubscribe_all(conn.id(), token);
        let stopped = self.stop_relays((conn.id(), token));
        debug!(conn = conn.id(), token, removed, relays = stopped, "Consumer unsubscribed");
        Ok(Value::Null)
    }

    async fn cmd_path(
        self: Arc<Self>,
        params: Value,
        _conn: Arc<Connection>,
        _token: Option<u64>,
    ) -> DrpResult<Value> {
        let mut request: PathRequest = serde_json::from_value(params)
            .map_err(|e| DrpError::InvalidParams(e.to_string()))?;
        if request.method.is_empty() {
            request.method = "cliGetPath".to_string();
        }
        if request.method != "cliGetPath" {
            return Err(DrpError::InvalidParams(format!(
                "unsupported path method '{}'",
                request.method
            )));
        }
        path::resolve(&self.base_object(), &request).await
    }

    async fn cmd_get_registry(
        self: Arc<Self>,
        _params: Value,
        _conn: Arc<Connection>,
        _token: Option<u64>,
    ) -> DrpResult<Value> {
        Ok(serde_json::to_value(self.directory.declarations())?)
    }

    async fn cmd_get_topics(
        self: Arc<Self>,
        _params: Value,
        _conn: Arc<Connection>,
        _token: Option<u64>,
    ) -> DrpResult<Value> {
        Ok(serde_json::to_value(self.topics.topic_counts())?)
    }

    /// Route `{serviceName, cmd, params}` to a provider hosting the service.
    /// `targetProvider` pins the provider; otherwise the heaviest one wins.
    async fn cmd_service_command(
        self: Arc<Self>,
        params: Value,
        _conn: Arc<Connection>,
        _token: Option<u64>,
    ) -> DrpResult<Value> {
        let service = params
            .get("serviceName")
            .and_then(Value::as_str)
            .ok_or_else(|| DrpError::InvalidParams("serviceName required".to_string()))?;
        let target = params.get("targetProvider").and_then(Value::as_str);

        let provider_id = self
            .service_provider(service, target)
            .ok_or_else(|| DrpError::NoProvider(format!("service '{service}'")))?;
        let conn = self.provider_connection(&provider_id).await?;
        debug!(service, provider = %provider_id, "Routing service command");

        let mut forwarded = params.clone();
        if let Some(map) = forwarded.as_object_mut() {
            map.remove("targetProvider");
        }
        conn.call("serviceCommand", forwarded).await
    }

    fn service_provider(&self, service: &str, target: Option<&str>) -> Option<String> {
        let declarations = self.directory.declarations();
        let mut candidates: Vec<(&String, u32)> = declarations
            .iter()
            .filter_map(|(id, decl)| decl.services.get(service).map(|s| (id, s.weight)))
            .filter(|(id, _)| target.map_or(true, |t| t == id.as_str()))
            .collect();
        // heaviest first, ties by id
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        candidates.first().map(|(id, _)| (*id).clone())
    }

    // --- registry client commands ---

    async fn cmd_provider_registered(
        self: Arc<Self>,
        params: Value,
        _conn: Arc<Connection>,
        _token: Option<u64>,
    ) -> DrpResult<Value> {
        let declaration: ProviderDeclaration = serde_json::from_value(params)
            .map_err(|e| DrpError::InvalidParams(e.to_string()))?;
        let provider_id = declaration.provider_id.clone();
        if provider_id.is_empty() {
            return Err(DrpError::InvalidParams("ProviderID required".to_string()));
        }
        info!(broker = %self.id(), provider = %provider_id, "Provider registered");
        let payload = json!({
            "action": "register",
            "providerID": provider_id,
            "declaration": declaration,
        });
        self.directory.register_provider(declaration, None);
        self.topics.send_to_topic(REGISTRY_UPDATE_TOPIC, payload);
        self.resubscribe_provider(&provider_id).await;
        Ok(Value::Null)
    }

    async fn cmd_provider_unregistered(
        self: Arc<Self>,
        params: Value,
        _conn: Arc<Connection>,
        _token: Option<u64>,
    ) -> DrpResult<Value> {
        let provider_id = provider_id_param(&params)
            .ok_or_else(|| DrpError::InvalidParams("provider id required".to_string()))?;
        info!(broker = %self.id(), provider = %provider_id, "Provider unregistered");
        self.directory.unregister_provider(&provider_id);
        self.drop_provider_client(&provider_id);
        for mut relays in self.relays.iter_mut() {
            relays.retain(|r| {
                if r.provider_id == provider_id {
                    r.relay.detach();
                    false
                } else {
                    true
                }
            });
        }
        self.topics.send_to_topic(
            REGISTRY_UPDATE_TOPIC,
            json!({ "action": "unregister", "providerID": provider_id }),
        );
        Ok(Value::Null)
    }

    /// Capability check, broker registration and directory bootstrap.
    async fn registry_handshake(&self, conn: &Arc<Connection>) -> DrpResult<()> {
        let cmds = conn.call("getCmds", Value::Null).await?;
        debug!(broker = %self.id(), cmds = %cmds, "Registry commands");

        let status = conn.call("registerBroker", json!(self.id())).await?;
        if status != json!("OKAY") {
            return Err(DrpError::Remote(crate::message::payload_text(&status)));
        }

        let declarations: BTreeMap<String, ProviderDeclaration> =
            serde_json::from_value(conn.call("getDeclarations", Value::Null).await?)?;
        let stale: Vec<String> = self
            .provider_clients
            .iter()
            .filter(|e| !declarations.contains_key(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for provider_id in stale {
            self.drop_provider_client(&provider_id);
        }

        info!(broker = %self.id(), providers = declarations.len(), "Registry synchronized");
        self.directory.replace_declarations(declarations.clone());
        self.topics.send_to_topic(
            REGISTRY_UPDATE_TOPIC,
            json!({ "action": "initialread", "declarations": declarations }),
        );
        self.resubscribe_all().await;
        Ok(())
    }

    // --- path browsing ---

    fn base_object(self: &Arc<Self>) -> PathNode {
        let declarations = self.directory.declarations();
        let registry_connected = self
            .registry_clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|c| c.is_open());

        let mut streams: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut services: BTreeMap<String, Value> = BTreeMap::new();
        for (id, decl) in &declarations {
            for stream in decl.streams.keys() {
                streams.entry(stream.clone()).or_default().push(id.clone());
            }
            for (name, svc) in &decl.services {
                let entry = services.entry(name.clone()).or_insert_with(|| {
                    json!({ "ServiceName": name, "ClientCmds": svc.client_cmds, "Providers": [] })
                });
                if let Some(list) = entry.get_mut("Providers").and_then(Value::as_array_mut) {
                    list.push(json!(id));
                }
            }
        }
        let streams: Map<String, Value> = streams
            .into_iter()
            .map(|(name, providers)| (name.clone(), json!({ "StreamName": name, "Providers": providers })))
            .collect();

        let weak = Arc::downgrade(self);
        let providers = PathNode::resolver(move |request: PathRequest| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(broker) => broker.browse_providers(request).await,
                    None => Ok(Value::Null),
                }
            }
        });
        let weak = Arc::downgrade(self);
        let consumers = PathNode::resolver(move |request: PathRequest| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(broker) => broker.browse_consumers(request).await,
                    None => Ok(Value::Null),
                }
            }
        });

        PathNode::map()
            .with(
                "Broker",
                json!({
                    "BrokerID": self.id(),
                    "ConsumerCount": self.consumers.len(),
                    "ProviderConnections": self.provider_clients.iter().filter(|c| c.is_open()).count(),
                    "RelayCount": self.relay_count(),
                    "RegistryConnected": registry_connected,
                }),
            )
            .with("Registry", serde_json::to_value(&declarations).unwrap_or_default())
            .with("Streams", Value::Object(streams))
            .with("Services", json!(services))
            .with("Topics", serde_json::to_value(self.topics.topic_counts()).unwrap_or_default())
            .with("Providers", providers)
            .with("Consumers", consumers)
    }

    /// `Providers` lists known providers; `Providers/<id>/...` is relayed to that provider.
    async fn browse_providers(&self, request: PathRequest) -> DrpResult<Value> {
        let Some((provider_id, rest)) = request.path_list.split_first() else {
            let listing: Map<String, Value> = self
                .directory
                .declarations()
                .into_iter()
                .map(|(id, decl)| {
                    let connected = self
                        .provider_clients
                        .get(&id)
                        .map(|c| c.is_open())
                        .unwrap_or(false);
                    let summary = json!({
                        "ProviderURL": decl.provider_url,
                        "Streams": decl.streams.keys().collect::<Vec<_>>(),
                        "Services": decl.services.keys().collect::<Vec<_>>(),
                        "Connected": connected,
                    });
                    (id, summary)
                })
                .collect();
            return Ok(Value::Object(listing));
        };
        if self.directory.provider(provider_id).is_none() {
            return Ok(Value::Null);
        }
        let conn = self.provider_connection(provider_id).await?;
        relay_path(&conn, &request, rest).await
    }

    /// `Consumers` lists connected consumers; `Consumers/<conn id>/...` is relayed to it.
    async fn browse_consumers(&self, request: PathRequest) -> DrpResult<Value> {
        let Some((conn_id, rest)) = request.path_list.split_first() else {
            let listing: Map<String, Value> = self
                .consumers
                .iter()
                .map(|c| {
                    let topics: Vec<&String> = c.subscriptions.values().map(|s| &s.topic).collect();
                    let summary = json!({
                        "Peer": c.conn.peer(),
                        "Info": c.info,
                        "Subscriptions": topics,
                    });
                    (c.key().to_string(), summary)
                })
                .collect();
            return Ok(Value::Object(listing));
        };
        let conn = conn_id
            .parse::<u64>()
            .ok()
            .and_then(|id| self.consumers.get(&id).map(|c| Arc::clone(&c.conn)));
        match conn {
            Some(conn) => relay_path(&conn, &request, rest).await,
            None => Ok(Value::Null),
        }
    }
}

async fn relay_path(conn: &Connection, request: &PathRequest, rest: &[String]) -> DrpResult<Value> {
    let params = json!({
        "method": request.method,
        "pathList": rest,
        "listOnly": request.list_only,
    });
    conn.call(&request.method, params).await
}

struct ConsumerHooks {
    broker: Weak<Broker>,
}

#[async_trait]
impl ConnectionHooks for ConsumerHooks {
    async fn on_open(&self, conn: Arc<Connection>) {
        if let Some(broker) = self.broker.upgrade() {
            broker
                .consumers
                .entry(conn.id())
                .or_insert_with(|| ConsumerEntry::new(conn));
        }
    }

    async fn on_close(&self, conn: Arc<Connection>) {
        if let Some(broker) = self.broker.upgrade() {
            broker.consumer_closed(&conn);
        }
    }
}

struct RegistryClientHooks {
    broker: Weak<Broker>,
}

#[async_trait]
impl ConnectionHooks for RegistryClientHooks {
    async fn on_open(&self, conn: Arc<Connection>) {
        let Some(broker) = self.broker.upgrade() else {
            return;
        };
        if let Err(e) = broker.registry_handshake(&conn).await {
            warn!(broker = %broker.id(), error = %e, "Registry handshake failed");
        }
    }

    async fn on_close(&self, conn: Arc<Connection>) {
        warn!(registry = %conn.peer(), "Registry connection closed");
    }
}

struct ProviderClientHooks {
    broker_id: String,
}

#[async_trait]
impl ConnectionHooks for ProviderClientHooks {
    async fn on_open(&self, conn: Arc<Connection>) {
        match conn.call("registerBroker", json!(self.broker_id)).await {
            Ok(_) => debug!(provider = %conn.peer(), "Registered with provider"),
            Err(e) => warn!(provider = %conn.peer(), error = %e, "registerBroker failed"),
        }
    }

    async fn on_close(&self, conn: Arc<Connection>) {
        info!(provider = %conn.peer(), "Provider connection closed");
    }
}
