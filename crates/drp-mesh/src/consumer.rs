//! Consumer role.
//!
//! A consumer holds one supervised connection to a broker. Topic watches
//! survive reconnects: every watch is subscribed again on each new broker
//! connection. Webhook relays are tied to the connection they were started
//! on.

use crate::connection::Connection;
use crate::endpoint::{CommandHandler, ConnectionHooks, Endpoint};
use crate::message::StreamPacket;
use crate::path::{self, PathNode, PathRequest};
use crate::relay::{RelayHandle, RelaySink};
use crate::transport::client::{ClientOptions, MeshClient, ReconnectPolicy};
use crate::webhook::WebhookSink;
use async_trait::async_trait;
use drp_types::{DrpError, DrpResult, NodeConfig};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

type WatchCallback = Arc<dyn Fn(Value) + Send + Sync>;

struct Watch {
    id: u64,
    topic: String,
    filter: Option<Value>,
    callback: WatchCallback,
    /// (connection id, stream token) this watch is subscribed on.
    active: Mutex<Option<(u64, u64)>>,
}

impl Watch {
    fn active(&self) -> Option<(u64, u64)> {
        *self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Returned by [`Consumer::subscribe`].
#[derive(Debug, Clone)]
pub struct WatchHandle {
    id: u64,
    topic: String,
    providers: Value,
}

impl WatchHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The broker's answer to the first `subscribe`: provider id to status.
    pub fn providers(&self) -> &Value {
        &self.providers
    }
}

pub struct Consumer {
    config: NodeConfig,
    endpoint: Arc<Endpoint>,
    client: Arc<MeshClient>,
    watches: Mutex<Vec<Arc<Watch>>>,
    next_watch: AtomicU64,
}

impl Consumer {
    /// Start connecting to `broker_url`; reconnects with the configured delay.
    pub fn connect(broker_url: &str, config: NodeConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Consumer>| {
            let endpoint = Endpoint::new("consumer");
            endpoint.register_command("cliGetPath", method_weak(weak.clone()));
            endpoint.set_hooks(Arc::new(BrokerClientHooks {
                consumer: weak.clone(),
            }));
            info!(broker = broker_url, "Connecting to broker");
            let client = MeshClient::start(
                broker_url,
                Arc::clone(&endpoint),
                ClientOptions {
                    reconnect: ReconnectPolicy::FixedDelay(config.reconnect_delay()),
                    max_message_size: config.max_message_size,
                    reply_ttl: config.reply_ttl(),
                },
            );
            Self {
                config,
                endpoint,
                client,
                watches: Mutex::new(Vec::new()),
                next_watch: AtomicU64::new(1),
            }
        })
    }

    pub fn id(&self) -> &str {
        &self.config.node_id
    }

    /// The endpoint the broker sees; register extra commands on it to expose them.
    pub fn endpoint(&self) -> Arc<Endpoint> {
        Arc::clone(&self.endpoint)
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_open()
    }

    /// The open broker connection, waiting for it if the client is still dialing.
    pub async fn connection(&self) -> DrpResult<Arc<Connection>> {
        self.client
            .wait_open(
                self.config.provider_connect_attempts,
                self.config.provider_connect_poll(),
            )
            .await
            .ok_or(DrpError::ConnectionClosed)
    }

    /// Watch `topic`. `callback` receives every stream payload, in order.
    ///
    /// Fails if the broker rejects the subscription; nothing is left behind.
    pub async fn subscribe<F>(&self, topic: &str, filter: Option<Value>, callback: F) -> DrpResult<WatchHandle>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let conn = self.connection().await?;
        let watch = Arc::new(Watch {
            id: self.next_watch.fetch_add(1, Ordering::Relaxed),
            topic: topic.to_string(),
            filter,
            callback: Arc::new(callback),
            active: Mutex::new(None),
        });
        self.watches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&watch));

        match subscribe_watch(&watch, &conn).await {
            Ok(providers) => Ok(WatchHandle {
                id: watch.id,
                topic: watch.topic.clone(),
                providers,
            }),
            Err(e) => {
                self.forget(watch.id);
                Err(e)
            }
        }
    }

    /// Stop watching. The broker is told to drop the subscription.
    pub async fn unsubscribe(&self, handle: &WatchHandle) -> DrpResult<()> {
        let Some(watch) = self.forget(handle.id) else {
            return Ok(());
        };
        let Some((conn_id, token)) = watch.active() else {
            return Ok(());
        };
        match self.client.current() {
            Some(conn) if conn.id() == conn_id => {
                conn.delete_stream_handler(token);
                conn.call(
                    "unsubscribe",
                    json!({ "topicName": watch.topic, "streamToken": token }),
                )
                .await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn forget(&self, id: u64) -> Option<Arc<Watch>> {
        let mut watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());
        let pos = watches.iter().position(|w| w.id == id)?;
        Some(watches.remove(pos))
    }

    /// Number of active watches.
    pub fn watch_count(&self) -> usize {
        self.watches.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Relay `topic` to an HTTP endpoint with PUT requests.
    pub async fn subscribe_webhook(&self, topic: &str, url: &str) -> DrpResult<Arc<RelayHandle>> {
        let sink: Arc<dyn RelaySink> = Arc::new(WebhookSink::new(url, &self.config.webhook)?);
        let conn = self.connection().await?;
        RelayHandle::subscribe(conn, topic, json!({}), sink, self.config.webhook.max_errors).await
    }

    /// Run a broker command and return its payload.
    pub async fn call(&self, cmd: &str, params: Value) -> DrpResult<Value> {
        self.connection().await?.call(cmd, params).await
    }

    /// Run a command on a service hosted somewhere in the mesh.
    pub async fn service_cmd(&self, service: &str, cmd: &str, params: Value) -> DrpResult<Value> {
        self.connection()
            .await?
            .send_service_cmd(service, cmd, params)
            .await?
            .into_result()
    }

    /// Browse the broker's tree at a `/`-separated path.
    pub async fn get_path(&self, path: &str, list_only: bool) -> DrpResult<Value> {
        let request = PathRequest::parse(path, list_only);
        self.call("pathCmd", serde_json::to_value(request)?).await
    }

    pub async fn shutdown(&self) {
        self.client.shutdown().await;
        info!(consumer = %self.id(), "Consumer stopped");
    }

    async fn resubscribe(&self, conn: &Arc<Connection>) {
        let watches: Vec<Arc<Watch>> = self
            .watches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for watch in watches {
            if let Err(e) = subscribe_watch(&watch, conn).await {
                warn!(topic = %watch.topic, error = %e, "Resubscribe failed");
            }
        }
    }

    fn base_object(&self) -> PathNode {
        let watches: Vec<Value> = self
            .watches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|w| json!({ "Topic": w.topic, "StreamToken": w.active().map(|(_, token)| token) }))
            .collect();
        PathNode::map()
            .with(
                "Consumer",
                json!({ "ConsumerID": self.id(), "BrokerURL": self.client.url() }),
            )
            .with("Subscriptions", Value::Array(watches))
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
}

/// Binds `cliGetPath` while the consumer is still being constructed.
fn method_weak(weak: Weak<Consumer>) -> impl CommandHandler {
    move |params: Value, conn: Arc<Connection>, token: Option<u64>| {
        let consumer = weak.upgrade();
        async move {
            match consumer {
                Some(consumer) => consumer.cmd_path(params, conn, token).await,
                None => Err(DrpError::handler("node is shutting down")),
            }
        }
    }
}

/// Subscribe `watch` on `conn` unless it is already subscribed there.
async fn subscribe_watch(watch: &Watch, conn: &Arc<Connection>) -> DrpResult<Value> {
    let callback = Arc::clone(&watch.callback);
    let token = conn.add_stream_handler(move |packet: StreamPacket| callback(packet.payload));
    {
        let mut active = watch.active.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(*active, Some((conn_id, _)) if conn_id == conn.id()) {
            conn.delete_stream_handler(token);
            return Ok(Value::Null);
        }
        *active = Some((conn.id(), token));
    }

    let mut params = json!({ "topicName": watch.topic, "streamToken": token });
    if let Some(filter) = &watch.filter {
        params["filter"] = filter.clone();
    }
    let outcome = match conn.send_cmd("subscribe", params).await {
        Ok(reply) => reply.into_result(),
        Err(e) => Err(e),
    };
    match outcome {
        Ok(providers) => {
            debug!(topic = %watch.topic, token, "Subscribed");
            Ok(providers)
        }
        Err(e) => {
            conn.delete_stream_handler(token);
            let mut active = watch.active.lock().unwrap_or_else(|e| e.into_inner());
            if *active == Some((conn.id(), token)) {
                *active = None;
            }
            Err(e)
        }
    }
}

struct BrokerClientHooks {
    consumer: Weak<Consumer>,
}

#[async_trait]
impl ConnectionHooks for BrokerClientHooks {
    async fn on_open(&self, conn: Arc<Connection>) {
        if let Some(consumer) = self.consumer.upgrade() {
            consumer.resubscribe(&conn).await;
        }
    }

    async fn on_close(&self, conn: Arc<Connection>) {
        warn!(broker = %conn.peer(), "Broker connection closed");
    }
}
