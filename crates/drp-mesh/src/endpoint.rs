//! Command dispatch and inbound frame routing.
//!
//! An [`Endpoint`] is shared by every connection accepted on one route (or
//! opened by one client). It holds the command table and the connection
//! lifecycle hooks; per-connection state lives in [`Connection`].
//!
//! Inbound `cmd` frames for one connection run one after another, each to
//! completion, on a task owned by that connection. `reply` and `stream`
//! frames are handled inline by the reader, so a command may await a reply
//! on its own connection and stream messages for one token stay in order.

use crate::connection::Connection;
use crate::message::*;
use async_trait::async_trait;
use drp_types::{DrpError, DrpResult};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A named remote command.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Run the command. `Err` is sent back as a status 0 reply.
    async fn call(
        &self,
        params: Value,
        conn: Arc<Connection>,
        reply_token: Option<u64>,
    ) -> DrpResult<Value>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(Value, Arc<Connection>, Option<u64>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DrpResult<Value>> + Send + 'static,
{
    async fn call(
        &self,
        params: Value,
        conn: Arc<Connection>,
        reply_token: Option<u64>,
    ) -> DrpResult<Value> {
        (self)(params, conn, reply_token).await
    }
}

/// Bind an async method of a shared node to a command handler.
///
/// The handler keeps only a weak reference, so registering a node's own
/// methods on its endpoint does not leak the node.
pub fn method<T, F, Fut>(target: &Arc<T>, f: F) -> impl CommandHandler
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>, Value, Arc<Connection>, Option<u64>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DrpResult<Value>> + Send + 'static,
{
    let weak = Arc::downgrade(target);
    move |params: Value, conn: Arc<Connection>, token: Option<u64>| {
        let fut = weak.upgrade().map(|target| f(target, params, conn, token));
        async move {
            match fut {
                Some(fut) => fut.await,
                None => Err(DrpError::handler("node is shutting down")),
            }
        }
    }
}

/// Callbacks the transport runs around a connection's lifetime.
///
/// `on_open` runs on its own task after the reader has started, so it may
/// issue commands and await their replies (capability handshake, role
/// registration).
#[async_trait]
pub trait ConnectionHooks: Send + Sync + 'static {
    async fn on_open(&self, _conn: Arc<Connection>) {}

    async fn on_close(&self, _conn: Arc<Connection>) {}

    fn on_error(&self, _conn: &Arc<Connection>, _error: &DrpError) {}
}

type CommandTable = HashMap<String, Arc<dyn CommandHandler>>;

/// Shared command table plus lifecycle hooks for a group of connections.
pub struct Endpoint {
    name: String,
    commands: RwLock<CommandTable>,
    services: RwLock<HashMap<String, CommandTable>>,
    hooks: RwLock<Option<Arc<dyn ConnectionHooks>>>,
}

impl Endpoint {
    /// Create an endpoint. `getCmds` is always registered.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Endpoint>| {
            let weak = weak.clone();
            let mut commands: CommandTable = HashMap::new();
            commands.insert(
                "getCmds".to_string(),
                Arc::new(move |_: Value, _: Arc<Connection>, _: Option<u64>| {
                    let names = weak
                        .upgrade()
                        .map(|ep| ep.command_names())
                        .unwrap_or_default();
                    async move { Ok(json!(names)) }
                }),
            );
            Self {
                name: name.into(),
                commands: RwLock::new(commands),
                services: RwLock::new(HashMap::new()),
                hooks: RwLock::new(None),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register (or overwrite) a command.
    pub fn register_command(&self, name: &str, handler: impl CommandHandler) {
        self.commands
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Arc::new(handler));
    }

    /// Sorted list of registered command names.
    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .commands
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn command(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.commands
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Register a command on a hosted service, reachable through `serviceName`.
    pub fn register_service_command(&self, service: &str, name: &str, handler: impl CommandHandler) {
        self.register_service_handler(service, name, Arc::new(handler));
    }

    pub fn register_service_handler(&self, service: &str, name: &str, handler: Arc<dyn CommandHandler>) {
        self.services
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(service.to_string())
            .or_default()
            .insert(name.to_string(), handler);
    }

    /// Sorted command names of a hosted service, `None` if the service is unknown.
    pub fn service_command_names(&self, service: &str) -> Option<Vec<String>> {
        let services = self.services.read().unwrap_or_else(|e| e.into_inner());
        let table = services.get(service)?;
        let mut names: Vec<String> = table.keys().cloned().collect();
        names.sort();
        Some(names)
    }

    pub fn hosts_service(&self, service: &str) -> bool {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(service)
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Run `method` on hosted `service`.
    pub async fn call_service(
        &self,
        service: &str,
        method: &str,
        params: Value,
        conn: Arc<Connection>,
        reply_token: Option<u64>,
    ) -> DrpResult<Value> {
        let handler = {
            let services = self.services.read().unwrap_or_else(|e| e.into_inner());
            match services.get(service) {
                Some(table) => table.get(method).cloned(),
                None => {
                    return Err(DrpError::handler(format!(
                        "Service '{service}' not found"
                    )))
                }
            }
        };
        match handler {
            Some(handler) => handler.call(params, conn, reply_token).await,
            None => Err(DrpError::UnknownCommand(format!("{service}.{method}"))),
        }
    }

    /// Install lifecycle hooks, replacing any previous ones.
    pub fn set_hooks(&self, hooks: Arc<dyn ConnectionHooks>) {
        *self.hooks.write().unwrap_or_else(|e| e.into_inner()) = Some(hooks);
    }

    fn hooks(&self) -> Option<Arc<dyn ConnectionHooks>> {
        self.hooks.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Run a command as if it had arrived from `conn`, returning the reply.
    ///
    /// A `serviceName` this endpoint does not host is handed to its own
    /// `serviceCommand` command when one is registered, so a broker can route
    /// it to a provider.
    pub async fn execute(&self, packet: CmdPacket, conn: Arc<Connection>) -> ReplyPacket {
        let token = packet.replytoken.unwrap_or_default();
        let service = packet.target_service().map(str::to_string);
        let router = service
            .as_deref()
            .filter(|service| !self.hosts_service(service))
            .and_then(|_| self.command("serviceCommand"));
        let result = match (service, router) {
            (Some(service), Some(router)) => {
                let params = json!({
                    "serviceName": service,
                    "cmd": packet.cmd,
                    "params": packet.params,
                });
                router.call(params, conn, packet.replytoken).await
            }
            (Some(service), None) => {
                self.call_service(&service, &packet.cmd, packet.params, conn, packet.replytoken)
                    .await
            }
            (None, _) => match self.command(&packet.cmd) {
                Some(handler) => handler.call(packet.params, conn, packet.replytoken).await,
                None => Err(DrpError::UnknownCommand(packet.cmd.clone())),
            },
        };
        match result {
            Ok(payload) => ReplyPacket {
                token,
                status: REPLY_OK,
                payload,
            },
            Err(e) => {
                debug!(endpoint = %self.name, cmd = %packet.cmd, error = %e, "Command failed");
                ReplyPacket {
                    token,
                    status: REPLY_ERROR,
                    payload: Value::String(e.to_string()),
                }
            }
        }
    }

    /// Route one inbound text frame.
    ///
    /// Returns `Err(Protocol)` only for text that is not JSON; the caller
    /// closes the connection. Every other problem is logged and dropped.
    pub fn receive_message(self: &Arc<Self>, conn: &Arc<Connection>, text: &str) -> DrpResult<()> {
        let packet = match decode_packet(text) {
            Ok(Decoded::Packet(packet)) => packet,
            Ok(Decoded::Ignored(reason)) => {
                warn!(endpoint = %self.name, conn = conn.id(), %reason, "Dropping frame");
                return Ok(());
            }
            Err(e) => return Err(DrpError::Protocol(format!("malformed frame: {e}"))),
        };

        match packet {
            Packet::Cmd(cmd) => {
                let name = cmd.cmd.clone();
                let queued = conn.queue_cmd(cmd, || {
                    let (tx, rx) = mpsc::unbounded_channel();
                    tokio::spawn(Arc::clone(self).drain_commands(Arc::downgrade(conn), rx));
                    tx
                });
                if let Err(e) = queued {
                    debug!(conn = conn.id(), cmd = %name, error = %e, "Command dropped");
                }
            }
            Packet::Reply(reply) => {
                let token = reply.token;
                if !conn.deliver_reply(reply) {
                    debug!(conn = conn.id(), token, "Reply for unknown token dropped");
                }
            }
            Packet::Stream(stream) => {
                let token = stream.token;
                if !conn.deliver_stream(stream) {
                    debug!(conn = conn.id(), token, "Stream for unknown token, unsubscribing");
                    if let Err(e) = conn.send_cmd_oneway("unsubscribe", json!({ "streamToken": token })) {
                        debug!(conn = conn.id(), token, error = %e, "Unsubscribe not sent");
                    }
                }
            }
        }
        Ok(())
    }

    /// Run one connection's commands in arrival order until its queue closes.
    async fn drain_commands(
        self: Arc<Self>,
        conn: Weak<Connection>,
        mut rx: mpsc::UnboundedReceiver<CmdPacket>,
    ) {
        while let Some(cmd) = rx.recv().await {
            let Some(conn) = conn.upgrade() else { break };
            let wants_reply = cmd.replytoken.is_some();
            let name = cmd.cmd.clone();
            let reply = self.execute(cmd, Arc::clone(&conn)).await;
            if wants_reply {
                if let Err(e) = conn.send_reply(reply.token, reply.status, reply.payload) {
                    debug!(conn = conn.id(), cmd = %name, error = %e, "Reply not sent");
                }
            }
        }
    }

    /// Called by transports once the reader is running.
    pub fn connection_opened(&self, conn: &Arc<Connection>) {
        debug!(endpoint = %self.name, conn = conn.id(), peer = %conn.peer(), "Connection opened");
        if let Some(hooks) = self.hooks() {
            let conn = Arc::clone(conn);
            tokio::spawn(async move { hooks.on_open(conn).await });
        }
    }

    /// Called by transports after the connection is marked closed.
    pub async fn connection_closed(&self, conn: &Arc<Connection>) {
        debug!(endpoint = %self.name, conn = conn.id(), peer = %conn.peer(), "Connection closed");
        if let Some(hooks) = self.hooks() {
            hooks.on_close(Arc::clone(conn)).await;
        }
    }

    pub fn connection_error(&self, conn: &Arc<Connection>, error: &DrpError) {
        warn!(endpoint = %self.name, conn = conn.id(), peer = %conn.peer(), error = %error, "Connection error");
        if let Some(hooks) = self.hooks() {
            hooks.on_error(conn, error);
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("commands", &self.command_names())
            .finish()
    }
}
