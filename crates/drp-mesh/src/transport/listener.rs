//! Listening transport.
//!
//! A [`MeshServer`] binds one TCP listener and serves any number of routes
//! (`/registry`, `/broker`, `/provider`), each backed by exactly one
//! [`Endpoint`]. Every accepted WebSocket gets a fresh [`Connection`].

use super::{run_connection, Inbound, SUBPROTOCOL};
use crate::connection::{Connection, Outbound};
use crate::endpoint::Endpoint;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use drp_types::config::DEFAULT_MAX_MESSAGE_SIZE;
use drp_types::{DrpError, DrpResult};
use futures::future::ready;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Clone)]
struct RouteState {
    endpoint: Arc<Endpoint>,
    max_message_size: usize,
    reply_ttl: Option<Duration>,
    connections: Arc<DashMap<u64, Arc<Connection>>>,
}

/// Builder for the listening transport.
pub struct MeshServer {
    routes: Vec<(String, Arc<Endpoint>)>,
    max_message_size: usize,
    reply_ttl: Option<Duration>,
}

impl Default for MeshServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshServer {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            reply_ttl: None,
        }
    }

    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// TTL applied to commands this node sends over accepted connections.
    pub fn reply_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.reply_ttl = ttl;
        self
    }

    /// Serve `endpoint` on `path`. A later call for the same path replaces it.
    pub fn route(mut self, path: &str, endpoint: Arc<Endpoint>) -> Self {
        self.routes.retain(|(p, _)| p != path);
        self.routes.push((path.to_string(), endpoint));
        self
    }

    /// Bind `addr` and start serving in the background.
    pub async fn bind(self, addr: &str) -> DrpResult<RunningServer> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let connections: Arc<DashMap<u64, Arc<Connection>>> = Arc::new(DashMap::new());

        let mut app = Router::new();
        let mut paths = Vec::with_capacity(self.routes.len());
        for (path, endpoint) in self.routes {
            let state = RouteState {
                endpoint,
                max_message_size: self.max_message_size,
                reply_ttl: self.reply_ttl,
                connections: Arc::clone(&connections),
            };
            app = app.route(&path, get(upgrade).with_state(state));
            paths.push(path);
        }

        info!("DRP: listening on {} (routes: {})", local_addr, paths.join(", "));

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let server = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|v| *v).await;
            });
            if let Err(e) = server.await {
                error!("DRP listener error: {e}");
            }
        });

        Ok(RunningServer {
            local_addr,
            shutdown_tx,
            task,
            connections,
        })
    }
}

/// Handle to a bound server.
pub struct RunningServer {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    connections: Arc<DashMap<u64, Arc<Connection>>>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL for `route` on the bound address.
    pub fn url(&self, route: &str) -> String {
        format!("ws://{}{}", self.local_addr, route)
    }

    /// Number of accepted connections currently open.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Stop accepting, close every accepted connection and wait for the server task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for entry in self.connections.iter() {
            entry.value().close();
        }
        if tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .is_err()
        {
            debug!(addr = %self.local_addr, "Listener did not stop in time");
        }
        info!(addr = %self.local_addr, "DRP listener stopped");
    }
}

async fn upgrade(
    ws: WebSocketUpgrade,
    State(route): State<RouteState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let max = route.max_message_size;
    ws.protocols([SUBPROTOCOL])
        .max_message_size(max)
        .on_upgrade(move |socket| serve_socket(socket, route, addr))
}

async fn serve_socket(socket: WebSocket, route: RouteState, addr: SocketAddr) {
    let (tx, rx) = mpsc::unbounded_channel();
    let conn = Connection::with_reply_ttl(addr.to_string(), tx, route.reply_ttl);
    route.connections.insert(conn.id(), Arc::clone(&conn));
    debug!(conn = conn.id(), peer = %addr, endpoint = %route.endpoint.name(), "Accepted connection");

    let (sink, stream) = socket.split();
    let reader = stream.filter_map(|msg| {
        ready(match msg {
            Ok(Message::Text(text)) => Some(Ok(Inbound::Text(text.as_str().to_owned()))),
            Ok(Message::Binary(bytes)) => Some(
                String::from_utf8(bytes.to_vec())
                    .map(Inbound::Text)
                    .map_err(|e| DrpError::Protocol(format!("binary frame is not UTF-8: {e}"))),
            ),
            Ok(Message::Close(_)) => Some(Ok(Inbound::Closed)),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
            Err(e) => Some(Err(DrpError::Transport(e.to_string()))),
        })
    });
    let writer = sink
        .sink_map_err(|e| DrpError::Transport(e.to_string()))
        .with(|frame: Outbound| {
            ready(Ok::<_, DrpError>(match frame {
                Outbound::Text(text) => Message::Text(text.into()),
                Outbound::Close => Message::Close(None),
            }))
        });

    run_connection(Arc::clone(&route.endpoint), Arc::clone(&conn), rx, reader, writer).await;
    route.connections.remove(&conn.id());
}
