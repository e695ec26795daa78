//! Initiating transport.
//!
//! A [`MeshClient`] dials a target URL, offers the `drp` subprotocol and
//! hands the socket to its [`Endpoint`]. The endpoint's `on_open` hook runs
//! the open sequence. When the socket drops, the client waits a fixed delay
//! and dials again with a brand-new [`Connection`]; the loop is a supervised
//! task that stops for good on [`MeshClient::shutdown`].

use super::{run_connection, Inbound, SUBPROTOCOL};
use crate::connection::{Connection, Outbound};
use crate::endpoint::Endpoint;
use drp_types::config::DEFAULT_MAX_MESSAGE_SIZE;
use drp_types::{DrpError, DrpResult};
use futures::future::ready;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What to do after the connection drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Dial again after this delay.
    FixedDelay(Duration),
    /// Give up after the first connection ends (or fails).
    Never,
}

/// Observable state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Connecting,
    Open,
    Closed,
}

/// Options for [`MeshClient::start`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub reconnect: ReconnectPolicy,
    pub max_message_size: usize,
    pub reply_ttl: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::FixedDelay(Duration::from_secs(10)),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            reply_ttl: None,
        }
    }
}

/// A supervised outbound connection.
pub struct MeshClient {
    url: String,
    current: Arc<RwLock<Option<Arc<Connection>>>>,
    status_rx: watch::Receiver<ConnStatus>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MeshClient {
    /// Start dialing `url` in the background.
    pub fn start(url: &str, endpoint: Arc<Endpoint>, options: ClientOptions) -> Arc<Self> {
        let (status_tx, status_rx) = watch::channel(ConnStatus::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let current = Arc::new(RwLock::new(None));

        let task = tokio::spawn(supervise(
            url.to_string(),
            endpoint,
            options,
            Arc::clone(&current),
            status_tx,
            shutdown_rx,
        ));

        Arc::new(Self {
            url: url.to_string(),
            current,
            status_rx,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> ConnStatus {
        *self.status_rx.borrow()
    }

    /// The live connection, if one is open.
    pub fn current(&self) -> Option<Arc<Connection>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .filter(|c| c.is_open())
            .cloned()
    }

    pub fn is_open(&self) -> bool {
        self.current().is_some()
    }

    /// Poll for an open connection up to `attempts` times, `interval` apart.
    pub async fn wait_open(&self, attempts: u32, interval: Duration) -> Option<Arc<Connection>> {
        for _ in 0..attempts {
            if let Some(conn) = self.current() {
                return Some(conn);
            }
            if self.status() == ConnStatus::Closed && self.is_finished() {
                return None;
            }
            tokio::time::sleep(interval).await;
        }
        self.current()
    }

    /// Whether the supervisor has exited for good.
    pub fn is_finished(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|t| t.is_finished())
            .unwrap_or(true)
    }

    /// Stop reconnecting and close the current connection.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!(url = %self.url, "Client task did not stop in time");
            }
        }
    }
}

impl Drop for MeshClient {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn supervise(
    url: String,
    endpoint: Arc<Endpoint>,
    options: ClientOptions,
    current: Arc<RwLock<Option<Arc<Connection>>>>,
    status_tx: watch::Sender<ConnStatus>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let _ = status_tx.send(ConnStatus::Connecting);

        match dial(&url, options.max_message_size).await {
            Ok(ws) => {
                info!(url = %url, endpoint = %endpoint.name(), "Connected");
                let (tx, rx) = mpsc::unbounded_channel();
                let conn = Connection::with_reply_ttl(url.clone(), tx, options.reply_ttl);
                *current.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&conn));
                let _ = status_tx.send(ConnStatus::Open);

                let run = drive(Arc::clone(&endpoint), Arc::clone(&conn), rx, ws);
                tokio::pin!(run);
                let stopping = tokio::select! {
                    _ = &mut run => false,
                    _ = shutdown_signal(&mut shutdown_rx) => {
                        conn.close();
                        let _ = tokio::time::timeout(Duration::from_secs(2), &mut run).await;
                        true
                    }
                };

                current.write().unwrap_or_else(|e| e.into_inner()).take();
                let _ = status_tx.send(ConnStatus::Closed);
                if stopping {
                    break;
                }
                warn!(url = %url, "Connection closed");
            }
            Err(e) => {
                let _ = status_tx.send(ConnStatus::Closed);
                warn!(url = %url, error = %e, "Connect failed");
            }
        }

        match options.reconnect {
            ReconnectPolicy::Never => break,
            ReconnectPolicy::FixedDelay(delay) => {
                info!(url = %url, "Reconnecting in {delay:?}");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_signal(&mut shutdown_rx) => break,
                }
            }
        }
    }
    let _ = status_tx.send(ConnStatus::Closed);
    debug!(url = %url, "Client supervisor stopped");
}

/// Resolves once shutdown is requested or the client handle is gone.
async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|v| *v).await;
}

async fn dial(url: &str, max_message_size: usize) -> DrpResult<WsStream> {
    let mut request = url
        .into_client_request()
        .map_err(|e| DrpError::Transport(format!("invalid URL '{url}': {e}")))?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));

    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_message_size);
    config.max_frame_size = Some(max_message_size);

    let (ws, _response) = tokio_tungstenite::connect_async_with_config(request, Some(config), false)
        .await
        .map_err(|e| DrpError::Transport(e.to_string()))?;
    Ok(ws)
}

async fn drive(
    endpoint: Arc<Endpoint>,
    conn: Arc<Connection>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    ws: WsStream,
) {
    let (sink, stream) = ws.split();
    let reader = stream.filter_map(|msg| {
        ready(match msg {
            Ok(Message::Text(text)) => Some(Ok(Inbound::Text(text))),
            Ok(Message::Binary(bytes)) => Some(
                String::from_utf8(bytes)
                    .map(Inbound::Text)
                    .map_err(|e| DrpError::Protocol(format!("binary frame is not UTF-8: {e}"))),
            ),
            Ok(Message::Close(_)) => Some(Ok(Inbound::Closed)),
            Ok(_) => None,
            Err(e) => Some(Err(DrpError::Transport(e.to_string()))),
        })
    });
    let writer = sink
        .sink_map_err(|e| DrpError::Transport(e.to_string()))
        .with(|frame: Outbound| {
            ready(Ok::<_, DrpError>(match frame {
                Outbound::Text(text) => Message::Text(text),
                Outbound::Close => Message::Close(None),
            }))
        });
    run_connection(endpoint, conn, outbound, reader, writer).await;
}
