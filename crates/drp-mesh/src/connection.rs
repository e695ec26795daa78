//! Per-connection session state.
//!
//! A [`Connection`] is the handle every role uses to talk to one peer. It
//! owns an [`EndpointSession`]: the token allocator plus the reply and
//! stream handler queues that correlate inbound frames with the requests
//! that caused them. Transports only see the outbound queue; they never
//! touch the session.

use crate::message::*;
use dashmap::DashMap;
use drp_types::{DrpError, DrpResult};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Frames queued for the transport's writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close,
}

/// Persistent handler for one stream token.
pub type StreamHandler = Arc<dyn Fn(StreamPacket) + Send + Sync>;

/// Token allocation and handler queues for one connection.
pub struct EndpointSession {
    next_token: AtomicU64,
    reply_handlers: DashMap<u64, oneshot::Sender<ReplyPacket>>,
    stream_handlers: DashMap<u64, StreamHandler>,
}

impl EndpointSession {
    fn new() -> Self {
        Self {
            next_token: AtomicU64::new(1),
            reply_handlers: DashMap::new(),
            stream_handlers: DashMap::new(),
        }
    }

    /// Allocate the next token. Tokens start at 1 and are never reused.
    pub fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    pub fn pending_replies(&self) -> usize {
        self.reply_handlers.len()
    }

    pub fn stream_handler_count(&self) -> usize {
        self.stream_handlers.len()
    }

    fn clear(&self) {
        self.reply_handlers.clear();
        self.stream_handlers.clear();
    }
}

/// One live peer connection.
pub struct Connection {
    id: u64,
    peer: String,
    tx: mpsc::UnboundedSender<Outbound>,
    open: AtomicBool,
    session: EndpointSession,
    reply_ttl: Option<Duration>,
    inbox: Mutex<Option<mpsc::UnboundedSender<CmdPacket>>>,
}

impl Connection {
    /// Create a connection whose frames are written to `tx`.
    pub fn new(peer: impl Into<String>, tx: mpsc::UnboundedSender<Outbound>) -> Arc<Self> {
        Self::with_reply_ttl(peer, tx, None)
    }

    /// Like [`Connection::new`], failing outstanding requests after `ttl`.
    pub fn with_reply_ttl(
        peer: impl Into<String>,
        tx: mpsc::UnboundedSender<Outbound>,
        reply_ttl: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer: peer.into(),
            tx,
            open: AtomicBool::new(true),
            session: EndpointSession::new(),
            reply_ttl,
            inbox: Mutex::new(None),
        })
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote address or URL, for logs.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn session(&self) -> &EndpointSession {
        &self.session
    }

    fn write(&self, packet: &Packet) -> DrpResult<()> {
        if !self.is_open() {
            return Err(DrpError::ConnectionClosed);
        }
        let text = encode_packet(packet)?;
        self.tx
            .send(Outbound::Text(text))
            .map_err(|_| DrpError::ConnectionClosed)
    }

    /// Send a command and wait for its reply.
    ///
    /// Waits indefinitely unless the connection was built with a reply TTL.
    /// Fails with `ConnectionClosed` if the connection closes first.
    pub async fn send_cmd(&self, cmd: &str, params: Value) -> DrpResult<ReplyPacket> {
        self.send_packet(CmdPacket::new(cmd, params, None), self.reply_ttl)
            .await
    }

    /// Send a command and wait at most `ttl` for its reply.
    pub async fn send_cmd_timeout(
        &self,
        cmd: &str,
        params: Value,
        ttl: Duration,
    ) -> DrpResult<ReplyPacket> {
        self.send_packet(CmdPacket::new(cmd, params, None), Some(ttl))
            .await
    }

    /// Send a command addressed to a hosted service on the peer.
    pub async fn send_service_cmd(
        &self,
        service: &str,
        cmd: &str,
        params: Value,
    ) -> DrpResult<ReplyPacket> {
        let mut packet = CmdPacket::new(cmd, params, None);
        packet.service_name = Some(service.to_string());
        self.send_packet(packet, self.reply_ttl).await
    }

    /// Send a command and return the reply payload, mapping status 0 to an error.
    pub async fn call(&self, cmd: &str, params: Value) -> DrpResult<Value> {
        self.send_cmd(cmd, params).await?.into_result()
    }

    async fn send_packet(
        &self,
        mut packet: CmdPacket,
        ttl: Option<Duration>,
    ) -> DrpResult<ReplyPacket> {
        let (token, rx) = self.register_reply(&mut packet)?;
        let reply = match ttl {
            Some(ttl) => match tokio::time::timeout(ttl, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.session.reply_handlers.remove(&token);
                    debug!(conn = self.id, token, cmd = %packet.cmd, "Reply timed out");
                    return Err(DrpError::Timeout);
                }
            },
            None => rx.await,
        };
        reply.map_err(|_| DrpError::ConnectionClosed)
    }

    fn register_reply(
        &self,
        packet: &mut CmdPacket,
    ) -> DrpResult<(u64, oneshot::Receiver<ReplyPacket>)> {
        let token = self.session.next_token();
        let (tx, rx) = oneshot::channel();
        self.session.reply_handlers.insert(token, tx);
        packet.replytoken = Some(token);
        if let Err(e) = self.write(&Packet::Cmd(packet.clone())) {
            self.session.reply_handlers.remove(&token);
            return Err(e);
        }
        Ok((token, rx))
    }

    /// Send a command and run `callback` once with its reply.
    ///
    /// The callback is dropped without running if the connection closes first.
    pub fn send_cmd_with_callback<F>(&self, cmd: &str, params: Value, callback: F) -> DrpResult<u64>
    where
        F: FnOnce(ReplyPacket) + Send + 'static,
    {
        let mut packet = CmdPacket::new(cmd, params, None);
        let (token, rx) = self.register_reply(&mut packet)?;
        tokio::spawn(async move {
            if let Ok(reply) = rx.await {
                callback(reply);
            }
        });
        Ok(token)
    }

    /// Send a command without a reply token. Nothing is queued.
    pub fn send_cmd_oneway(&self, cmd: &str, params: Value) -> DrpResult<()> {
        self.write(&Packet::Cmd(CmdPacket::new(cmd, params, None)))
    }

    pub fn send_reply(&self, token: u64, status: u8, payload: Value) -> DrpResult<()> {
        self.write(&Packet::Reply(ReplyPacket {
            token,
            status,
            payload,
        }))
    }

    pub fn send_stream(&self, token: u64, status: u8, payload: Value) -> DrpResult<()> {
        self.write(&Packet::Stream(StreamPacket {
            token,
            status,
            payload,
        }))
    }

    /// Register a persistent handler and return the token peers should stream to.
    pub fn add_stream_handler<F>(&self, handler: F) -> u64
    where
        F: Fn(StreamPacket) + Send + Sync + 'static,
    {
        let token = self.session.next_token();
        self.session.stream_handlers.insert(token, Arc::new(handler));
        token
    }

    /// Remove a stream handler. Returns `false` if there was none.
    pub fn delete_stream_handler(&self, token: u64) -> bool {
        self.session.stream_handlers.remove(&token).is_some()
    }

    pub fn has_stream_handler(&self, token: u64) -> bool {
        self.session.stream_handlers.contains_key(&token)
    }

    /// Complete the request waiting on `reply.token`. Returns `false` when
    /// nothing was waiting (unknown or already answered).
    pub(crate) fn deliver_reply(&self, reply: ReplyPacket) -> bool {
        match self.session.reply_handlers.remove(&reply.token) {
            Some((_, tx)) => {
                // Receiver may have timed out; that is not an error here.
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    /// Invoke the stream handler for `packet.token`. Returns `false` when none exists.
    ///
    /// A status below [`STREAM_MORE`] is the last frame for the token; its
    /// handler is removed after it runs.
    pub(crate) fn deliver_stream(&self, packet: StreamPacket) -> bool {
        let token = packet.token;
        let last = packet.status < STREAM_MORE;
        // Clone out of the map so the handler runs without a shard lock held.
        let handler = self
            .session
            .stream_handlers
            .get(&token)
            .map(|h| Arc::clone(h.value()));
        match handler {
            Some(handler) => {
                handler(packet);
                if last {
                    self.session.stream_handlers.remove(&token);
                }
                true
            }
            None => false,
        }
    }

    /// Queue an inbound command behind the ones already received.
    ///
    /// `start` creates the queue on first use; whoever drains it must run
    /// each command to completion before taking the next.
    pub(crate) fn queue_cmd<F>(&self, cmd: CmdPacket, start: F) -> DrpResult<()>
    where
        F: FnOnce() -> mpsc::UnboundedSender<CmdPacket>,
    {
        if !self.is_open() {
            return Err(DrpError::ConnectionClosed);
        }
        let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
        inbox
            .get_or_insert_with(start)
            .send(cmd)
            .map_err(|_| DrpError::ConnectionClosed)
    }

    /// Ask the transport to close the socket, then mark the connection closed.
    pub fn close(&self) {
        if self.is_open() && self.tx.send(Outbound::Close).is_err() {
            warn!(conn = self.id, peer = %self.peer, "Writer already gone while closing");
        }
        self.mark_closed();
    }

    /// Mark closed and drop every queued handler. Idempotent.
    pub fn mark_closed(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            debug!(
                conn = self.id,
                peer = %self.peer,
                pending = self.session.pending_replies(),
                streams = self.session.stream_handler_count(),
                "Connection closed, clearing handler queues"
            );
        }
        self.session.clear();
        self.inbox.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .finish()
    }
}
