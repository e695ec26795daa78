//! Stream relays.
//!
//! A relay subscribes to a topic on an upstream connection and forwards
//! every stream message to a [`RelaySink`]: another mesh connection (the
//! broker hop) or an HTTP webhook. Messages are delivered in order by one
//! task per relay. After `max_errors` consecutive delivery failures the relay
//! stops: its upstream stream handler is removed and exactly one
//! `unsubscribe` is sent upstream.

use crate::connection::Connection;
use crate::message::StreamPacket;
use async_trait::async_trait;
use drp_types::{DrpError, DrpResult};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Destination for relayed stream messages.
#[async_trait]
pub trait RelaySink: Send + Sync + 'static {
    async fn deliver(&self, packet: &StreamPacket) -> DrpResult<()>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// Forwards to a mesh connection under the subscriber's own token.
pub struct MeshSink {
    conn: Arc<Connection>,
    token: u64,
}

impl MeshSink {
    pub fn new(conn: Arc<Connection>, token: u64) -> Self {
        Self { conn, token }
    }
}

#[async_trait]
impl RelaySink for MeshSink {
    async fn deliver(&self, packet: &StreamPacket) -> DrpResult<()> {
        self.conn
            .send_stream(self.token, packet.status, packet.payload.clone())
    }

    fn describe(&self) -> String {
        format!("conn {} token {}", self.conn.id(), self.token)
    }
}

/// Counts consecutive failures and trips once.
#[derive(Debug)]
pub struct ErrorThreshold {
    max: u32,
    consecutive: AtomicU32,
    tripped: AtomicBool,
}

impl ErrorThreshold {
    /// `max` of 0 is treated as 1.
    pub fn new(max: u32) -> Self {
        Self {
            max: max.max(1),
            consecutive: AtomicU32::new(0),
            tripped: AtomicBool::new(false),
        }
    }

    pub fn record_success(&self) {
        self.consecutive.store(0, Ordering::Release);
    }

    /// Record a failure. Returns `true` exactly once: on the failure that
    /// reaches the threshold.
    pub fn record_failure(&self) -> bool {
        let count = self.consecutive.fetch_add(1, Ordering::AcqRel) + 1;
        count >= self.max && !self.tripped.swap(true, Ordering::AcqRel)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive.load(Ordering::Acquire)
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }
}

/// A running relay.
pub struct RelayHandle {
    upstream: Arc<Connection>,
    upstream_token: u64,
    topic: String,
    sink: String,
    threshold: ErrorThreshold,
    stopped: AtomicBool,
}

impl RelayHandle {
    /// Subscribe to `topic` on `upstream` and forward its messages to `sink`.
    ///
    /// `extra` is merged into the `subscribe` parameters (for example a
    /// scope or filter). Fails if the upstream answers with status 0, in
    /// which case the stream handler is removed without an `unsubscribe`.
    pub async fn subscribe(
        upstream: Arc<Connection>,
        topic: &str,
        extra: Value,
        sink: Arc<dyn RelaySink>,
        max_errors: u32,
    ) -> DrpResult<Arc<RelayHandle>> {
        let handle = Self::start(upstream, topic, sink, max_errors);

        let mut params = json!({ "topicName": topic, "streamToken": handle.upstream_token });
        if let (Some(target), Value::Object(extra)) = (params.as_object_mut(), extra) {
            for (k, v) in extra {
                target.entry(k).or_insert(v);
            }
        }

        match handle.upstream.send_cmd("subscribe", params).await {
            Ok(reply) if reply.is_ok() => {
                info!(topic, relay = %handle.sink, upstream = handle.upstream.id(), "Relay subscribed");
                Ok(handle)
            }
            Ok(reply) => {
                handle.detach();
                Err(reply.into_result().err().unwrap_or_else(|| {
                    DrpError::Remote("subscribe rejected".to_string())
                }))
            }
            Err(e) => {
                handle.detach();
                Err(e)
            }
        }
    }

    /// Register the upstream stream handler and delivery task without
    /// sending `subscribe`. Used when the caller issues the command itself.
    pub fn start(
        upstream: Arc<Connection>,
        topic: &str,
        sink: Arc<dyn RelaySink>,
        max_errors: u32,
    ) -> Arc<RelayHandle> {
        let (tx, mut rx) = mpsc::unbounded_channel::<StreamPacket>();
        let upstream_token = upstream.add_stream_handler(move |packet| {
            let _ = tx.send(packet);
        });
        let handle = Arc::new(RelayHandle {
            upstream,
            upstream_token,
            topic: topic.to_string(),
            sink: sink.describe(),
            threshold: ErrorThreshold::new(max_errors),
            stopped: AtomicBool::new(false),
        });

        let relay = Arc::clone(&handle);
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                if relay.is_stopped() {
                    break;
                }
                match sink.deliver(&packet).await {
                    Ok(()) => relay.threshold.record_success(),
                    Err(e) => {
                        warn!(
                            topic = %relay.topic,
                            relay = %relay.sink,
                            failures = relay.threshold.consecutive_failures() + 1,
                            error = %e,
                            "Relay delivery failed"
                        );
                        if relay.threshold.record_failure() {
                            relay.stop();
                            break;
                        }
                    }
                }
            }
            debug!(topic = %relay.topic, relay = %relay.sink, "Relay task finished");
        });
        handle
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn upstream(&self) -> &Arc<Connection> {
        &self.upstream
    }

    pub fn upstream_token(&self) -> u64 {
        self.upstream_token
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop relaying and tell the upstream to stop sending. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.upstream.delete_stream_handler(self.upstream_token);
        let params = json!({ "topicName": self.topic, "streamToken": self.upstream_token });
        if let Err(e) = self.upstream.send_cmd_oneway("unsubscribe", params) {
            debug!(topic = %self.topic, error = %e, "Upstream unsubscribe not sent");
        }
        info!(topic = %self.topic, relay = %self.sink, "Relay stopped");
    }

    /// Stop without notifying the upstream (it is gone or refused the subscription).
    pub fn detach(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.upstream.delete_stream_handler(self.upstream_token);
        }
    }
}

impl std::fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHandle")
            .field("topic", &self.topic)
            .field("upstream", &self.upstream.id())
            .field("upstream_token", &self.upstream_token)
            .field("sink", &self.sink)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use crate::message::{Packet, STREAM_MORE};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Sink that fails a configurable number of times, then succeeds.
    struct FlakySink {
        fail_first: u32,
        calls: AtomicU32,
        delivered: Mutex<Vec<Value>>,
    }

    impl FlakySink {
        fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                fail_first,
                calls: AtomicU32::new(0),
                delivered: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RelaySink for FlakySink {
        async fn deliver(&self, packet: &StreamPacket) -> DrpResult<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(DrpError::Webhook("down".to_string()));
            }
            self.delivered.lock().unwrap().push(packet.payload.clone());
            Ok(())
        }

        fn describe(&self) -> String {
            "flaky".to_string()
        }
    }

    fn make_conn() -> (Arc<Connection>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Connection::new("upstream", tx), rx)
    }

    fn unsubscribes(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> usize {
        let mut count = 0;
        while let Ok(Outbound::Text(text)) = rx.try_recv() {
            if let Ok(Packet::Cmd(cmd)) = serde_json::from_str::<Packet>(&text) {
                if cmd.cmd == "unsubscribe" {
                    count += 1;
                }
            }
        }
        count
    }

    fn push(conn: &Connection, token: u64, n: i64) {
        conn.deliver_stream(StreamPacket {
            token,
            status: STREAM_MORE,
            payload: json!(n),
        });
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn test_threshold_trips_once() {
        let t = ErrorThreshold::new(3);
        assert!(!t.record_failure());
        assert!(!t.record_failure());
        assert!(t.record_failure());
        assert!(!t.record_failure());
        assert!(!t.record_failure());
        assert!(t.is_tripped());
    }

    #[test]
    fn test_threshold_success_resets() {
        let t = ErrorThreshold::new(2);
        assert!(!t.record_failure());
        t.record_success();
        assert!(!t.record_failure());
        assert!(t.record_failure());
    }

    #[tokio::test]
    async fn test_failures_send_single_unsubscribe() {
        let (upstream, mut rx) = make_conn();
        let sink = FlakySink::new(u32::MAX);
        let relay = RelayHandle::start(Arc::clone(&upstream), "ticks", sink.clone(), 3);
        let token = relay.upstream_token();

        for n in 0..6 {
            push(&upstream, token, n);
        }
        settle().await;

        assert!(relay.is_stopped());
        assert_eq!(unsubscribes(&mut rx), 1);
        assert!(!upstream.has_stream_handler(token));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);

        relay.stop();
        assert_eq!(unsubscribes(&mut rx), 0);
    }

    #[tokio::test]
    async fn test_delivery_in_order() {
        let (upstream, mut rx) = make_conn();
        let sink = FlakySink::new(0);
        let relay = RelayHandle::start(Arc::clone(&upstream), "ticks", sink.clone(), 1);
        for n in 0..20 {
            push(&upstream, relay.upstream_token(), n);
        }
        settle().await;

        let expected: Vec<Value> = (0..20).map(|n| json!(n)).collect();
        assert_eq!(*sink.delivered.lock().unwrap(), expected);
        assert!(!relay.is_stopped());
        assert_eq!(unsubscribes(&mut rx), 0);
    }

    #[tokio::test]
    async fn test_mesh_sink_uses_consumer_token() {
        let (upstream, _up_rx) = make_conn();
        let (consumer, mut consumer_rx) = make_conn();
        let sink = Arc::new(MeshSink::new(Arc::clone(&consumer), 77));
        let relay = RelayHandle::start(Arc::clone(&upstream), "ticks", sink, 1);
        push(&upstream, relay.upstream_token(), 5);
        settle().await;

        match consumer_rx.try_recv() {
            Ok(Outbound::Text(text)) => match serde_json::from_str(&text).unwrap() {
                Packet::Stream(s) => {
                    assert_eq!(s.token, 77);
                    assert_eq!(s.payload, json!(5));
                }
                other => panic!("Expected stream, got {other:?}"),
            },
            other => panic!("Expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closed_consumer_stops_mesh_relay() {
        let (upstream, mut up_rx) = make_conn();
        let (consumer, _consumer_rx) = make_conn();
        let relay = RelayHandle::start(
            Arc::clone(&upstream),
            "ticks",
            Arc::new(MeshSink::new(Arc::clone(&consumer), 1)),
            1,
        );
        consumer.mark_closed();
        push(&upstream, relay.upstream_token(), 1);
        settle().await;

        assert!(relay.is_stopped());
        assert_eq!(unsubscribes(&mut up_rx), 1);
    }

    #[tokio::test]
    async fn test_subscribe_rejected_detaches() {
        let (upstream, mut rx) = make_conn();
        let task = {
            let upstream = Arc::clone(&upstream);
            tokio::spawn(async move {
                RelayHandle::subscribe(upstream, "nope", json!({"scope": "local"}), FlakySink::new(0), 1)
                    .await
            })
        };

        let cmd = match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(Outbound::Text(text))) => match serde_json::from_str(&text).unwrap() {
                Packet::Cmd(cmd) => cmd,
                other => panic!("Expected cmd, got {other:?}"),
            },
            other => panic!("Expected frame, got {other:?}"),
        };
        assert_eq!(cmd.cmd, "subscribe");
        assert_eq!(cmd.params["topicName"], "nope");
        assert_eq!(cmd.params["scope"], "local");
        let stream_token = cmd.params["streamToken"].as_u64().unwrap();
        assert!(upstream.has_stream_handler(stream_token));

        upstream.deliver_reply(crate::message::ReplyPacket {
            token: cmd.replytoken.unwrap(),
            status: crate::message::REPLY_ERROR,
            payload: json!("no such topic"),
        });
        let result = task.await.unwrap();
        assert!(matches!(result, Err(DrpError::Remote(ref m)) if m == "no such topic"));
        assert!(!upstream.has_stream_handler(stream_token));
        assert_eq!(unsubscribes(&mut rx), 0);
    }
}
