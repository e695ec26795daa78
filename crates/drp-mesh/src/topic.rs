//! Local publish/subscribe fan-out.
//!
//! Providers publish to named topics; each subscriber is a (connection,
//! stream token) pair on which messages are sent as `stream` frames with
//! status 2. A subscriber whose connection rejects a send is removed.

use crate::connection::Connection;
use crate::message::STREAM_MORE;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Published messages remembered per topic.
const HISTORY_LEN: usize = 10;

struct Subscriber {
    conn: Arc<Connection>,
    token: u64,
    filter: Option<Value>,
}

/// A message kept in a topic's recent history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicMessage {
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "Payload")]
    pub payload: Value,
}

#[derive(Default)]
struct Topic {
    subscribers: Vec<Subscriber>,
    received_messages: u64,
    sent_messages: u64,
    last_ten: VecDeque<TopicMessage>,
}

/// Per-topic counters, as reported by `getTopics`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TopicCounts {
    #[serde(rename = "SubscriberCount")]
    pub subscribers: usize,
    #[serde(rename = "ReceivedMessages")]
    pub received_messages: u64,
    #[serde(rename = "SentMessages")]
    pub sent_messages: u64,
}

/// Parameters of `subscribe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeParams {
    #[serde(rename = "topicName")]
    pub topic_name: String,
    #[serde(rename = "streamToken")]
    pub stream_token: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
}

/// Parameters of `unsubscribe`. Without a topic the token is dropped everywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeParams {
    #[serde(rename = "topicName", default, skip_serializing_if = "Option::is_none")]
    pub topic_name: Option<String>,
    #[serde(rename = "streamToken")]
    pub stream_token: u64,
}

/// Topic table for one node.
#[derive(Default)]
pub struct TopicManager {
    topics: Mutex<HashMap<String, Topic>>,
}

impl TopicManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber. The topic is created if needed.
    pub fn subscribe(&self, topic: &str, conn: Arc<Connection>, token: u64, filter: Option<Value>) {
        debug!(topic, conn = conn.id(), token, "Subscribing");
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.to_string())
            .or_default()
            .subscribers
            .push(Subscriber {
                conn,
                token,
                filter: filter.filter(|f| !f.is_null()),
            });
    }

    /// Remove one subscription. Returns whether it existed.
    pub fn unsubscribe(&self, topic: &str, conn_id: u64, token: u64) -> bool {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = topics.get_mut(topic) else {
            return false;
        };
        let before = entry.subscribers.len();
        entry
            .subscribers
            .retain(|s| !(s.conn.id() == conn_id && s.token == token));
        before != entry.subscribers.len()
    }

    /// Remove a (connection, token) subscription from every topic.
    pub fn unsubscribe_all(&self, conn_id: u64, token: u64) -> usize {
        self.remove_where(|s| s.conn.id() == conn_id && s.token == token)
    }

    /// Remove every subscription held by a connection.
    pub fn remove_connection(&self, conn_id: u64) -> usize {
        self.remove_where(|s| s.conn.id() == conn_id)
    }

    fn remove_where(&self, pred: impl Fn(&Subscriber) -> bool) -> usize {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        for topic in topics.values_mut() {
            let before = topic.subscribers.len();
            topic.subscribers.retain(|s| !pred(s));
            removed += before - topic.subscribers.len();
        }
        removed
    }

    /// Publish to every matching subscriber. Returns how many were reached.
    pub fn send_to_topic(&self, topic: &str, payload: Value) -> usize {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let entry = topics.entry(topic.to_string()).or_default();
        entry.received_messages += 1;
        if entry.last_ten.len() == HISTORY_LEN {
            entry.last_ten.pop_front();
        }
        entry.last_ten.push_back(TopicMessage {
            timestamp: Utc::now(),
            payload: payload.clone(),
        });

        let mut delivered = 0;
        entry.subscribers.retain(|sub| {
            if let Some(filter) = &sub.filter {
                if !filter_matches(filter, &payload) {
                    return true;
                }
            }
            match sub.conn.send_stream(sub.token, STREAM_MORE, payload.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(e) => {
                    debug!(topic, conn = sub.conn.id(), token = sub.token, error = %e, "Dropping subscriber");
                    false
                }
            }
        });
        entry.sent_messages += delivered as u64;
        delivered
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .map(|t| t.subscribers.len())
            .unwrap_or(0)
    }

    pub fn topic_counts(&self) -> BTreeMap<String, TopicCounts> {
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, t)| {
                (
                    name.clone(),
                    TopicCounts {
                        subscribers: t.subscribers.len(),
                        received_messages: t.received_messages,
                        sent_messages: t.sent_messages,
                    },
                )
            })
            .collect()
    }

    /// Up to the last ten messages published on `topic`, oldest first.
    pub fn recent_messages(&self, topic: &str) -> Vec<TopicMessage> {
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .map(|t| t.last_ten.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// An object filter matches when every key it names equals the payload's value.
/// Any other filter must equal the payload.
pub fn filter_matches(filter: &Value, payload: &Value) -> bool {
    match filter {
        Value::Null => true,
        Value::Object(expected) => expected
            .iter()
            .all(|(key, want)| payload.get(key) == Some(want)),
        other => other == payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use crate::message::{Packet, StreamPacket};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn make_conn() -> (Arc<Connection>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Connection::new("sub", tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<StreamPacket> {
        let mut out = Vec::new();
        while let Ok(Outbound::Text(text)) = rx.try_recv() {
            match serde_json::from_str(&text).unwrap() {
                Packet::Stream(s) => out.push(s),
                other => panic!("Expected stream, got {other:?}"),
            }
        }
        out
    }

    #[test]
    fn test_publish_reaches_subscribers_with_their_tokens() {
        let topics = TopicManager::new();
        let (a, mut rx_a) = make_conn();
        let (b, mut rx_b) = make_conn();
        topics.subscribe("ticks", Arc::clone(&a), 11, None);
        topics.subscribe("ticks", Arc::clone(&b), 4, None);

        assert_eq!(topics.send_to_topic("ticks", json!({"n": 1})), 2);

        let got_a = drain(&mut rx_a);
        assert_eq!(got_a.len(), 1);
        assert_eq!(got_a[0].token, 11);
        assert_eq!(got_a[0].status, STREAM_MORE);
        assert_eq!(drain(&mut rx_b)[0].token, 4);
    }

    #[test]
    fn test_subscribe_then_unsubscribe_leaves_topic_empty() {
        let topics = TopicManager::new();
        let (a, _rx) = make_conn();
        topics.subscribe("ticks", Arc::clone(&a), 1, None);
        assert_eq!(topics.subscriber_count("ticks"), 1);
        assert!(topics.unsubscribe("ticks", a.id(), 1));
        assert!(!topics.unsubscribe("ticks", a.id(), 1));
        assert_eq!(topics.subscriber_count("ticks"), 0);
    }

    #[test]
    fn test_failed_send_removes_subscriber() {
        let topics = TopicManager::new();
        let (a, _rx_a) = make_conn();
        let (b, rx_b) = make_conn();
        drop(rx_b);
        topics.subscribe("ticks", a, 1, None);
        topics.subscribe("ticks", b, 2, None);

        assert_eq!(topics.send_to_topic("ticks", json!(1)), 1);
        assert_eq!(topics.subscriber_count("ticks"), 1);
        let counts = topics.topic_counts();
        assert_eq!(counts["ticks"].received_messages, 1);
        assert_eq!(counts["ticks"].sent_messages, 1);
    }

    #[test]
    fn test_unsubscribe_all_and_remove_connection() {
        let topics = TopicManager::new();
        let (a, _rx_a) = make_conn();
        let (b, _rx_b) = make_conn();
        topics.subscribe("ticks", Arc::clone(&a), 1, None);
        topics.subscribe("alarms", Arc::clone(&a), 1, None);
        topics.subscribe("alarms", Arc::clone(&a), 2, None);
        topics.subscribe("alarms", Arc::clone(&b), 1, None);

        assert_eq!(topics.unsubscribe_all(a.id(), 1), 2);
        assert_eq!(topics.subscriber_count("alarms"), 2);
        assert_eq!(topics.remove_connection(a.id()), 1);
        assert_eq!(topics.subscriber_count("alarms"), 1);
    }

    #[test]
    fn test_filter_applies() {
        let topics = TopicManager::new();
        let (a, mut rx) = make_conn();
        topics.subscribe("events", a, 3, Some(json!({"severity": "high"})));

        topics.send_to_topic("events", json!({"severity": "low", "id": 1}));
        topics.send_to_topic("events", json!({"severity": "high", "id": 2}));

        let got = drain(&mut rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload["id"], 2);
        assert_eq!(topics.subscriber_count("events"), 1);
    }

    #[test]
    fn test_history_keeps_last_ten() {
        let topics = TopicManager::new();
        for n in 0..15 {
            topics.send_to_topic("ticks", json!(n));
        }
        let recent = topics.recent_messages("ticks");
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].payload, json!(5));
        assert_eq!(recent[9].payload, json!(14));
    }

    #[test]
    fn test_filter_matches() {
        assert!(filter_matches(&Value::Null, &json!(1)));
        assert!(filter_matches(&json!({}), &json!({"a": 1})));
        assert!(!filter_matches(&json!({"a": 2}), &json!({"a": 1})));
        assert!(filter_matches(&json!("x"), &json!("x")));
        assert!(!filter_matches(&json!({"a": 1}), &json!("scalar")));
    }

    #[test]
    fn test_subscribe_params_wire_names() {
        let params: SubscribeParams =
            serde_json::from_value(json!({"topicName": "ticks", "streamToken": 7})).unwrap();
        assert_eq!(params.topic_name, "ticks");
        assert_eq!(params.stream_token, 7);
        assert!(params.filter.is_none());

        let params: UnsubscribeParams = serde_json::from_value(json!({"streamToken": 7})).unwrap();
        assert!(params.topic_name.is_none());
        assert!(serde_json::from_value::<SubscribeParams>(json!({"topicName": "ticks"})).is_err());
    }
}
