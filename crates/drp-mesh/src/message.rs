//! Wire protocol message types.
//!
//! Every DRP frame is a single JSON object sent as a WebSocket text frame.
//! The `type` field selects one of three shapes: `cmd`, `reply`, `stream`.

use drp_types::DrpError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reply status: the handler failed and `payload` describes the error.
pub const REPLY_ERROR: u8 = 0;
/// Reply status: the handler succeeded.
pub const REPLY_OK: u8 = 1;
/// Stream status: last message for this token.
pub const STREAM_FINAL: u8 = 1;
/// Stream status: more messages may follow.
pub const STREAM_MORE: u8 = 2;

/// Service name that addresses the endpoint's own command table.
pub const ENDPOINT_SERVICE: &str = "DRP";

/// A DRP frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Packet {
    /// Invoke a named command on the peer.
    #[serde(rename = "cmd")]
    Cmd(CmdPacket),
    /// One-shot answer to a `cmd` that carried a `replytoken`.
    #[serde(rename = "reply")]
    Reply(ReplyPacket),
    /// One message of a subscription.
    #[serde(rename = "stream")]
    Stream(StreamPacket),
}

/// Command invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CmdPacket {
    /// Registered handler name.
    pub cmd: String,
    /// Arbitrary parameters.
    #[serde(default)]
    pub params: Value,
    /// Correlation token. `None` means fire-and-forget.
    #[serde(default)]
    pub replytoken: Option<u64>,
    /// Routes the command to a hosted service instead of the endpoint table.
    #[serde(
        rename = "serviceName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub service_name: Option<String>,
}

impl CmdPacket {
    pub fn new(cmd: impl Into<String>, params: Value, replytoken: Option<u64>) -> Self {
        Self {
            cmd: cmd.into(),
            params,
            replytoken,
            service_name: None,
        }
    }

    /// The hosted service this command targets, if it is not the endpoint itself.
    pub fn target_service(&self) -> Option<&str> {
        self.service_name
            .as_deref()
            .filter(|name| *name != ENDPOINT_SERVICE)
    }
}

/// Answer to a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPacket {
    pub token: u64,
    pub status: u8,
    #[serde(default)]
    pub payload: Value,
}

impl ReplyPacket {
    pub fn is_ok(&self) -> bool {
        self.status == REPLY_OK
    }

    /// Convert into the payload, or a `Remote` error when the status is 0.
    pub fn into_result(self) -> Result<Value, DrpError> {
        if self.is_ok() {
            Ok(self.payload)
        } else {
            Err(DrpError::Remote(payload_text(&self.payload)))
        }
    }
}

/// One message on a stream token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamPacket {
    pub token: u64,
    pub status: u8,
    #[serde(default)]
    pub payload: Value,
}

/// Result of decoding a text frame that was valid JSON.
#[derive(Debug)]
pub enum Decoded {
    Packet(Packet),
    /// Valid JSON that is not a DRP frame; the reason is for logging.
    Ignored(String),
}

/// Serialize a frame to JSON text.
pub fn encode_packet(packet: &Packet) -> Result<String, serde_json::Error> {
    serde_json::to_string(packet)
}

/// Decode a text frame.
///
/// Returns `Err` only when the text is not JSON at all. A JSON value with a
/// missing or unknown `type`, or with fields of the wrong shape, decodes to
/// [`Decoded::Ignored`].
pub fn decode_packet(text: &str) -> Result<Decoded, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    let kind = match value.get("type").and_then(Value::as_str) {
        Some(kind @ ("cmd" | "reply" | "stream")) => kind.to_string(),
        Some(other) => return Ok(Decoded::Ignored(format!("unknown type '{other}'"))),
        None => return Ok(Decoded::Ignored("missing type".to_string())),
    };
    match serde_json::from_value::<Packet>(value) {
        Ok(packet) => Ok(Decoded::Packet(packet)),
        Err(e) => Ok(Decoded::Ignored(format!("invalid {kind} frame: {e}"))),
    }
}

/// Render an error payload as text. Strings are used verbatim.
pub fn payload_text(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cmd_wire_shape() {
        let packet = Packet::Cmd(CmdPacket::new(
            "subscribe",
            json!({"topicName": "ticks", "streamToken": 4}),
            Some(7),
        ));
        let value = serde_json::to_value(&packet).unwrap();
        assert_eq!(value["type"], "cmd");
        assert_eq!(value["cmd"], "subscribe");
        assert_eq!(value["replytoken"], 7);
        assert_eq!(value["params"]["streamToken"], 4);
        assert!(value.get("serviceName").is_none());
    }

    #[test]
    fn test_oneway_cmd_has_null_token() {
        let packet = Packet::Cmd(CmdPacket::new("unsubscribe", json!({}), None));
        let value = serde_json::to_value(&packet).unwrap();
        assert!(value["replytoken"].is_null());
    }

    #[test]
    fn test_decode_reply_and_stream() {
        match decode_packet(r#"{"type":"reply","token":3,"status":1,"payload":"OKAY"}"#).unwrap() {
            Decoded::Packet(Packet::Reply(reply)) => {
                assert_eq!(reply.token, 3);
                assert!(reply.is_ok());
                assert_eq!(reply.payload, json!("OKAY"));
            }
            other => panic!("Expected reply, got {other:?}"),
        }

        match decode_packet(r#"{"type":"stream","token":9,"status":2,"payload":{"n":1}}"#).unwrap()
        {
            Decoded::Packet(Packet::Stream(stream)) => {
                assert_eq!(stream.token, 9);
                assert_eq!(stream.status, STREAM_MORE);
                assert_eq!(stream.payload["n"], 1);
            }
            other => panic!("Expected stream, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_cmd_without_replytoken() {
        match decode_packet(r#"{"type":"cmd","cmd":"getCmds"}"#).unwrap() {
            Decoded::Packet(Packet::Cmd(cmd)) => {
                assert_eq!(cmd.cmd, "getCmds");
                assert!(cmd.replytoken.is_none());
                assert!(cmd.params.is_null());
            }
            other => panic!("Expected cmd, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_type_is_ignored() {
        assert!(matches!(
            decode_packet(r#"{"type":"gossip","x":1}"#).unwrap(),
            Decoded::Ignored(_)
        ));
        assert!(matches!(
            decode_packet(r#"{"cmd":"getCmds"}"#).unwrap(),
            Decoded::Ignored(_)
        ));
        assert!(matches!(
            decode_packet(r#"{"type":"reply","status":1}"#).unwrap(),
            Decoded::Ignored(_)
        ));
    }

    #[test]
    fn test_decode_malformed_json_is_error() {
        assert!(decode_packet("{\"type\": \"cmd\"").is_err());
        assert!(decode_packet("not json").is_err());
    }

    #[test]
    fn test_service_routing() {
        let mut cmd = CmdPacket::new("lookup", json!({}), Some(1));
        assert!(cmd.target_service().is_none());
        cmd.service_name = Some("DRP".to_string());
        assert!(cmd.target_service().is_none());
        cmd.service_name = Some("Hive".to_string());
        assert_eq!(cmd.target_service(), Some("Hive"));
    }

    #[test]
    fn test_reply_into_result() {
        let ok = ReplyPacket {
            token: 1,
            status: REPLY_OK,
            payload: json!([1, 2]),
        };
        assert_eq!(ok.into_result().unwrap(), json!([1, 2]));

        let failed = ReplyPacket {
            token: 2,
            status: REPLY_ERROR,
            payload: json!("NO PROVIDER ID"),
        };
        match failed.into_result() {
            Err(DrpError::Remote(msg)) => assert_eq!(msg, "NO PROVIDER ID"),
            other => panic!("Expected remote error, got {other:?}"),
        }
    }
}
