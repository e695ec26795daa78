//! In-process transport.
//!
//! Links two endpoints with channels instead of a socket. Frames are still
//! serialized, so behavior matches the network transports exactly.

use super::{run_connection, Inbound};
use crate::connection::{Connection, Outbound};
use crate::endpoint::Endpoint;
use drp_types::DrpError;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Connect `left` and `right`. Returns the connection each side uses to
/// reach the other: `(left's view of right, right's view of left)`.
///
/// Both sides run their open hooks. Closing either connection closes both.
pub fn connect(left: Arc<Endpoint>, right: Arc<Endpoint>) -> (Arc<Connection>, Arc<Connection>) {
    let (left_tx, left_rx) = mpsc::unbounded_channel();
    let (right_tx, right_rx) = mpsc::unbounded_channel();
    let left_conn = Connection::new(format!("memory:{}", right.name()), left_tx);
    let right_conn = Connection::new(format!("memory:{}", left.name()), right_tx);

    // left writes into right's reader and vice versa
    let (to_right, from_left) = fmpsc::unbounded::<Outbound>();
    let (to_left, from_right) = fmpsc::unbounded::<Outbound>();

    spawn_side(left, Arc::clone(&left_conn), left_rx, from_right, to_right);
    spawn_side(right, Arc::clone(&right_conn), right_rx, from_left, to_left);

    (left_conn, right_conn)
}

fn spawn_side(
    endpoint: Arc<Endpoint>,
    conn: Arc<Connection>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    incoming: fmpsc::UnboundedReceiver<Outbound>,
    peer: fmpsc::UnboundedSender<Outbound>,
) {
    let reader = incoming
        .map(|frame| match frame {
            Outbound::Text(text) => Ok(Inbound::Text(text)),
            Outbound::Close => Ok(Inbound::Closed),
        })
        .chain(futures::stream::iter([Ok(Inbound::Closed)]));
    let writer = peer.sink_map_err(|_| DrpError::ConnectionClosed);
    tokio::spawn(run_connection(endpoint, conn, outbound, reader, writer));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::time::Duration;

    #[tokio::test]
    async fn test_commands_cross_the_pair() {
        let server = Endpoint::new("server");
        server.register_command(
            "add",
            |p: Value, _: Arc<Connection>, _: Option<u64>| async move {
                let sum = p["a"].as_i64().unwrap_or(0) + p["b"].as_i64().unwrap_or(0);
                Ok(json!(sum))
            },
        );
        let client = Endpoint::new("client");
        let (to_server, _to_client) = connect(client, server);

        let result = to_server.call("add", json!({"a": 2, "b": 3})).await.unwrap();
        assert_eq!(result, json!(5));

        let cmds = to_server.call("getCmds", Value::Null).await.unwrap();
        assert_eq!(cmds, json!(["add", "getCmds"]));
    }

    #[tokio::test]
    async fn test_close_propagates() {
        let (a, b) = connect(Endpoint::new("a"), Endpoint::new("b"));
        a.close();
        tokio::time::timeout(Duration::from_secs(2), async {
            while b.is_open() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(b.send_cmd_oneway("x", Value::Null).is_err());
    }
}
