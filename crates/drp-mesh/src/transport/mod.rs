//! Transports that carry DRP frames.
//!
//! - [`listener`]: WebSocket server hosting one [`Endpoint`] per route
//! - [`client`]: outbound WebSocket with supervised fixed-delay reconnect
//! - [`memory`]: in-process pair, for embedding and tests
//!
//! All three feed inbound text into [`Endpoint::receive_message`] and drain
//! the connection's outbound queue through the shared pump below.

pub mod client;
pub mod listener;
pub mod memory;

use crate::connection::{Connection, Outbound};
use crate::endpoint::Endpoint;
use drp_types::DrpError;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// DRP WebSocket subprotocol name.
pub const SUBPROTOCOL: &str = "drp";

/// How long the writer may take to flush a close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// An inbound event, already stripped of transport framing.
#[derive(Debug)]
pub enum Inbound {
    Text(String),
    Closed,
}

/// Drive one connection until either side closes it.
///
/// Runs the writer on its own task, feeds every inbound text frame to the
/// endpoint, and fires the endpoint's lifecycle hooks. A frame that is not
/// JSON closes the connection.
pub(crate) async fn run_connection<R, W>(
    endpoint: Arc<Endpoint>,
    conn: Arc<Connection>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    mut reader: R,
    mut writer: W,
) where
    R: Stream<Item = Result<Inbound, DrpError>> + Unpin + Send,
    W: Sink<Outbound, Error = DrpError> + Unpin + Send + 'static,
{
    let conn_id = conn.id();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let closing = frame == Outbound::Close;
            if let Err(e) = writer.send(frame).await {
                debug!(conn = conn_id, error = %e, "Writer stopped");
                break;
            }
            if closing {
                let _ = writer.close().await;
                break;
            }
        }
    });

    endpoint.connection_opened(&conn);

    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Inbound::Text(text)) => {
                if let Err(e) = endpoint.receive_message(&conn, &text) {
                    endpoint.connection_error(&conn, &e);
                    break;
                }
            }
            Ok(Inbound::Closed) => break,
            Err(e) => {
                endpoint.connection_error(&conn, &e);
                break;
            }
        }
    }

    conn.close();
    let _ = tokio::time::timeout(CLOSE_GRACE, writer_task).await;
    endpoint.connection_closed(&conn).await;
}
