//! Per-connection WebSocket loop for the broker.
//!
//! Inbound text frames go to the broker task in arrival order; messages the
//! broker queues in this connection's outbox are encoded and written out.

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::router::{BrokerHandle, Outbox};

/// Handle one broker connection until either side closes it.
pub async fn handle_ws(
    socket: WebSocket,
    broker: BrokerHandle,
    outbox_capacity: usize,
    cancel: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbox, mut outgoing) = Outbox::channel(outbox_capacity);

    let Some(conn) = broker.connect(outbox).await else {
        warn!("Broker unavailable, dropping connection");
        return;
    };
    debug!(conn, "WebSocket connected");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = outgoing.recv() => {
                let Some(msg) = msg else { break };
                let text = match msg.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(conn, kind = msg.kind(), "Failed to encode message: {}", e);
                        continue;
                    }
                };
                if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        if !broker.inbound(conn, text.to_string()).await {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        // Binary frames get the same treatment as text; non-UTF-8
                        // payloads surface as invalid JSON.
                        let text = String::from_utf8_lossy(&data).into_owned();
                        if !broker.inbound(conn, text).await {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong handled by axum
                    Some(Err(e)) => {
                        debug!(conn, "WebSocket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    broker.disconnect(conn).await;
    debug!(conn, "WebSocket disconnected");
}
