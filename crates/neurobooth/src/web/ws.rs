//! Observer WebSocket: streams sample frames, answers analysis requests.
//!
//! Text protocol (client ← server):
//!   {"type":"status","connected":bool,"message":..}   once, on attach
//!   {"type":"eeg",...}                                 every sample frame
//!   {"type":"analysis",...} | {"type":"error",...}     replies to `analyze`
//!
//! Client → server:
//!   {"type":"analyze","data":[frame, ...]}

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::WebState;
use crate::analysis::AnalysisError;
use crate::frame::SubmittedFrame;

/// Handle one observer until it closes or its transport fails.
pub async fn handle_ws(socket: WebSocket, state: Arc<WebState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let Some((id, mut frames)) = state.broadcast.attach() else {
        warn!("Broadcaster stopped, refusing observer");
        return;
    };

    if send_json(&mut ws_tx, &status_message(&state)).await.is_ok() {
        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else { break };
                    if ws_tx.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                incoming = ws_rx.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            let reply = handle_request(&state, text.as_str()).await;
                            if send_json(&mut ws_tx, &reply).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(observer = id, "WebSocket error: {}", e);
                            break;
                        }
                    }
                }
            }
        }
    }

    state.broadcast.detach(id);
    debug!(observer = id, "Observer disconnected");
}

fn status_message(state: &WebState) -> Value {
    let streaming = state.snapshot.borrow().eeg_streaming;
    let message = if streaming {
        "Connected to EEG stream"
    } else {
        "Connected, EEG hardware is not streaming"
    };
    json!({
        "type": "status",
        "connected": streaming,
        "message": message,
    })
}

/// Answer one client request
async fn handle_request(state: &Arc<WebState>, text: &str) -> Value {
    let Ok(request) = serde_json::from_str::<Value>(text) else {
        return error_reply("Invalid JSON message");
    };

    match request.get("type").and_then(Value::as_str) {
        Some("analyze") => {
            let frames: Vec<SubmittedFrame> = match request.get("data") {
                None | Some(Value::Null) => Vec::new(),
                Some(data) => match serde_json::from_value(data.clone()) {
                    Ok(frames) => frames,
                    Err(e) => return error_reply(format!("Invalid analyze request: {}", e)),
                },
            };
            analyze(state, frames).await
        }
        Some(other) => error_reply(format!("Unknown message type: {}", other)),
        None => error_reply("Missing message type"),
    }
}

async fn analyze(state: &Arc<WebState>, frames: Vec<SubmittedFrame>) -> Value {
    let engine = Arc::clone(&state.engine);
    let count = frames.len();
    let result = tokio::task::spawn_blocking(move || engine.analyze_frames(&frames)).await;

    match result {
        Ok(Ok(report)) => {
            info!(
                frames = count,
                love_score = report.love_analysis.love_score,
                "Analysis complete"
            );
            let mut reply = json!(report);
            reply["type"] = json!("analysis");
            reply
        }
        Ok(Err(e)) => {
            if !matches!(e, AnalysisError::InsufficientChannels { .. }) {
                warn!(frames = count, "Analysis rejected: {}", e);
            }
            error_reply(e.to_string())
        }
        Err(e) => {
            warn!("Analysis task failed: {}", e);
            error_reply("Analysis failed")
        }
    }
}

fn error_reply(message: impl Into<String>) -> Value {
    json!({ "type": "error", "message": message.into() })
}

async fn send_json(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    value: &Value,
) -> Result<(), axum::Error> {
    ws_tx.send(Message::Text(value.to_string().into())).await
}
