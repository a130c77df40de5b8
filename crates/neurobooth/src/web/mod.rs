//! Booth web surface: axum HTTP + WebSocket for local observers.
//!
//! - `GET /ws`: real-time observer channel (samples out, `analyze` in)
//! - `GET /status`: controller status
//! - `GET /booth-info`: identity and QR payload for scanners
//! - `GET /eeg/status`: hardware and fan-out status

pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::analysis::AnalysisEngine;
use crate::booth::{BoothSnapshot, BroadcastHandle, HardwareStatus};
use crate::capture::SampleQueue;
use crate::protocol::timestamp_now;

/// Shared state for the booth web server
pub struct WebState {
    pub snapshot: watch::Receiver<BoothSnapshot>,
    pub broadcast: BroadcastHandle,
    pub engine: Arc<AnalysisEngine>,
    /// Device path reported by `/eeg/status`
    pub hardware_port: String,
    /// Broker URL handed to scanners through the QR payload
    pub relayer_url: String,
    /// Producer side, read for its drop counter
    pub queue: SampleQueue,
}

impl WebState {
    pub fn hardware_status(&self) -> HardwareStatus {
        HardwareStatus {
            eeg_connected: self.snapshot.borrow().eeg_streaming,
            clients_connected: self.broadcast.observer_count(),
            hardware_port: self.hardware_port.clone(),
            processor_available: self.engine.is_available(),
            samples_dropped: self.queue.dropped(),
        }
    }
}

pub fn app(state: WebState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/status", get(status))
        .route("/booth-info", get(booth_info))
        .route("/eeg/status", get(eeg_status))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Serve the booth web surface until `cancel` fires.
pub async fn serve(state: WebState, bind: SocketAddr, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind to {}", bind))?;

    info!("Booth web server listening on http://{}", bind);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Web server error")
}

/// Scanners cannot reach the booth's loopback name, so `localhost` is
/// spelled out as an address. The scheme is left as configured.
pub fn scanner_facing_url(url: &str) -> String {
    url.replacen("localhost", "127.0.0.1", 1)
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<WebState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws::handle_ws(socket, state))
}

/// GET /status
async fn status(State(state): State<Arc<WebState>>) -> Json<Value> {
    let status = state.snapshot.borrow().status.clone();
    let mut resp = json!(status);
    resp["timestamp"] = json!(timestamp_now());
    Json(resp)
}

/// GET /booth-info
async fn booth_info(State(state): State<Arc<WebState>>) -> Json<Value> {
    let status = state.snapshot.borrow().status.clone();
    Json(json!({
        "booth_id": status.booth_id,
        "qr_data": {
            "booth_id": status.booth_id,
            "relayer_url": scanner_facing_url(&state.relayer_url),
        },
        "status": status.connection_status,
    }))
}

/// GET /eeg/status
async fn eeg_status(State(state): State<Arc<WebState>>) -> Json<HardwareStatus> {
    Json(state.hardware_status())
}
