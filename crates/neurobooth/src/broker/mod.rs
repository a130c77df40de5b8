//! Pairing broker: matches scanners to registered booths and relays
//! messages between each pair.
//!
//! Endpoints:
//! - `GET /` and `GET /ws`: broker WebSocket
//! - `GET /api/status`: active booths, scanners and connections

pub mod registry;
pub mod router;
pub mod ws;

pub use registry::{BrokerStatus, ConnId, Delivery, PairingPolicy, Registry, Role};
pub use router::{Broker, BrokerHandle, Outbox};

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Default listening port
pub const DEFAULT_BROKER_PORT: u16 = 8765;

/// Default per-connection outbox size
pub const DEFAULT_OUTBOX_CAPACITY: usize = 64;

/// Queue depth of the broker task's command channel
const COMMAND_CAPACITY: usize = 1024;

/// Certificate and key used when serving `wss://`
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Default for TlsPaths {
    fn default() -> Self {
        Self {
            cert: PathBuf::from("./certificates/relayer-certificate.pem"),
            key: PathBuf::from("./certificates/relayer-private-key.pem"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind: SocketAddr,
    pub policy: PairingPolicy,
    pub outbox_capacity: usize,
    /// Serve over TLS when set
    pub tls: Option<TlsPaths>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_BROKER_PORT)),
            policy: PairingPolicy::default(),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            tls: None,
        }
    }
}

#[derive(Clone)]
struct AppState {
    broker: BrokerHandle,
    outbox_capacity: usize,
    cancel: CancellationToken,
}

/// Build the broker's axum app around an already running broker task
pub fn app(broker: BrokerHandle, outbox_capacity: usize, cancel: CancellationToken) -> Router {
    let state = AppState {
        broker,
        outbox_capacity,
        cancel,
    };
    Router::new()
        .route("/", get(ws_upgrade))
        .route("/ws", get(ws_upgrade))
        .route("/api/status", get(api_status))
        .with_state(state)
}

/// Run the broker until `cancel` fires.
///
/// Fails only on startup problems: an unusable bind address or, with TLS
/// enabled, missing or unreadable certificate material.
pub async fn serve(config: BrokerConfig, cancel: CancellationToken) -> Result<()> {
    let handle = router::spawn(config.policy, COMMAND_CAPACITY, cancel.clone());
    let app = app(handle, config.outbox_capacity, cancel.clone());

    match config.tls {
        Some(tls) => serve_tls(app, config.bind, tls, cancel).await,
        None => {
            let listener = tokio::net::TcpListener::bind(config.bind)
                .await
                .with_context(|| format!("Failed to bind to {}", config.bind))?;
            info!("Broker listening on ws://{}", config.bind);

            axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
                .context("Broker server error")
        }
    }
}

async fn serve_tls(
    app: Router,
    bind: SocketAddr,
    tls: TlsPaths,
    cancel: CancellationToken,
) -> Result<()> {
    for path in [&tls.cert, &tls.key] {
        if !path.exists() {
            anyhow::bail!("TLS material not found: {}", path.display());
        }
    }
    let rustls = axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls.cert, &tls.key)
        .await
        .context("Failed to load TLS certificate or key")?;

    let server_handle = axum_server::Handle::new();
    let shutdown = server_handle.clone();
    tokio::spawn(async move {
        cancel.cancelled().await;
        shutdown.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
    });

    info!("Broker listening on wss://{}", bind);
    axum_server::bind_rustls(bind, rustls)
        .handle(server_handle)
        .serve(app.into_make_service())
        .await
        .context("Broker server error")
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        ws::handle_ws(socket, state.broker, state.outbox_capacity, state.cancel)
    })
}

/// GET /api/status
async fn api_status(State(state): State<AppState>) -> Json<BrokerStatus> {
    Json(state.broker.status().await.unwrap_or_default())
}
