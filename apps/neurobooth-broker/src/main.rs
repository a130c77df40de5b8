//! Neurobooth Broker: pairs scanners with booths and relays between them
//!
//! ## Usage
//!
//! ```bash
//! # Plain WebSocket on port 8765
//! neurobooth-broker
//!
//! # TLS with the default certificate paths
//! NEUROBOOTH_TLS=true neurobooth-broker
//!
//! # Let a new scanner take over a paired booth
//! NEUROBOOTH_PAIRING_POLICY=preempt neurobooth-broker
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::Result;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use neurobooth::broker::{
    self, BrokerConfig, PairingPolicy, TlsPaths, DEFAULT_BROKER_PORT, DEFAULT_OUTBOX_CAPACITY,
};

/// Broker configuration from environment
struct Config {
    bind: IpAddr,
    port: u16,
    tls: bool,
    tls_cert: PathBuf,
    tls_key: PathBuf,
    policy: PairingPolicy,
    outbox_capacity: usize,
}

impl Config {
    fn from_env() -> Self {
        let defaults = TlsPaths::default();

        let bind: IpAddr = std::env::var("NEUROBOOTH_BIND")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let port: u16 = std::env::var("NEUROBOOTH_BROKER_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BROKER_PORT);

        let tls = std::env::var("NEUROBOOTH_TLS")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let tls_cert = std::env::var("NEUROBOOTH_TLS_CERT")
            .map(PathBuf::from)
            .unwrap_or(defaults.cert);

        let tls_key = std::env::var("NEUROBOOTH_TLS_KEY")
            .map(PathBuf::from)
            .unwrap_or(defaults.key);

        let policy = match std::env::var("NEUROBOOTH_PAIRING_POLICY") {
            Ok(s) => s.parse().unwrap_or_else(|e| {
                warn!("{}, using reject", e);
                PairingPolicy::Reject
            }),
            Err(_) => PairingPolicy::default(),
        };

        let outbox_capacity: usize = std::env::var("NEUROBOOTH_OUTBOX_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_OUTBOX_CAPACITY);

        Self {
            bind,
            port,
            tls,
            tls_cert,
            tls_key,
            policy,
            outbox_capacity,
        }
    }

    fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            bind: SocketAddr::new(self.bind, self.port),
            policy: self.policy,
            outbox_capacity: self.outbox_capacity,
            tls: self.tls.then(|| TlsPaths {
                cert: self.tls_cert.clone(),
                key: self.tls_key.clone(),
            }),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env();

    info!("Neurobooth Broker starting");
    info!("  Bind: {}:{}", config.bind, config.port);
    info!("  Pairing policy: {:?}", config.policy);
    if config.tls {
        info!("  TLS cert: {:?}", config.tls_cert);
        info!("  TLS key: {:?}", config.tls_key);
    } else {
        info!("  TLS: disabled (set NEUROBOOTH_TLS=true to enable)");
    }

    // Graceful shutdown
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let server_cancel = cancel.clone();
    let server_config = config.broker_config();
    let server = tracker.spawn(async move {
        let result = broker::serve(server_config, server_cancel.clone()).await;
        if let Err(ref e) = result {
            error!("Broker error: {:#}", e);
        }
        // A failed server takes the process down with it
        server_cancel.cancel();
        result
    });
    tracker.close();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            cancel.cancel();
        }
        _ = cancel.cancelled() => {}
    }

    if tokio::time::timeout(Duration::from_secs(5), tracker.wait()).await.is_err() {
        warn!("Shutdown timed out after 5s");
        return Ok(());
    }
    server.await?
}

fn init_logging() {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "neurobooth=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
