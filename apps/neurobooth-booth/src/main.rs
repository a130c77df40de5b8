//! Neurobooth Booth: EEG booth with local observer surface
//!
//! Registers with the broker, streams the board while a scanner is paired,
//! and serves status endpoints plus a real-time observer WebSocket.
//!
//! ## Usage
//!
//! ```bash
//! # Random booth id, broker on localhost
//! neurobooth-booth
//!
//! # Fixed booth id
//! neurobooth-booth B1
//!
//! # Synthetic board, no hardware needed
//! neurobooth-booth B1 --test-source
//!
//! # Remote broker over TLS
//! NEUROBOOTH_BROKER_URL=wss://broker.example.org:8765 neurobooth-booth
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use neurobooth::analysis::{AnalysisEngine, DEFAULT_SAMPLE_RATE};
use neurobooth::booth::{
    self, generate_booth_id, BoothConfig, BoothController, DEFAULT_BROKER_URL, DEFAULT_WEB_PORT,
};
use neurobooth::capture::{
    sample_queue, SerialOpener, SourceOpener, SyntheticOpener, DEFAULT_BAUD_RATE,
    DEFAULT_QUEUE_CAPACITY, DEFAULT_SCALE_UV,
};
use neurobooth::web::{self, WebState};

/// Booth configuration from environment and command line
struct Config {
    booth_id: String,
    broker_url: String,
    web_port: u16,
    serial_port: String,
    baud_rate: u32,
    scale_uv: f64,
    sample_rate: u32,
    queue_capacity: usize,
    analysis: bool,
    reconnect: bool,
    test_source: bool,
}

impl Config {
    fn from_env() -> Self {
        let args: Vec<String> = std::env::args().skip(1).collect();
        let test_source = args.iter().any(|a| a == "--test-source");

        let booth_id = args
            .iter()
            .find(|a| !a.starts_with("--"))
            .cloned()
            .or_else(|| std::env::var("NEUROBOOTH_BOOTH_ID").ok())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_booth_id);

        let broker_url = std::env::var("NEUROBOOTH_BROKER_URL")
            .unwrap_or_else(|_| DEFAULT_BROKER_URL.to_string());

        let web_port: u16 = std::env::var("NEUROBOOTH_WEB_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_WEB_PORT);

        let serial_port = std::env::var("NEUROBOOTH_SERIAL_PORT")
            .unwrap_or_else(|_| "/dev/ttyUSB0".to_string());

        let baud_rate: u32 = std::env::var("NEUROBOOTH_BAUD_RATE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_BAUD_RATE);

        let scale_uv: f64 = std::env::var("NEUROBOOTH_SCALE_UV")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_SCALE_UV);

        let sample_rate: u32 = std::env::var("NEUROBOOTH_SAMPLE_RATE")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_SAMPLE_RATE);

        let queue_capacity: usize = std::env::var("NEUROBOOTH_QUEUE_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_QUEUE_CAPACITY);

        let analysis = std::env::var("NEUROBOOTH_ANALYSIS")
            .map(|v| v != "0" && v.to_lowercase() != "false")
            .unwrap_or(true);

        let reconnect = std::env::var("NEUROBOOTH_RECONNECT")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        Self {
            booth_id,
            broker_url,
            web_port,
            serial_port,
            baud_rate,
            scale_uv,
            sample_rate,
            queue_capacity,
            analysis,
            reconnect,
            test_source,
        }
    }

    fn booth_config(&self) -> BoothConfig {
        let mut config = BoothConfig::new(self.booth_id.clone(), self.broker_url.clone());
        config.reconnect = self.reconnect;
        config.acquisition.scale_uv = self.scale_uv;
        config
    }

    fn opener(&self) -> Arc<dyn SourceOpener> {
        if self.test_source {
            Arc::new(SyntheticOpener {
                sample_rate: self.sample_rate,
            })
        } else {
            Arc::new(SerialOpener::new(self.serial_port.clone(), self.baud_rate))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env();
    let opener = config.opener();

    info!("Neurobooth Booth starting");
    info!("  Booth id: {}", config.booth_id);
    info!("  Broker: {}", config.broker_url);
    info!("  Web port: {}", config.web_port);
    info!("  Device: {} @ {} baud", opener.port_name(), config.baud_rate);
    info!("  Sample rate: {} Hz", config.sample_rate);
    if !config.analysis {
        info!("  Analysis: disabled");
    }

    // Graceful shutdown
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let (queue, drain) = sample_queue(config.queue_capacity);
    let broadcast = booth::broadcast::spawn(drain, cancel.clone());

    let (controller, snapshot) =
        BoothController::new(config.booth_config(), Arc::clone(&opener), queue.clone());
    let controller_cancel = cancel.clone();
    tracker.spawn(async move {
        // The web surface keeps reporting the failure after this returns
        if let Err(e) = controller.run(controller_cancel).await {
            error!("{}", e);
        }
    });

    let state = WebState {
        snapshot,
        broadcast,
        engine: Arc::new(
            AnalysisEngine::new(config.sample_rate).with_availability(config.analysis),
        ),
        hardware_port: opener.port_name(),
        relayer_url: config.broker_url.clone(),
        queue,
    };
    let web_bind = SocketAddr::from(([0, 0, 0, 0], config.web_port));
    let web_cancel = cancel.clone();
    tracker.spawn(async move {
        if let Err(e) = web::serve(state, web_bind, web_cancel.clone()).await {
            error!("Web server error: {:#}", e);
            web_cancel.cancel();
        }
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
    }
    Ok(())
}

fn init_logging() {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "neurobooth=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
