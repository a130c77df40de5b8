//! Booth side: broker session, hardware lifecycle and sample fan-out.
//!
//! The [`BoothController`] is the only task that talks to the broker and the
//! only writer of booth state. It publishes a [`BoothSnapshot`] that the web
//! surfaces read. The [`Broadcaster`] drains the sample queue and feeds
//! every attached observer.

pub mod broadcast;
pub mod controller;
pub mod status;

pub use broadcast::{BroadcastHandle, Broadcaster, ObserverId};
pub use controller::{BoothController, BoothError};
pub use status::{BoothSnapshot, BoothStatus, ConnectionStatus, HardwareStatus};

use std::time::Duration;

use crate::capture::AcquisitionConfig;

/// Broker URL used when none is configured
pub const DEFAULT_BROKER_URL: &str = "ws://127.0.0.1:8765";

/// Default port of the booth's local web surface
pub const DEFAULT_WEB_PORT: u16 = 3004;

/// Controller settings
#[derive(Debug, Clone)]
pub struct BoothConfig {
    pub booth_id: String,
    pub broker_url: String,
    /// Connect attempts per cycle before giving up
    pub connect_attempts: u32,
    pub retry_delay: Duration,
    /// Start a new connect cycle after the broker link closes
    pub reconnect: bool,
    pub acquisition: AcquisitionConfig,
}

impl BoothConfig {
    pub fn new(booth_id: impl Into<String>, broker_url: impl Into<String>) -> Self {
        Self {
            booth_id: booth_id.into(),
            broker_url: broker_url.into(),
            connect_attempts: 5,
            retry_delay: Duration::from_secs(5),
            reconnect: false,
            acquisition: AcquisitionConfig::default(),
        }
    }
}

impl Default for BoothConfig {
    fn default() -> Self {
        Self::new(generate_booth_id(), DEFAULT_BROKER_URL)
    }
}

/// Random booth identity of the form `booth_<8 hex digits>`
pub fn generate_booth_id() -> String {
    format!("booth_{:08x}", rand::random::<u32>())
}
