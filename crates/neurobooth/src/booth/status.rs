//! Booth status snapshots
//!
//! The controller task is the only writer; everyone else reads the latest
//! [`BoothSnapshot`] from a `watch` channel.

use std::fmt;

use serde::Serialize;

/// Where the booth stands with the broker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Registered,
    UserConnected,
    Error,
    /// Connect retries exhausted; terminal
    ConnectionFailed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Registered => "registered",
            ConnectionStatus::UserConnected => "user_connected",
            ConnectionStatus::Error => "error",
            ConnectionStatus::ConnectionFailed => "connection_failed",
        }
    }

    /// Whether the broker has acknowledged this booth's registration
    pub fn is_registered(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Registered | ConnectionStatus::UserConnected
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controller projection served from `/status`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoothStatus {
    pub booth_id: String,
    pub is_connected: bool,
    pub scanner_connected: bool,
    pub connection_status: ConnectionStatus,
}

impl BoothStatus {
    pub fn new(booth_id: impl Into<String>) -> Self {
        Self {
            booth_id: booth_id.into(),
            is_connected: false,
            scanner_connected: false,
            connection_status: ConnectionStatus::Disconnected,
        }
    }
}

/// Hardware projection served from `/eeg/status`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HardwareStatus {
    pub eeg_connected: bool,
    pub clients_connected: usize,
    pub hardware_port: String,
    pub processor_available: bool,
    pub samples_dropped: u64,
}

/// Everything the controller publishes
#[derive(Debug, Clone, PartialEq)]
pub struct BoothSnapshot {
    pub status: BoothStatus,
    /// The acquisition thread is streaming
    pub eeg_streaming: bool,
}

impl BoothSnapshot {
    pub fn new(booth_id: impl Into<String>) -> Self {
        Self {
            status: BoothStatus::new(booth_id),
            eeg_streaming: false,
        }
    }
}
