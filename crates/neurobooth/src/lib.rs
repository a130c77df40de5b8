//! Neurobooth - EEG booth sessions paired with remote scanners
//!
//! This is the unified library crate for Neurobooth. Feature flags control
//! which modules are compiled:
//!
//! - **Core** (always available): sample frames, broker wire protocol,
//!   hardware capture pipeline, analysis engine
//! - **`broker`**: pairing broker (axum WebSocket server, optional TLS)
//! - **`booth`**: booth session controller, sample fan-out, local web surface
//! - **`serial`**: serial-port board device
//! - **`test-source`**: synthetic board without hardware

// Core modules (always compiled)
pub mod analysis;
pub mod capture;
pub mod frame;
pub mod protocol;

pub use frame::{SampleFrame, SubmittedFrame, CHANNEL_COUNT};
pub use protocol::{Message, ProtocolError};

// Broker: registry, actor task, WebSocket server
#[cfg(feature = "broker")]
pub mod broker;

// Booth: controller, broadcaster, status snapshots
#[cfg(feature = "booth")]
pub mod booth;

// Web: booth HTTP surfaces and observer WebSocket
#[cfg(feature = "booth")]
pub mod web;
