//! Broker wire protocol
//!
//! Every message is a JSON object tagged by `type`. Optional fields are
//! omitted when absent, and every outgoing message is stamped with an
//! RFC 3339 `timestamp`:
//!
//! ```text
//! {"type": "...", "booth_id"?: "...", "data"?: {...}, "target"?: "...",
//!  "message"?: "...", "original_type"?: "...", "timestamp": "..."}
//! ```
//!
//! Incoming timestamps are accepted and ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Every `type` value understood by either side of the broker.
pub const MESSAGE_TYPES: [&str; 13] = [
    "register_booth",
    "connect_scanner",
    "relay_message",
    "ping",
    "registration_success",
    "connection_success",
    "scanner_connected",
    "scanner_disconnected",
    "booth_disconnected",
    "message_from_scanner",
    "message_from_booth",
    "error",
    "pong",
];

/// A broker protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    // ── Requests (booth or scanner → broker) ──
    /// Claim a booth identity for this connection
    RegisterBooth {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        booth_id: Option<String>,
    },
    /// Pair this connection, as a scanner, with a registered booth
    ConnectScanner {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        booth_id: Option<String>,
    },
    /// Forward an opaque payload to the paired peer
    RelayMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    /// Liveness probe
    Ping,

    // ── Replies and notifications (broker → booth or scanner) ──
    RegistrationSuccess { booth_id: String },
    ConnectionSuccess { booth_id: String },
    ScannerConnected { booth_id: String },
    ScannerDisconnected { booth_id: String },
    BoothDisconnected { booth_id: String },
    MessageFromScanner {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original_type: Option<String>,
    },
    MessageFromBooth {
        booth_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original_type: Option<String>,
    },
    Error { message: String },
    Pong,
}

/// Why an incoming text frame could not be turned into a [`Message`].
///
/// The `Display` text is sent back verbatim inside an `error` message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON message")]
    InvalidJson,
    #[error("Missing message type")]
    MissingType,
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Malformed {kind} message: {reason}")]
    Malformed { kind: String, reason: String },
}

impl Message {
    /// Build an `error` message
    pub fn error(message: impl Into<String>) -> Self {
        Message::Error {
            message: message.into(),
        }
    }

    /// Build a `relay_message` carrying `data`
    pub fn relay(data: Value) -> Self {
        Message::RelayMessage {
            data: Some(data),
            target: None,
        }
    }

    /// The wire `type` tag of this message
    pub fn kind(&self) -> &'static str {
        match self {
            Message::RegisterBooth { .. } => "register_booth",
            Message::ConnectScanner { .. } => "connect_scanner",
            Message::RelayMessage { .. } => "relay_message",
            Message::Ping => "ping",
            Message::RegistrationSuccess { .. } => "registration_success",
            Message::ConnectionSuccess { .. } => "connection_success",
            Message::ScannerConnected { .. } => "scanner_connected",
            Message::ScannerDisconnected { .. } => "scanner_disconnected",
            Message::BoothDisconnected { .. } => "booth_disconnected",
            Message::MessageFromScanner { .. } => "message_from_scanner",
            Message::MessageFromBooth { .. } => "message_from_booth",
            Message::Error { .. } => "error",
            Message::Pong => "pong",
        }
    }

    /// Parse a text frame received from the wire.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;

        let kind = match value.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(ProtocolError::MissingType),
        };
        if !MESSAGE_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
            kind,
            reason: e.to_string(),
        })
    }

    /// Encode for the wire, stamping the current time.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(ref mut map) = value {
            map.insert("timestamp".into(), Value::String(timestamp_now()));
        }
        serde_json::to_string(&value)
    }
}

/// Current time as an RFC 3339 string
pub fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339()
}
