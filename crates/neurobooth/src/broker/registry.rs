//! Pairing registry
//!
//! Pure state machine behind the broker: every inbound message and every
//! disconnect is turned into a list of [`Delivery`] values for the caller to
//! send. It owns both maps (booth identity → booth connection, scanner
//! connection → paired booth identity) and is only ever touched by the broker
//! task, so it needs no locking.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::protocol::{Message, ProtocolError};

/// Identifies one broker connection for its whole lifetime
pub type ConnId = u64;

/// Role a connection takes on with its first register or connect message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Booth,
    Scanner,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Booth => f.write_str("booth"),
            Role::Scanner => f.write_str("scanner"),
        }
    }
}

/// What to do when a scanner asks for a booth that already has one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PairingPolicy {
    /// Refuse the newcomer and leave the existing pairing alone
    #[default]
    Reject,
    /// Drop the existing scanner and pair the newcomer
    Preempt,
}

impl FromStr for PairingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(PairingPolicy::Reject),
            "preempt" => Ok(PairingPolicy::Preempt),
            other => Err(format!("unknown pairing policy '{}'", other)),
        }
    }
}

/// A message the registry wants sent to one connection
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub to: ConnId,
    pub message: Message,
}

impl Delivery {
    fn new(to: ConnId, message: Message) -> Self {
        Self { to, message }
    }
}

/// Point-in-time counts, served from `/api/status`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BrokerStatus {
    pub active_booths: usize,
    pub active_scanners: usize,
    pub total_connections: usize,
    pub booth_ids: Vec<String>,
}

#[derive(Debug, Default)]
struct ConnState {
    role: Option<Role>,
    /// Booth: the identity it registered. Scanner: the booth it is paired with.
    booth_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct Registry {
    policy: PairingPolicy,
    conns: HashMap<ConnId, ConnState>,
    booths: HashMap<String, ConnId>,
}

impl Registry {
    pub fn new(policy: PairingPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    pub fn policy(&self) -> PairingPolicy {
        self.policy
    }

    /// Track a freshly accepted connection. It has no role yet.
    pub fn connect(&mut self, conn: ConnId) {
        self.conns.insert(conn, ConnState::default());
        debug!(conn, "Connection opened");
    }

    /// Process one text frame received on `conn`.
    pub fn handle_text(&mut self, conn: ConnId, text: &str) -> Vec<Delivery> {
        match Message::parse(text) {
            Ok(message) => self.handle(conn, message),
            Err(e) => {
                debug!(conn, error = %e, "Rejected inbound message");
                vec![Delivery::new(conn, Message::error(e.to_string()))]
            }
        }
    }

    /// Process one parsed message received on `conn`.
    pub fn handle(&mut self, conn: ConnId, message: Message) -> Vec<Delivery> {
        if !self.conns.contains_key(&conn) {
            warn!(conn, kind = message.kind(), "Message from untracked connection");
            return Vec::new();
        }

        match message {
            Message::RegisterBooth { booth_id } => self.register_booth(conn, booth_id),
            Message::ConnectScanner { booth_id } => self.connect_scanner(conn, booth_id),
            Message::RelayMessage { data, .. } => self.relay(conn, data),
            Message::Ping => vec![Delivery::new(conn, Message::Pong)],
            other => {
                let err = ProtocolError::UnknownType(other.kind().to_string());
                vec![Delivery::new(conn, Message::error(err.to_string()))]
            }
        }
    }

    /// Forget `conn` and notify whoever was paired through it.
    pub fn disconnect(&mut self, conn: ConnId) -> Vec<Delivery> {
        let Some(state) = self.conns.remove(&conn) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        match (state.role, state.booth_id) {
            (Some(Role::Booth), Some(booth_id)) => {
                self.release_booth(conn, &booth_id, &mut out);
            }
            (Some(Role::Scanner), Some(booth_id)) => {
                self.announce_scanner_left(&booth_id, &mut out);
                info!(conn, booth_id = %booth_id, "Scanner disconnected");
            }
            _ => debug!(conn, "Unregistered connection closed"),
        }
        out
    }

    pub fn status(&self) -> BrokerStatus {
        let booth_ids: BTreeSet<&String> = self.booths.keys().collect();
        BrokerStatus {
            active_booths: self.booths.len(),
            active_scanners: self
                .conns
                .values()
                .filter(|s| s.role == Some(Role::Scanner) && s.booth_id.is_some())
                .count(),
            total_connections: self.conns.len(),
            booth_ids: booth_ids.into_iter().cloned().collect(),
        }
    }

    /// Connection currently registered under `booth_id`
    pub fn booth_conn(&self, booth_id: &str) -> Option<ConnId> {
        self.booths.get(booth_id).copied()
    }

    /// Booth the scanner on `conn` is paired with
    pub fn paired_booth(&self, conn: ConnId) -> Option<&str> {
        self.conns
            .get(&conn)
            .filter(|s| s.role == Some(Role::Scanner))
            .and_then(|s| s.booth_id.as_deref())
    }

    fn register_booth(&mut self, conn: ConnId, booth_id: Option<String>) -> Vec<Delivery> {
        let Some(booth_id) = non_empty(booth_id) else {
            return refuse(conn, "Missing booth_id in registration");
        };
        if let Some(refusal) = self.role_conflict(conn, Role::Booth) {
            return vec![refusal];
        }

        let mut out = Vec::new();
        let previous = self.conns.get(&conn).and_then(|s| s.booth_id.clone());
        if let Some(previous) = previous.filter(|p| *p != booth_id) {
            info!(conn, from = %previous, to = %booth_id, "Booth changed identity");
            self.release_booth(conn, &previous, &mut out);
        }

        if let Some(replaced) = self.booths.insert(booth_id.clone(), conn) {
            if replaced != conn {
                warn!(
                    booth_id = %booth_id,
                    conn,
                    replaced,
                    "Booth re-registered, replacing previous connection"
                );
            }
        }
        if let Some(state) = self.conns.get_mut(&conn) {
            state.role = Some(Role::Booth);
            state.booth_id = Some(booth_id.clone());
        }

        info!(booth_id = %booth_id, conn, "Booth registered");
        out.push(Delivery::new(conn, Message::RegistrationSuccess { booth_id }));
        out
    }

    fn connect_scanner(&mut self, conn: ConnId, booth_id: Option<String>) -> Vec<Delivery> {
        let Some(booth_id) = non_empty(booth_id) else {
            return refuse(conn, "Missing booth_id for scanner connection");
        };
        if let Some(refusal) = self.role_conflict(conn, Role::Scanner) {
            return vec![refusal];
        }
        let Some(booth_conn) = self.booth_conn(&booth_id) else {
            return refuse(conn, format!("Booth {} is not available", booth_id));
        };

        if self.paired_booth(conn) == Some(booth_id.as_str()) {
            debug!(conn, booth_id = %booth_id, "Scanner already paired, confirming again");
            return vec![Delivery::new(conn, Message::ConnectionSuccess { booth_id })];
        }

        let rivals = self.scanners_of(&booth_id);
        if !rivals.is_empty() && self.policy == PairingPolicy::Reject {
            return refuse(
                conn,
                format!("Booth {} already has a scanner connected", booth_id),
            );
        }

        let mut out = Vec::new();

        // Switching booths releases the old one first
        let previous = self.conns.get_mut(&conn).and_then(|s| s.booth_id.take());
        if let Some(previous) = previous {
            self.announce_scanner_left(&previous, &mut out);
        }

        for rival in rivals {
            if let Some(state) = self.conns.get_mut(&rival) {
                state.booth_id = None;
            }
            info!(booth_id = %booth_id, preempted = rival, by = conn, "Scanner preempted");
            out.push(Delivery::new(
                rival,
                Message::BoothDisconnected {
                    booth_id: booth_id.clone(),
                },
            ));
            self.announce_scanner_left(&booth_id, &mut out);
        }

        if let Some(state) = self.conns.get_mut(&conn) {
            state.role = Some(Role::Scanner);
            state.booth_id = Some(booth_id.clone());
        }

        info!(booth_id = %booth_id, conn, "Scanner paired");
        out.push(Delivery::new(
            booth_conn,
            Message::ScannerConnected {
                booth_id: booth_id.clone(),
            },
        ));
        out.push(Delivery::new(conn, Message::ConnectionSuccess { booth_id }));
        out
    }

    fn relay(&mut self, conn: ConnId, data: Option<Value>) -> Vec<Delivery> {
        let (role, booth_id) = match self.conns.get(&conn) {
            Some(state) => (state.role, state.booth_id.clone()),
            None => return Vec::new(),
        };
        let original_type = Some("relay_message".to_string());

        match (role, booth_id) {
            (Some(Role::Scanner), Some(booth_id)) => match self.booth_conn(&booth_id) {
                Some(booth_conn) => vec![Delivery::new(
                    booth_conn,
                    Message::MessageFromScanner { data, original_type },
                )],
                None => refuse(conn, "Booth is no longer available"),
            },
            (Some(Role::Scanner), None) => refuse(conn, "Booth is no longer available"),
            (Some(Role::Booth), Some(booth_id)) => {
                let scanners = self.scanners_of(&booth_id);
                if scanners.is_empty() || self.booth_conn(&booth_id) != Some(conn) {
                    return refuse(conn, "No scanner connected");
                }
                scanners
                    .into_iter()
                    .map(|scanner| {
                        Delivery::new(
                            scanner,
                            Message::MessageFromBooth {
                                booth_id: booth_id.clone(),
                                data: data.clone(),
                                original_type: original_type.clone(),
                            },
                        )
                    })
                    .collect()
            }
            _ => refuse(conn, "Connection is not registered"),
        }
    }

    /// Refusal if `conn` already holds the other role
    fn role_conflict(&self, conn: ConnId, wanted: Role) -> Option<Delivery> {
        match self.conns.get(&conn).and_then(|s| s.role) {
            Some(role) if role != wanted => Some(Delivery::new(
                conn,
                Message::error(format!("Connection is already registered as a {}", role)),
            )),
            _ => None,
        }
    }

    /// Scanner connections paired with `booth_id`, in ascending order
    fn scanners_of(&self, booth_id: &str) -> Vec<ConnId> {
        let mut scanners: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, s)| {
                s.role == Some(Role::Scanner) && s.booth_id.as_deref() == Some(booth_id)
            })
            .map(|(id, _)| *id)
            .collect();
        scanners.sort_unstable();
        scanners
    }

    /// Drop the `booth_id` mapping if it still belongs to `conn`, unpairing
    /// and notifying its scanners. A mapping taken over by a newer
    /// registration is left alone.
    fn release_booth(&mut self, conn: ConnId, booth_id: &str, out: &mut Vec<Delivery>) {
        if self.booth_conn(booth_id) != Some(conn) {
            debug!(booth_id = %booth_id, conn, "Stale booth connection closed, mapping kept");
            return;
        }
        self.booths.remove(booth_id);

        for scanner in self.scanners_of(booth_id) {
            if let Some(state) = self.conns.get_mut(&scanner) {
                state.booth_id = None;
            }
            out.push(Delivery::new(
                scanner,
                Message::BoothDisconnected {
                    booth_id: booth_id.to_string(),
                },
            ));
        }
        info!(booth_id = %booth_id, conn, "Booth unregistered");
    }

    /// Tell the booth registered as `booth_id`, if any, that its scanner left
    fn announce_scanner_left(&self, booth_id: &str, out: &mut Vec<Delivery>) {
        if let Some(booth_conn) = self.booth_conn(booth_id) {
            out.push(Delivery::new(
                booth_conn,
                Message::ScannerDisconnected {
                    booth_id: booth_id.to_string(),
                },
            ));
        }
    }
}

fn refuse(conn: ConnId, text: impl Into<String>) -> Vec<Delivery> {
    vec![Delivery::new(conn, Message::error(text))]
}

fn non_empty(id: Option<String>) -> Option<String> {
    id.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BOOTH: ConnId = 1;
    const SCANNER: ConnId = 2;
    const OTHER: ConnId = 3;

    fn registry(policy: PairingPolicy) -> Registry {
        let mut reg = Registry::new(policy);
        for conn in [BOOTH, SCANNER, OTHER] {
            reg.connect(conn);
        }
        reg
    }

    fn register(reg: &mut Registry, conn: ConnId, id: &str) -> Vec<Delivery> {
        reg.handle(conn, Message::RegisterBooth { booth_id: Some(id.into()) })
    }

    fn pair(reg: &mut Registry, conn: ConnId, id: &str) -> Vec<Delivery> {
        reg.handle(conn, Message::ConnectScanner { booth_id: Some(id.into()) })
    }

    fn to(out: &[Delivery], conn: ConnId) -> Vec<&Message> {
        out.iter().filter(|d| d.to == conn).map(|d| &d.message).collect()
    }

    fn error_text(out: &[Delivery]) -> &str {
        match &out[..] {
            [Delivery { message: Message::Error { message }, .. }] => message.as_str(),
            other => panic!("expected a single error, got {:?}", other),
        }
    }

    #[test]
    fn register_then_pair() {
        let mut reg = registry(PairingPolicy::Reject);
        let out = register(&mut reg, BOOTH, "B1");
        assert_eq!(out, vec![Delivery::new(BOOTH, Message::RegistrationSuccess { booth_id: "B1".into() })]);

        let out = pair(&mut reg, SCANNER, "B1");
        assert_eq!(to(&out, BOOTH), vec![&Message::ScannerConnected { booth_id: "B1".into() }]);
        assert_eq!(to(&out, SCANNER), vec![&Message::ConnectionSuccess { booth_id: "B1".into() }]);
        assert_eq!(reg.paired_booth(SCANNER), Some("B1"));
    }

    #[test]
    fn missing_ids_are_errors() {
        let mut reg = registry(PairingPolicy::Reject);
        let out = reg.handle(BOOTH, Message::RegisterBooth { booth_id: None });
        assert_eq!(error_text(&out), "Missing booth_id in registration");
        let out = register(&mut reg, BOOTH, "  ");
        assert_eq!(error_text(&out), "Missing booth_id in registration");
        let out = reg.handle(SCANNER, Message::ConnectScanner { booth_id: None });
        assert_eq!(error_text(&out), "Missing booth_id for scanner connection");
        assert_eq!(reg.status().active_booths, 0);
    }

    #[test]
    fn unknown_booth_leaves_no_partial_pairing() {
        let mut reg = registry(PairingPolicy::Reject);
        let out = pair(&mut reg, SCANNER, "nope");
        assert_eq!(error_text(&out), "Booth nope is not available");
        assert_eq!(reg.paired_booth(SCANNER), None);
        assert_eq!(reg.status().active_scanners, 0);

        // Still free to take either role afterwards
        let out = register(&mut reg, SCANNER, "B9");
        assert!(matches!(out[0].message, Message::RegistrationSuccess { .. }));
    }

    #[test]
    fn relay_in_both_directions() {
        let mut reg = registry(PairingPolicy::Reject);
        register(&mut reg, BOOTH, "B1");
        pair(&mut reg, SCANNER, "B1");

        let out = reg.handle(SCANNER, Message::relay(json!({"action": "start_session"})));
        assert_eq!(
            out,
            vec![Delivery::new(
                BOOTH,
                Message::MessageFromScanner {
                    data: Some(json!({"action": "start_session"})),
                    original_type: Some("relay_message".into()),
                }
            )]
        );

        let out = reg.handle(BOOTH, Message::relay(json!({"status": "ready"})));
        assert_eq!(
            out,
            vec![Delivery::new(
                SCANNER,
                Message::MessageFromBooth {
                    booth_id: "B1".into(),
                    data: Some(json!({"status": "ready"})),
                    original_type: Some("relay_message".into()),
                }
            )]
        );
    }

    #[test]
    fn relay_errors() {
        let mut reg = registry(PairingPolicy::Reject);
        register(&mut reg, BOOTH, "B1");
        let out = reg.handle(BOOTH, Message::relay(json!(1)));
        assert_eq!(error_text(&out), "No scanner connected");

        let out = reg.handle(OTHER, Message::relay(json!(1)));
        assert_eq!(error_text(&out), "Connection is not registered");

        pair(&mut reg, SCANNER, "B1");
        reg.disconnect(BOOTH);
        let out = reg.handle(SCANNER, Message::relay(json!(1)));
        assert_eq!(error_text(&out), "Booth is no longer available");
    }

    #[test]
    fn ping_has_no_side_effects() {
        let mut reg = registry(PairingPolicy::Reject);
        let before = reg.status();
        assert_eq!(reg.handle(OTHER, Message::Ping), vec![Delivery::new(OTHER, Message::Pong)]);
        assert_eq!(reg.status(), before);
    }

    #[test]
    fn malformed_and_unexpected_messages() {
        let mut reg = registry(PairingPolicy::Reject);
        assert_eq!(error_text(&reg.handle_text(OTHER, "garbage")), "Invalid JSON message");
        assert_eq!(
            error_text(&reg.handle_text(OTHER, r#"{"type":"warp"}"#)),
            "Unknown message type: warp"
        );
        assert_eq!(
            error_text(&reg.handle_text(OTHER, r#"{"type":"pong"}"#)),
            "Unknown message type: pong"
        );
    }

    #[test]
    fn booth_disconnect_notifies_scanner_once() {
        let mut reg = registry(PairingPolicy::Reject);
        register(&mut reg, BOOTH, "B1");
        pair(&mut reg, SCANNER, "B1");

        let out = reg.disconnect(BOOTH);
        assert_eq!(out, vec![Delivery::new(SCANNER, Message::BoothDisconnected { booth_id: "B1".into() })]);
        assert_eq!(reg.paired_booth(SCANNER), None);
        assert!(reg.disconnect(BOOTH).is_empty());
        assert!(reg.disconnect(SCANNER).is_empty());
    }

    #[test]
    fn scanner_disconnect_notifies_booth_once() {
        let mut reg = registry(PairingPolicy::Reject);
        register(&mut reg, BOOTH, "B1");
        pair(&mut reg, SCANNER, "B1");

        let out = reg.disconnect(SCANNER);
        assert_eq!(out, vec![Delivery::new(BOOTH, Message::ScannerDisconnected { booth_id: "B1".into() })]);
        assert_eq!(reg.status().active_scanners, 0);
    }

    #[test]
    fn unpaired_disconnect_is_silent() {
        let mut reg = registry(PairingPolicy::Reject);
        register(&mut reg, BOOTH, "B1");
        assert!(reg.disconnect(OTHER).is_empty());
        assert!(reg.disconnect(BOOTH).is_empty());
        assert_eq!(reg.status().active_booths, 0);
    }

    #[test]
    fn reject_policy_keeps_first_scanner() {
        let mut reg = registry(PairingPolicy::Reject);
        register(&mut reg, BOOTH, "B1");
        pair(&mut reg, SCANNER, "B1");

        let out = pair(&mut reg, OTHER, "B1");
        assert_eq!(error_text(&out), "Booth B1 already has a scanner connected");
        assert_eq!(reg.paired_booth(SCANNER), Some("B1"));
        assert_eq!(reg.paired_booth(OTHER), None);
    }

    #[test]
    fn preempt_policy_replaces_scanner() {
        let mut reg = registry(PairingPolicy::Preempt);
        register(&mut reg, BOOTH, "B1");
        pair(&mut reg, SCANNER, "B1");

        let out = pair(&mut reg, OTHER, "B1");
        assert_eq!(to(&out, SCANNER), vec![&Message::BoothDisconnected { booth_id: "B1".into() }]);
        assert_eq!(
            to(&out, BOOTH),
            vec![
                &Message::ScannerDisconnected { booth_id: "B1".into() },
                &Message::ScannerConnected { booth_id: "B1".into() },
            ]
        );
        assert_eq!(to(&out, OTHER), vec![&Message::ConnectionSuccess { booth_id: "B1".into() }]);
        assert_eq!(reg.paired_booth(SCANNER), None);

        // The preempted scanner closing later is not announced again
        assert!(reg.disconnect(SCANNER).is_empty());
    }

    #[test]
    fn repeated_connect_is_idempotent() {
        let mut reg = registry(PairingPolicy::Reject);
        register(&mut reg, BOOTH, "B1");
        pair(&mut reg, SCANNER, "B1");
        let out = pair(&mut reg, SCANNER, "B1");
        assert_eq!(out, vec![Delivery::new(SCANNER, Message::ConnectionSuccess { booth_id: "B1".into() })]);
    }

    #[test]
    fn switching_booths_releases_old_one() {
        let mut reg = registry(PairingPolicy::Reject);
        register(&mut reg, BOOTH, "B1");
        register(&mut reg, OTHER, "B2");
        pair(&mut reg, SCANNER, "B1");

        let out = pair(&mut reg, SCANNER, "B2");
        assert_eq!(to(&out, BOOTH), vec![&Message::ScannerDisconnected { booth_id: "B1".into() }]);
        assert_eq!(to(&out, OTHER), vec![&Message::ScannerConnected { booth_id: "B2".into() }]);
        assert_eq!(reg.paired_booth(SCANNER), Some("B2"));
    }

    #[test]
    fn role_is_fixed_once_taken() {
        let mut reg = registry(PairingPolicy::Reject);
        register(&mut reg, BOOTH, "B1");
        let out = pair(&mut reg, BOOTH, "B1");
        assert_eq!(error_text(&out), "Connection is already registered as a booth");

        pair(&mut reg, SCANNER, "B1");
        let out = register(&mut reg, SCANNER, "B2");
        assert_eq!(error_text(&out), "Connection is already registered as a scanner");
        assert_eq!(reg.booth_conn("B2"), None);
    }

    #[test]
    fn stale_booth_disconnect_keeps_newer_registration() {
        let mut reg = registry(PairingPolicy::Reject);
        register(&mut reg, BOOTH, "B1");
        pair(&mut reg, SCANNER, "B1");

        // Same identity re-registers from a new socket
        register(&mut reg, OTHER, "B1");
        assert_eq!(reg.booth_conn("B1"), Some(OTHER));

        // The orphaned socket finally closes: nothing changes
        assert!(reg.disconnect(BOOTH).is_empty());
        assert_eq!(reg.booth_conn("B1"), Some(OTHER));
        assert_eq!(reg.paired_booth(SCANNER), Some("B1"));

        // Relays follow the identity to the new socket
        let out = reg.handle(SCANNER, Message::relay(json!("hi")));
        assert_eq!(out[0].to, OTHER);
    }

    #[test]
    fn booth_renaming_releases_old_identity() {
        let mut reg = registry(PairingPolicy::Reject);
        register(&mut reg, BOOTH, "B1");
        pair(&mut reg, SCANNER, "B1");

        let out = register(&mut reg, BOOTH, "B2");
        assert_eq!(to(&out, SCANNER), vec![&Message::BoothDisconnected { booth_id: "B1".into() }]);
        assert_eq!(reg.booth_conn("B1"), None);
        assert_eq!(reg.booth_conn("B2"), Some(BOOTH));
    }

    #[test]
    fn status_counts() {
        let mut reg = registry(PairingPolicy::Reject);
        register(&mut reg, BOOTH, "B2");
        register(&mut reg, OTHER, "B1");
        pair(&mut reg, SCANNER, "B2");

        let status = reg.status();
        assert_eq!(status.active_booths, 2);
        assert_eq!(status.active_scanners, 1);
        assert_eq!(status.total_connections, 3);
        assert_eq!(status.booth_ids, vec!["B1".to_string(), "B2".to_string()]);
    }

    #[test]
    fn pairing_policy_parses() {
        assert_eq!("reject".parse::<PairingPolicy>(), Ok(PairingPolicy::Reject));
        assert_eq!(" Preempt ".parse::<PairingPolicy>(), Ok(PairingPolicy::Preempt));
        assert!("sometimes".parse::<PairingPolicy>().is_err());
    }
}
