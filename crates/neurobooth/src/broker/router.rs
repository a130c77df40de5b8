//! Broker task
//!
//! A single task owns the [`Registry`] and the outbox of every connection.
//! Connection handlers talk to it through [`BrokerHandle`]; commands from one
//! connection are applied in the order they were sent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::{BrokerStatus, ConnId, Delivery, PairingPolicy, Registry};
use crate::protocol::Message;

/// Sending half of a connection's outgoing queue
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Message>,
}

impl Outbox {
    /// Create an outbox holding at most `capacity` undelivered messages
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue `message` without waiting.
    ///
    /// Returns `false` if the connection is gone or too far behind.
    pub fn deliver(&self, message: Message) -> bool {
        self.tx.try_send(message).is_ok()
    }

    /// Whether the connection side has hung up
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

enum Command {
    Connect { conn: ConnId, outbox: Outbox },
    Inbound { conn: ConnId, text: String },
    Disconnect { conn: ConnId },
    Status { reply: oneshot::Sender<BrokerStatus> },
}

/// Cheap, cloneable handle to the broker task
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<Command>,
    next_conn: Arc<AtomicU64>,
}

impl BrokerHandle {
    /// Register a new connection and get its id.
    ///
    /// Returns `None` once the broker task has stopped.
    pub async fn connect(&self, outbox: Outbox) -> Option<ConnId> {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(Command::Connect { conn, outbox })
            .await
            .ok()
            .map(|_| conn)
    }

    /// Hand a received text frame to the broker
    pub async fn inbound(&self, conn: ConnId, text: String) -> bool {
        self.tx.send(Command::Inbound { conn, text }).await.is_ok()
    }

    pub async fn disconnect(&self, conn: ConnId) {
        let _ = self.tx.send(Command::Disconnect { conn }).await;
    }

    /// Snapshot of the registry
    pub async fn status(&self) -> Option<BrokerStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Status { reply }).await.ok()?;
        rx.await.ok()
    }
}

/// The broker task state
pub struct Broker {
    registry: Registry,
    outboxes: HashMap<ConnId, Outbox>,
    rx: mpsc::Receiver<Command>,
}

impl Broker {
    /// Create the broker and a handle to it. Nothing runs until [`Broker::run`].
    pub fn new(policy: PairingPolicy, command_capacity: usize) -> (Self, BrokerHandle) {
        let (tx, rx) = mpsc::channel(command_capacity.max(1));
        let broker = Self {
            registry: Registry::new(policy),
            outboxes: HashMap::new(),
            rx,
        };
        let handle = BrokerHandle {
            tx,
            next_conn: Arc::new(AtomicU64::new(1)),
        };
        (broker, handle)
    }

    /// Process commands until cancelled or every handle is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(policy = ?self.registry.policy(), "Broker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.apply(cmd),
                    None => break,
                },
            }
        }
        info!("Broker stopped");
    }

    fn apply(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { conn, outbox } => {
                self.outboxes.insert(conn, outbox);
                self.registry.connect(conn);
            }
            Command::Inbound { conn, text } => {
                let deliveries = self.registry.handle_text(conn, &text);
                self.dispatch(deliveries);
            }
            Command::Disconnect { conn } => {
                self.outboxes.remove(&conn);
                let deliveries = self.registry.disconnect(conn);
                self.dispatch(deliveries);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.registry.status());
            }
        }
    }

    /// Queue each delivery on its outbox.
    ///
    /// A connection whose outbox is full loses its outbox. Its socket task
    /// then sees the channel close, shuts the socket and reports the
    /// disconnect, which releases its pairing and tells the peer once.
    fn dispatch(&mut self, deliveries: Vec<Delivery>) {
        for Delivery { to, message } in deliveries {
            let kind = message.kind();
            let Some(outbox) = self.outboxes.get(&to) else {
                debug!(conn = to, kind, "Dropped message for closed connection");
                continue;
            };
            if outbox.deliver(message) {
                continue;
            }
            // Closing is permanent, so an open outbox that refused was full
            if outbox.is_closed() {
                debug!(conn = to, kind, "Dropped message for closed connection");
            } else {
                warn!(conn = to, kind, "Outbox full, closing connection");
                self.outboxes.remove(&to);
            }
        }
    }
}

/// Spawn the broker task on the current runtime
pub fn spawn(
    policy: PairingPolicy,
    command_capacity: usize,
    cancel: CancellationToken,
) -> BrokerHandle {
    let (broker, handle) = Broker::new(policy, command_capacity);
    tokio::spawn(broker.run(cancel));
    handle
}
