//! Booth session controller
//!
//! Owns the broker connection and the hardware pipeline. Hardware streams
//! only while a scanner is paired: `scanner_connected` starts an
//! [`Acquisition`], `scanner_disconnected` or a lost broker link stops it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::status::{BoothSnapshot, ConnectionStatus};
use super::BoothConfig;
use crate::capture::{Acquisition, SampleQueue, SourceOpener};
use crate::protocol::Message;

/// How often a running acquisition is checked for a device failure
const HARDWARE_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Capabilities advertised in the welcome message
const CAPABILITIES: [&str; 2] = ["eeg_recording", "brain_analysis"];

type BrokerStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type BrokerSink = SplitSink<BrokerStream, WsMessage>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BoothError {
    #[error("Could not connect to broker after {attempts} attempts")]
    ConnectionFailed { attempts: u32 },
}

pub struct BoothController {
    config: BoothConfig,
    opener: Arc<dyn SourceOpener>,
    queue: SampleQueue,
    snapshot: watch::Sender<BoothSnapshot>,
    acquisition: Option<Acquisition>,
}

impl BoothController {
    pub fn new(
        config: BoothConfig,
        opener: Arc<dyn SourceOpener>,
        queue: SampleQueue,
    ) -> (Self, watch::Receiver<BoothSnapshot>) {
        let (snapshot, rx) = watch::channel(BoothSnapshot::new(config.booth_id.clone()));
        let controller = Self {
            config,
            opener,
            queue,
            snapshot,
            acquisition: None,
        };
        (controller, rx)
    }

    /// Connect, register and serve broker messages until the link closes.
    ///
    /// With reconnection enabled a closed link starts a fresh connect cycle.
    /// Returns an error only when every connect attempt failed.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), BoothError> {
        info!(
            booth_id = %self.config.booth_id,
            broker = %self.config.broker_url,
            "Booth controller started"
        );

        let result = loop {
            let stream = match self.connect(&cancel).await {
                Ok(Some(stream)) => stream,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };

            self.session(stream, &cancel).await;
            self.stop_hardware().await;
            self.snapshot.send_modify(|s| {
                s.status.is_connected = false;
                s.status.scanner_connected = false;
                s.status.connection_status = ConnectionStatus::Disconnected;
            });

            if cancel.is_cancelled() || !self.config.reconnect {
                break Ok(());
            }
            info!("Broker link lost, reconnecting");
        };

        self.stop_hardware().await;
        info!(booth_id = %self.config.booth_id, "Booth controller stopped");
        result
    }

    /// Returns `Ok(None)` if cancelled while connecting.
    async fn connect(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<BrokerStream>, BoothError> {
        let attempts = self.config.connect_attempts.max(1);

        for attempt in 1..=attempts {
            self.set_status(ConnectionStatus::Connecting);
            info!(attempt, url = %self.config.broker_url, "Connecting to broker");

            let result = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                r = tokio_tungstenite::connect_async(self.config.broker_url.as_str()) => r,
            };
            match result {
                Ok((stream, _response)) => return Ok(Some(stream)),
                Err(e) => warn!(attempt, attempts, "Broker connection failed: {}", e),
            }

            if attempt < attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(self.config.retry_delay) => {}
                }
            }
        }

        error!(attempts, "Giving up on broker connection");
        self.set_status(ConnectionStatus::ConnectionFailed);
        Err(BoothError::ConnectionFailed { attempts })
    }

    async fn session(&mut self, stream: BrokerStream, cancel: &CancellationToken) {
        let (mut ws_tx, mut ws_rx) = stream.split();

        let register = Message::RegisterBooth {
            booth_id: Some(self.config.booth_id.clone()),
        };
        if let Err(e) = send(&mut ws_tx, &register).await {
            warn!("Failed to send registration: {:#}", e);
            return;
        }
        info!(booth_id = %self.config.booth_id, "Registration sent");
        self.snapshot.send_modify(|s| {
            s.status.is_connected = true;
            s.status.connection_status = ConnectionStatus::Connected;
        });

        let mut health = tokio::time::interval(HARDWARE_CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
                _ = health.tick() => self.reap_halted_hardware().await,
                incoming = ws_rx.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        for reply in self.handle_text(text.as_str()).await {
                            if let Err(e) = send(&mut ws_tx, &reply).await {
                                warn!(kind = reply.kind(), "Failed to send to broker: {:#}", e);
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!("Broker closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Broker connection error: {}", e);
                        break;
                    }
                },
            }
        }
    }

    async fn handle_text(&mut self, text: &str) -> Vec<Message> {
        match Message::parse(text) {
            Ok(message) => self.handle(message).await,
            Err(e) => {
                warn!("Ignoring message from broker: {}", e);
                Vec::new()
            }
        }
    }

    /// Apply one broker message; returns the replies to send back.
    pub(crate) async fn handle(&mut self, message: Message) -> Vec<Message> {
        match message {
            Message::RegistrationSuccess { booth_id } => {
                info!(booth_id = %booth_id, "Booth registered");
                self.set_status(ConnectionStatus::Registered);
                Vec::new()
            }
            Message::ScannerConnected { .. } => {
                info!("Scanner connected");
                self.snapshot.send_modify(|s| {
                    s.status.scanner_connected = true;
                    s.status.connection_status = ConnectionStatus::UserConnected;
                });
                self.start_hardware().await;
                vec![Message::relay(self.welcome())]
            }
            Message::ScannerDisconnected { .. } => {
                info!("Scanner disconnected");
                self.snapshot.send_modify(|s| {
                    s.status.scanner_connected = false;
                    s.status.connection_status = ConnectionStatus::Registered;
                });
                self.stop_hardware().await;
                Vec::new()
            }
            Message::MessageFromScanner { data, .. } => self.handle_scanner(data),
            Message::Error { message } => {
                error!(%message, "Error from broker");
                if !self.status().is_registered() {
                    self.set_status(ConnectionStatus::Error);
                }
                Vec::new()
            }
            other => {
                debug!(kind = other.kind(), "Ignoring broker message");
                Vec::new()
            }
        }
    }

    fn handle_scanner(&mut self, data: Option<Value>) -> Vec<Message> {
        let action = data
            .as_ref()
            .and_then(|d| d.get("action"))
            .and_then(Value::as_str);

        match action {
            Some("start_session") => {
                let session_id = format!("session_{:08x}", rand::random::<u32>());
                info!(%session_id, "EEG session started");
                vec![Message::relay(json!({
                    "message": "EEG session started",
                    "status": "recording",
                    "session_id": session_id,
                }))]
            }
            Some("connection_established") => {
                info!("Scanner confirmed connection");
                if self.snapshot.borrow().status.scanner_connected {
                    self.set_status(ConnectionStatus::UserConnected);
                }
                vec![Message::relay(json!({
                    "message": "Connection confirmed",
                    "status": "booth_ready",
                    "next_steps": "Please wait for EEG setup instructions",
                }))]
            }
            other => {
                debug!(action = ?other, "Unhandled scanner message");
                Vec::new()
            }
        }
    }

    fn welcome(&self) -> Value {
        let id = &self.config.booth_id;
        json!({
            "message": format!("Welcome to Booth {}!", id),
            "status": "ready",
            "booth_info": {
                "name": format!("EEG Booth {}", id),
                "capabilities": CAPABILITIES,
            },
        })
    }

    async fn start_hardware(&mut self) {
        if self.acquisition.is_some() {
            return;
        }
        let opener = Arc::clone(&self.opener);
        let config = self.config.acquisition.clone();
        let queue = self.queue.clone();

        let started =
            tokio::task::spawn_blocking(move || Acquisition::start(opener.as_ref(), &config, queue))
                .await;
        match started {
            Ok(Ok(acquisition)) => {
                self.acquisition = Some(acquisition);
                self.snapshot.send_modify(|s| s.eeg_streaming = true);
            }
            Ok(Err(e)) => error!("Failed to start EEG acquisition: {:#}", e),
            Err(e) => error!("EEG start task failed: {}", e),
        }
    }

    async fn stop_hardware(&mut self) {
        let Some(acquisition) = self.acquisition.take() else {
            return;
        };
        if let Err(e) = tokio::task::spawn_blocking(move || acquisition.join()).await {
            error!("EEG stop task failed: {}", e);
        }
        self.snapshot.send_modify(|s| s.eeg_streaming = false);
    }

    /// Release the device if the acquisition thread stopped on its own
    async fn reap_halted_hardware(&mut self) {
        if self.acquisition.as_ref().is_some_and(|a| !a.is_running()) {
            warn!("EEG acquisition halted, streaming stays off until the next pairing");
            self.stop_hardware().await;
        }
    }

    fn status(&self) -> ConnectionStatus {
        self.snapshot.borrow().status.connection_status
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.snapshot
            .send_modify(|s| s.status.connection_status = status);
    }
}

async fn send(ws_tx: &mut BrokerSink, message: &Message) -> anyhow::Result<()> {
    let text = message.encode().context("Failed to encode message")?;
    ws_tx
        .send(WsMessage::Text(text.into()))
        .await
        .context("WebSocket send failed")
}
