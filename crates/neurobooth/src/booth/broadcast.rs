//! Sample fan-out to local observers
//!
//! One task drains the [`SampleDrain`] on a fixed tick, serializes each frame
//! once and offers it to every attached observer. An observer that falls
//! behind misses frames; one whose receiver is gone is detached. Neither
//! affects the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::SampleDrain;

/// Drain period, roughly 100 Hz
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_millis(10);

/// Frames buffered per observer before it starts missing some
pub const OBSERVER_BUFFER: usize = 256;

pub type ObserverId = u64;

enum Control {
    Attach {
        id: ObserverId,
        tx: mpsc::Sender<Utf8Bytes>,
    },
    Detach {
        id: ObserverId,
    },
}

/// Handle for attaching observers. Cheap to clone.
#[derive(Clone)]
pub struct BroadcastHandle {
    control: mpsc::UnboundedSender<Control>,
    next_id: Arc<AtomicU64>,
    observers: watch::Receiver<usize>,
}

impl BroadcastHandle {
    /// Attach a new observer. Returns `None` if the broadcaster has stopped.
    pub fn attach(&self) -> Option<(ObserverId, mpsc::Receiver<Utf8Bytes>)> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OBSERVER_BUFFER);
        self.control.send(Control::Attach { id, tx }).ok()?;
        Some((id, rx))
    }

    pub fn detach(&self, id: ObserverId) {
        let _ = self.control.send(Control::Detach { id });
    }

    /// Number of observers currently attached
    pub fn observer_count(&self) -> usize {
        *self.observers.borrow()
    }
}

pub struct Broadcaster {
    drain: SampleDrain,
    interval: Duration,
    observers: HashMap<ObserverId, mpsc::Sender<Utf8Bytes>>,
    control: mpsc::UnboundedReceiver<Control>,
    count_tx: watch::Sender<usize>,
    frames_sent: u64,
}

impl Broadcaster {
    pub fn new(drain: SampleDrain, interval: Duration) -> (Self, BroadcastHandle) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (count_tx, count_rx) = watch::channel(0);
        let broadcaster = Self {
            drain,
            interval,
            observers: HashMap::new(),
            control: control_rx,
            count_tx,
            frames_sent: 0,
        };
        let handle = BroadcastHandle {
            control: control_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            observers: count_rx,
        };
        (broadcaster, handle)
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                ctrl = self.control.recv() => match ctrl {
                    Some(ctrl) => self.apply(ctrl),
                    None => break,
                },
                _ = tick.tick() => self.fan_out(),
            }
        }
        info!(frames_sent = self.frames_sent, "Broadcaster stopped");
    }

    fn apply(&mut self, ctrl: Control) {
        match ctrl {
            Control::Attach { id, tx } => {
                self.observers.insert(id, tx);
                info!(observer = id, total = self.observers.len(), "Observer attached");
            }
            Control::Detach { id } => {
                if self.observers.remove(&id).is_some() {
                    info!(observer = id, total = self.observers.len(), "Observer detached");
                }
            }
        }
        self.count_tx.send_replace(self.observers.len());
    }

    fn fan_out(&mut self) {
        let frames = self.drain.drain();
        if frames.is_empty() || self.observers.is_empty() {
            return;
        }

        let mut gone = Vec::new();
        for frame in &frames {
            let json = match frame.to_observer_json() {
                Ok(json) => Utf8Bytes::from(json),
                Err(e) => {
                    warn!(packet = frame.packet_num, "Failed to encode frame: {}", e);
                    continue;
                }
            };
            for (id, tx) in &self.observers {
                match tx.try_send(json.clone()) {
                    Ok(()) => self.frames_sent += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(
                            observer = id,
                            packet = frame.packet_num,
                            "Observer lagging, frame skipped"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        if !gone.contains(id) {
                            gone.push(*id);
                        }
                    }
                }
            }
        }

        if !gone.is_empty() {
            for id in gone {
                self.observers.remove(&id);
                debug!(observer = id, "Removed closed observer");
            }
            self.count_tx.send_replace(self.observers.len());
        }
    }
}

/// Spawn a broadcaster on the current runtime
pub fn spawn(drain: SampleDrain, cancel: CancellationToken) -> BroadcastHandle {
    let (broadcaster, handle) = Broadcaster::new(drain, DEFAULT_DRAIN_INTERVAL);
    tokio::spawn(broadcaster.run(cancel));
    handle
}
