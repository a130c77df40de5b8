//! Bounded sample queue between the acquisition thread and observers
//!
//! The producer side never blocks: when the queue is full the new frame is
//! dropped and counted. Frames individually carry little value, so losing
//! the newest one is preferable to stalling the serial reader.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::frame::SampleFrame;

/// Default number of frames held before new ones are dropped
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Log a drop warning once per this many dropped frames
const DROP_LOG_INTERVAL: u64 = 250;

/// Producer half of the sample queue. Cheap to clone.
#[derive(Clone)]
pub struct SampleQueue {
    tx: mpsc::Sender<SampleFrame>,
    dropped: Arc<AtomicU64>,
}

/// Consumer half of the sample queue
pub struct SampleDrain {
    rx: mpsc::Receiver<SampleFrame>,
}

/// Create a queue holding at most `capacity` frames.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn sample_queue(capacity: usize) -> (SampleQueue, SampleDrain) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        SampleQueue {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        SampleDrain { rx },
    )
}

impl SampleQueue {
    /// Enqueue a frame without blocking.
    ///
    /// Returns `false` if the frame was dropped because the queue is full or
    /// the consumer is gone.
    pub fn push(&self, frame: SampleFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(packet = frame.packet_num, "Sample queue full, dropping frame");
                if dropped % DROP_LOG_INTERVAL == 1 {
                    warn!(dropped, "Sample queue overflowing");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Frames currently waiting to be drained
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of frames the queue holds
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Total frames dropped since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl SampleDrain {
    /// Take every frame currently queued, oldest first.
    pub fn drain(&mut self) -> Vec<SampleFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(frame);
        }
        frames
    }
}
