//! Hardware acquisition thread
//!
//! One streaming session per [`Acquisition`]: the device is opened in
//! [`Acquisition::start`], commanded into streaming mode, and polled from a
//! dedicated OS thread that feeds the [`FrameDecoder`] and pushes frames into
//! the [`SampleQueue`]. Stopping halts the board, closes the device and
//! discards any partially buffered bytes.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use super::decoder::{FrameDecoder, DEFAULT_SCALE_UV};
use super::device::{command, ByteSource, SourceOpener};
use super::queue::SampleQueue;

/// Acquisition settings
#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    /// Microvolts per ADC count
    pub scale_uv: f64,
    /// Sleep between polls when no bytes are waiting
    pub poll_interval: Duration,
    /// Pause after each start-up command so the board can settle
    pub command_settle: Duration,
    /// Size of the per-read scratch buffer
    pub read_buffer: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            scale_uv: DEFAULT_SCALE_UV,
            poll_interval: Duration::from_millis(1),
            command_settle: Duration::from_millis(100),
            read_buffer: 4096,
        }
    }
}

/// Handle to a running acquisition thread.
///
/// Dropping the handle signals the thread to stop without waiting for it.
pub struct Acquisition {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    port: String,
}

impl Acquisition {
    /// Open the device and start streaming into `queue`.
    pub fn start(
        opener: &dyn SourceOpener,
        config: &AcquisitionConfig,
        queue: SampleQueue,
    ) -> Result<Self> {
        let port = opener.port_name();
        let source = opener
            .open()
            .with_context(|| format!("Failed to open EEG device at {}", port))?;

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();
        let config = config.clone();

        let handle = std::thread::Builder::new()
            .name("acquisition".into())
            .spawn(move || run_acquisition(source, config, queue, thread_running))
            .context("Failed to spawn acquisition thread")?;

        info!(port = %port, "EEG acquisition started");
        Ok(Self {
            running,
            handle: Some(handle),
            port,
        })
    }

    /// Whether the thread is still streaming
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Signal the thread to stop. Returns immediately.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Stop and wait for the thread to release the device.
    pub fn join(mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(port = %self.port, "Acquisition thread panicked");
            }
        }
        info!(port = %self.port, "EEG acquisition stopped");
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_acquisition(
    mut source: Box<dyn ByteSource>,
    config: AcquisitionConfig,
    queue: SampleQueue,
    running: Arc<AtomicBool>,
) {
    for &cmd in command::START_SEQUENCE.iter() {
        if let Err(e) = source.write_command(cmd) {
            let command = cmd as char;
            error!(%command, "Failed to send board command: {}", e);
            running.store(false, Ordering::Release);
            return;
        }
        std::thread::sleep(config.command_settle);
        if !running.load(Ordering::Acquire) {
            break;
        }
    }

    let mut decoder = FrameDecoder::new(config.scale_uv);
    let mut buf = vec![0u8; config.read_buffer.max(1)];
    let mut frames_decoded: u64 = 0;

    while running.load(Ordering::Acquire) {
        match source.read_available(&mut buf) {
            Ok(0) => std::thread::sleep(config.poll_interval),
            Ok(n) => {
                for frame in decoder.feed(&buf[..n]) {
                    queue.push(frame);
                    frames_decoded += 1;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("EEG device read failed, halting acquisition: {}", e);
                break;
            }
        }
    }

    running.store(false, Ordering::Release);
    if let Err(e) = source.write_command(command::STOP_STREAM) {
        warn!("Failed to halt board stream: {}", e);
    }
    debug!(
        frames_decoded,
        packets_skipped = decoder.packets_skipped(),
        discarded_bytes = decoder.buffered(),
        "Acquisition thread exiting"
    );
}
