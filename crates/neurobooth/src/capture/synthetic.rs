//! Synthetic board for running the booth without hardware
//!
//! Emits well-formed packets at the configured sample rate. Each channel is
//! a sum of a few sine components (alpha on the frontal pair, beta elsewhere)
//! plus a little deterministic jitter, which is enough to exercise the
//! decoder, the fan-out path and the analysis engine.

use std::f64::consts::TAU;
use std::io;
use std::time::Instant;

use anyhow::Result;

use super::decoder::{encode_packet, DEFAULT_SCALE_UV};
use super::device::{command, ByteSource, SourceOpener};
use crate::frame::CHANNEL_COUNT;

/// Opens a [`SyntheticBoard`]
#[derive(Debug, Clone)]
pub struct SyntheticOpener {
    pub sample_rate: u32,
}

impl SourceOpener for SyntheticOpener {
    fn open(&self) -> Result<Box<dyn ByteSource>> {
        Ok(Box::new(SyntheticBoard::new(self.sample_rate)))
    }

    fn port_name(&self) -> String {
        "synthetic".to_string()
    }
}

/// Generates packets in real time once streaming is started
pub struct SyntheticBoard {
    sample_rate: u32,
    streaming: bool,
    started: Instant,
    emitted: u64,
    pending: Vec<u8>,
}

impl SyntheticBoard {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            streaming: false,
            started: Instant::now(),
            emitted: 0,
            pending: Vec::new(),
        }
    }

    fn sample_counts(&self, n: u64) -> [i32; CHANNEL_COUNT] {
        let t = n as f64 / self.sample_rate as f64;
        let mut counts = [0i32; CHANNEL_COUNT];
        for (ch, count) in counts.iter_mut().enumerate() {
            let (freq, amp_uv) = if ch < 2 { (10.0, 20.0 + ch as f64 * 5.0) } else { (20.0, 8.0) };
            let jitter = ((n.wrapping_mul(2654435761).wrapping_add(ch as u64 * 97)) % 200) as f64 / 100.0 - 1.0;
            let uv = amp_uv * (TAU * freq * t).sin() + 4.0 * (TAU * 2.0 * t).sin() + jitter;
            *count = (uv / DEFAULT_SCALE_UV).round() as i32;
        }
        counts
    }
}

impl ByteSource for SyntheticBoard {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.streaming {
            let due = (self.started.elapsed().as_secs_f64() * self.sample_rate as f64) as u64;
            while self.emitted < due && self.pending.len() < buf.len() {
                let packet = encode_packet(self.emitted as u8, &self.sample_counts(self.emitted));
                self.pending.extend_from_slice(&packet);
                self.emitted += 1;
            }
        }

        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    fn write_command(&mut self, cmd: u8) -> io::Result<()> {
        match cmd {
            command::START_STREAM => {
                self.streaming = true;
                self.started = Instant::now();
                self.emitted = 0;
            }
            command::STOP_STREAM | command::SOFT_RESET => {
                self.streaming = false;
                self.pending.clear();
            }
            _ => {}
        }
        Ok(())
    }
}
