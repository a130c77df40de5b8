//! Streaming decoder for the board's 33-byte sample packets
//!
//! Packet layout:
//! ```text
//! ┌────────┬─────────┬──────────────────────────┬────────────┬────────┐
//! │ 0xA0   │ counter │ 8 × 24-bit BE channels   │ aux (6 B)  │ 0xC0   │
//! │ 1 byte │ 1 byte  │ 24 bytes                 │            │ 1 byte │
//! └────────┴─────────┴──────────────────────────┴────────────┴────────┘
//! ```
//!
//! The decoder accepts arbitrarily sized chunks. Bytes that do not form a
//! valid packet are skipped by searching for the next start marker, so
//! dropped or corrupted bytes cost at most the packet they hit.

use bytes::{Buf, BytesMut};

use crate::frame::{SampleFrame, CHANNEL_COUNT};

/// First byte of every packet
pub const START_MARKER: u8 = 0xA0;
/// Last byte of every packet
pub const END_MARKER: u8 = 0xC0;
/// Total packet length including both markers
pub const PACKET_SIZE: usize = 33;
/// Offset of the first channel sample inside a packet
pub const CHANNEL_OFFSET: usize = 2;
/// Width of one channel sample in bytes (24-bit)
pub const SAMPLE_WIDTH: usize = 3;
/// Buffer length beyond which marker-less input is discarded
pub const MAX_UNSYNCED_BYTES: usize = 1024;

/// Microvolts per count for the default front end:
/// 4.5 V reference, gain 24, 24-bit signed range.
pub const DEFAULT_SCALE_UV: f64 = 4.5 / 24.0 / ((1u32 << 23) - 1) as f64 * 1_000_000.0;

/// Sign-extend a 24-bit big-endian two's-complement sample.
pub fn decode_sample(bytes: [u8; SAMPLE_WIDTH]) -> i32 {
    let raw = ((bytes[0] as i32) << 16) | ((bytes[1] as i32) << 8) | bytes[2] as i32;
    if bytes[0] & 0x80 != 0 {
        raw - (1 << 24)
    } else {
        raw
    }
}

/// Incremental packet decoder.
///
/// Holds partial packets between calls to [`feed`](Self::feed) and numbers
/// emitted frames with a monotonically increasing counter.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    scale_uv: f64,
    next_packet: u64,
    packets_skipped: u64,
}

impl FrameDecoder {
    /// Create a decoder converting counts to microvolts with `scale_uv`
    pub fn new(scale_uv: f64) -> Self {
        Self {
            buffer: BytesMut::with_capacity(PACKET_SIZE * 4),
            scale_uv,
            next_packet: 0,
            packets_skipped: 0,
        }
    }

    /// Append a chunk and return every frame it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SampleFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while self.buffer.len() >= PACKET_SIZE {
            let Some(start) = self.buffer.iter().position(|&b| b == START_MARKER) else {
                if self.buffer.len() > MAX_UNSYNCED_BYTES {
                    let excess = self.buffer.len() - PACKET_SIZE;
                    self.buffer.advance(excess);
                }
                break;
            };

            if start + PACKET_SIZE > self.buffer.len() {
                // Wait for the rest of this candidate packet
                self.buffer.advance(start);
                break;
            }

            if self.buffer[start + PACKET_SIZE - 1] == END_MARKER {
                let packet = self.buffer[start..start + PACKET_SIZE].to_vec();
                self.buffer.advance(start + PACKET_SIZE);
                frames.push(self.parse_packet(&packet));
            } else {
                // False start marker: skip past it and resynchronize
                self.buffer.advance(start + 1);
                self.packets_skipped += 1;
            }
        }

        frames
    }

    /// Bytes currently held waiting for a complete packet
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Number of start markers rejected during resynchronization
    pub fn packets_skipped(&self) -> u64 {
        self.packets_skipped
    }

    fn parse_packet(&mut self, packet: &[u8]) -> SampleFrame {
        let mut channels = [0.0; CHANNEL_COUNT];
        for (ch, value) in channels.iter_mut().enumerate() {
            let at = CHANNEL_OFFSET + ch * SAMPLE_WIDTH;
            let counts = decode_sample([packet[at], packet[at + 1], packet[at + 2]]);
            *value = round_centi(counts as f64 * self.scale_uv);
        }

        let packet_num = self.next_packet;
        self.next_packet += 1;
        SampleFrame::new(packet_num, channels)
    }
}

fn round_centi(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Build a well-formed packet from raw channel counts.
///
/// Counts are truncated to 24 bits. Used by the synthetic source and tests.
pub fn encode_packet(counter: u8, counts: &[i32; CHANNEL_COUNT]) -> [u8; PACKET_SIZE] {
    let mut packet = [0u8; PACKET_SIZE];
    packet[0] = START_MARKER;
    packet[1] = counter;
    for (ch, &count) in counts.iter().enumerate() {
        let at = CHANNEL_OFFSET + ch * SAMPLE_WIDTH;
        let bits = (count as u32) & 0x00FF_FFFF;
        packet[at] = (bits >> 16) as u8;
        packet[at + 1] = (bits >> 8) as u8;
        packet[at + 2] = bits as u8;
    }
    packet[PACKET_SIZE - 1] = END_MARKER;
    packet
}
