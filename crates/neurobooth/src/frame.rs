//! Sample frame types for the biometric hardware stream

use serde::{Deserialize, Serialize};

/// Number of channels carried by every frame.
pub const CHANNEL_COUNT: usize = 8;

/// One decoded hardware sample across all channels.
///
/// Frames are produced by the [`FrameDecoder`](crate::capture::FrameDecoder)
/// and never mutated afterwards. Channel values are in microvolts, rounded to
/// two decimal places.
///
/// Serialized form (observer channel):
/// ```text
/// {"type":"eeg","timestamp":1712345678.123,"packet_num":42,
///  "channels":[..8 floats..],"status":"streaming"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleFrame {
    /// Monotonically increasing sequence number assigned by the decoder
    pub packet_num: u64,
    /// Wall-clock time in seconds since the Unix epoch
    pub timestamp: f64,
    /// Channel readings in microvolts
    pub channels: [f64; CHANNEL_COUNT],
}

impl SampleFrame {
    /// Create a frame stamped with the current wall-clock time
    pub fn new(packet_num: u64, channels: [f64; CHANNEL_COUNT]) -> Self {
        Self {
            packet_num,
            timestamp: wall_clock_secs(),
            channels,
        }
    }

    /// Set the timestamp and return self (builder pattern)
    #[cfg(test)]
    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Serialize as an observer `eeg` message.
    pub fn to_observer_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&serde_json::json!({
            "type": "eeg",
            "timestamp": self.timestamp,
            "packet_num": self.packet_num,
            "channels": self.channels,
            "status": "streaming",
        }))
    }
}

/// A frame as submitted back by an observer inside an `analyze` request.
///
/// Observers may echo partial or foreign frames, so the channel list is not
/// length-checked here; the analysis engine rejects short batches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmittedFrame {
    #[serde(default)]
    pub packet_num: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub channels: Vec<f64>,
}

impl From<&SampleFrame> for SubmittedFrame {
    fn from(frame: &SampleFrame) -> Self {
        Self {
            packet_num: Some(frame.packet_num),
            timestamp: Some(frame.timestamp),
            channels: frame.channels.to_vec(),
        }
    }
}

/// Transpose a batch of submitted frames into per-channel sample series.
///
/// The number of channels is the smallest channel count across the batch, so
/// a single short frame limits the whole batch. An empty batch has no
/// channels.
pub fn channel_series(frames: &[SubmittedFrame]) -> Vec<Vec<f64>> {
    let width = frames.iter().map(|f| f.channels.len()).min().unwrap_or(0);
    (0..width)
        .map(|ch| frames.iter().map(|f| f.channels[ch]).collect())
        .collect()
}

/// Current wall-clock time in seconds since the Unix epoch
pub(crate) fn wall_clock_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(packet_num: u64, base: f64) -> SampleFrame {
        let mut channels = [0.0; CHANNEL_COUNT];
        for (i, c) in channels.iter_mut().enumerate() {
            *c = base + i as f64;
        }
        SampleFrame::new(packet_num, channels).with_timestamp(100.0)
    }

    #[test]
    fn observer_json_has_expected_shape() {
        let json = frame(7, 1.5).to_observer_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["type"], "eeg");
        assert_eq!(value["packet_num"], 7);
        assert_eq!(value["status"], "streaming");
        assert_eq!(value["timestamp"], 100.0);
        assert_eq!(value["channels"].as_array().unwrap().len(), CHANNEL_COUNT);
        assert_eq!(value["channels"][3], 4.5);
    }

    #[test]
    fn new_frame_is_stamped_with_wall_clock() {
        let f = SampleFrame::new(0, [0.0; CHANNEL_COUNT]);
        // Any time after 2020-01-01
        assert!(f.timestamp > 1_577_836_800.0);
    }

    #[test]
    fn channel_series_transposes_frames() {
        let frames: Vec<SubmittedFrame> = (0..3).map(|i| (&frame(i, i as f64 * 10.0)).into()).collect();
        let series = channel_series(&frames);

        assert_eq!(series.len(), CHANNEL_COUNT);
        assert_eq!(series[0], vec![0.0, 10.0, 20.0]);
        assert_eq!(series[7], vec![7.0, 17.0, 27.0]);
    }

    #[test]
    fn channel_series_limited_by_shortest_frame() {
        let mut frames: Vec<SubmittedFrame> = (0..3).map(|i| (&frame(i, 0.0)).into()).collect();
        frames[1].channels.truncate(5);

        assert_eq!(channel_series(&frames).len(), 5);
    }

    #[test]
    fn channel_series_of_empty_batch_is_empty() {
        assert!(channel_series(&[]).is_empty());
    }

    #[test]
    fn submitted_frame_accepts_missing_fields() {
        let f: SubmittedFrame = serde_json::from_str(r#"{"channels":[1.0,2.0]}"#).unwrap();
        assert_eq!(f.channels, vec![1.0, 2.0]);
        assert!(f.packet_num.is_none());
        assert!(f.timestamp.is_none());
    }
}
