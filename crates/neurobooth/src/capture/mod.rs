//! EEG capture pipeline
//!
//! Bytes flow from a [`ByteSource`] through the [`FrameDecoder`] on the
//! acquisition thread and into the bounded [`SampleQueue`]:
//! - `device`: byte-source traits, board commands, serial port backend
//! - `decoder`: packet framing and 24-bit sample scaling
//! - `queue`: non-blocking bounded hand-off to the async side
//! - `acquisition`: the polling thread tying the three together

pub mod acquisition;
pub mod decoder;
pub mod device;
pub mod queue;
#[cfg(feature = "test-source")]
pub mod synthetic;

pub use acquisition::{Acquisition, AcquisitionConfig};
pub use decoder::{decode_sample, encode_packet, FrameDecoder, DEFAULT_SCALE_UV, PACKET_SIZE};
pub use device::{command, ByteSource, SourceOpener, DEFAULT_BAUD_RATE};
pub use queue::{sample_queue, SampleDrain, SampleQueue, DEFAULT_QUEUE_CAPACITY};

#[cfg(feature = "serial")]
pub use device::{SerialDevice, SerialOpener};
#[cfg(feature = "test-source")]
pub use synthetic::{SyntheticBoard, SyntheticOpener};
