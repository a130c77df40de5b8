//! Hardware byte sources
//!
//! The acquisition thread talks to the board through [`ByteSource`], so the
//! decoder pipeline runs the same against a serial port, the synthetic
//! board, or a scripted source in tests.

use std::io;

use anyhow::Result;

/// Single-byte board commands
pub mod command {
    /// Halt streaming
    pub const STOP_STREAM: u8 = b's';
    /// Soft reset of the board
    pub const SOFT_RESET: u8 = b'v';
    /// Begin streaming packets
    pub const START_STREAM: u8 = b'b';

    /// Sequence sent when a streaming session starts
    pub const START_SEQUENCE: [u8; 3] = [STOP_STREAM, SOFT_RESET, START_STREAM];
}

/// Default serial line speed
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// A non-blocking source of raw board bytes.
pub trait ByteSource: Send {
    /// Read whatever bytes are available into `buf`.
    ///
    /// Returns `Ok(0)` when nothing is available yet; callers poll again
    /// after a short sleep.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send a command to the board
    fn write_command(&mut self, command: u8) -> io::Result<()>;
}

/// Opens a fresh [`ByteSource`] for each streaming session.
pub trait SourceOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn ByteSource>>;

    /// Human-readable device location (e.g. `/dev/ttyUSB0`)
    fn port_name(&self) -> String;
}

#[cfg(feature = "serial")]
pub use serial::{SerialDevice, SerialOpener};

#[cfg(feature = "serial")]
mod serial {
    use std::io::{self, Read, Write};
    use std::time::Duration;

    use anyhow::{Context, Result};
    use tracing::info;

    use super::{ByteSource, SourceOpener};

    /// Read timeout for the underlying port
    const READ_TIMEOUT: Duration = Duration::from_millis(10);

    /// Opens the board's serial port
    #[derive(Debug, Clone)]
    pub struct SerialOpener {
        pub path: String,
        pub baud_rate: u32,
    }

    impl SerialOpener {
        pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
            Self {
                path: path.into(),
                baud_rate,
            }
        }
    }

    impl SourceOpener for SerialOpener {
        fn open(&self) -> Result<Box<dyn ByteSource>> {
            let port = serialport::new(&self.path, self.baud_rate)
                .timeout(READ_TIMEOUT)
                .open()
                .with_context(|| format!("Failed to open serial port {}", self.path))?;
            info!(port = %self.path, baud = self.baud_rate, "Serial port opened");
            Ok(Box::new(SerialDevice { port }))
        }

        fn port_name(&self) -> String {
            self.path.clone()
        }
    }

    /// An open serial port. Closed when dropped.
    pub struct SerialDevice {
        port: Box<dyn serialport::SerialPort>,
    }

    impl ByteSource for SerialDevice {
        fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let pending = self.port.bytes_to_read().map_err(io::Error::from)? as usize;
            if pending == 0 {
                return Ok(0);
            }
            let want = pending.min(buf.len());
            match self.port.read(&mut buf[..want]) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
                Err(e) => Err(e),
            }
        }

        fn write_command(&mut self, command: u8) -> io::Result<()> {
            self.port.write_all(&[command])?;
            self.port.flush()
        }
    }
}
