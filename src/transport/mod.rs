//! Abstract transport interfaces.
//!
//! Drivers never talk to `serialport` or `rusb` directly; they are generic
//! over the small traits below so the protocol logic can be exercised
//! against mock endpoints in tests.

use std::time::Duration;

pub use self::serial::SerialTransport;
pub use self::usb::UsbDevice;

mod serial;
mod usb;

/// Transport-level failures, distinguishable from protocol errors above.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("cannot open {port}: {reason}")]
    Open { port: String, reason: String },
    #[error("USB device {vid:04x}:{pid:04x} not found")]
    UsbNotFound { vid: u16, pid: u16 },
    #[error("serial port error")]
    Serial(#[from] serialport::Error),
    #[error("USB error")]
    Usb(#[from] rusb::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("short transfer: expected {expected} bytes, got {got}")]
    ShortTransfer { expected: usize, got: usize },
}

impl Error {
    /// Distinguish a wire timeout from other transport failures; write
    /// polling needs to tell them apart.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            Error::Usb(rusb::Error::Timeout) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A byte-stream endpoint: a serial tty, or a mock of one in tests.
pub trait SerialLine {
    fn send(&mut self, buf: &[u8]) -> Result<()>;

    /// Receive exactly `buf.len()` bytes or fail.
    fn recv(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Discard pending input until the line goes quiet.
    fn drain(&mut self) -> Result<()>;

    /// Drive both modem-control lines (DTR and RTS) to `level`.
    fn set_dtr_rts(&mut self, level: bool) -> Result<()>;

    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;
}

/// A USB endpoint speaking vendor control requests (USBasp).
pub trait VendorControl {
    fn control_in(&mut self, request: u8, value: u16, index: u16, buf: &mut [u8]) -> Result<usize>;

    fn control_out(&mut self, request: u8, value: u16, index: u16, buf: &[u8]) -> Result<usize>;
}

/// A USB endpoint speaking bulk transfers (CH341A).
pub trait BulkPipe {
    fn write_bulk(&mut self, buf: &[u8]) -> Result<usize>;

    fn read_bulk(&mut self, buf: &mut [u8]) -> Result<usize>;
}
