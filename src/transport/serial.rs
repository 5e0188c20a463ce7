//! Serial transport.
use std::io::{Read, Write};
use std::time::Duration;

use serialport::SerialPort;

use super::{Error, Result, SerialLine};

const SERIAL_TIMEOUT_MS: u64 = 5000;
const DRAIN_TIMEOUT_MS: u64 = 250;

pub struct SerialTransport {
    serial_port: Box<dyn SerialPort>,
    timeout: Duration,
}

impl SerialTransport {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    /// Open `port` with 8N1 framing at the given baud rate.
    pub fn open(port: &str, baudrate: u32) -> Result<Self> {
        log::info!("Opening serial port: \"{}\" @ {} baud", port, baudrate);
        let timeout = Duration::from_millis(SERIAL_TIMEOUT_MS);
        let serial_port = serialport::new(port, baudrate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(timeout)
            .open()
            .map_err(|e| Error::Open {
                port: port.to_string(),
                reason: e.to_string(),
            })?;
        Ok(SerialTransport {
            serial_port,
            timeout,
        })
    }

    pub fn set_baudrate(&mut self, baudrate: u32) -> Result<()> {
        self.serial_port.set_baud_rate(baudrate)?;
        Ok(())
    }
}

impl SerialLine for SerialTransport {
    fn send(&mut self, buf: &[u8]) -> Result<()> {
        self.serial_port.write_all(buf)?;
        self.serial_port.flush()?;
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<()> {
        self.serial_port.read_exact(buf)?;
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        self.serial_port
            .set_timeout(Duration::from_millis(DRAIN_TIMEOUT_MS))?;
        let mut scratch = [0u8; 64];
        loop {
            match self.serial_port.read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => log::trace!("drained {} byte(s): {}", n, hex::encode(&scratch[..n])),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => {
                    self.serial_port.set_timeout(self.timeout)?;
                    return Err(e.into());
                }
            }
        }
        self.serial_port.set_timeout(self.timeout)?;
        Ok(())
    }

    fn set_dtr_rts(&mut self, level: bool) -> Result<()> {
        self.serial_port.write_data_terminal_ready(level)?;
        self.serial_port.write_request_to_send(level)?;
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        self.serial_port.set_timeout(timeout)?;
        Ok(())
    }
}
