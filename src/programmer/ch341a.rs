//! CH341A driver: a USB-SPI bridge that shifts LSB first.
//!
//! Every MOSI byte is bit-reversed before it enters the `SPI_STREAM`
//! packet and every MISO byte reversed again on the way out. The target's
//! RESET line hangs off UIO pin 0, driven by a tiny micro-program over
//! `UIO_STREAM`. Paged I/O rides the generic bytewise path.

use crate::part::Part;
use crate::transport::BulkPipe;

use super::{Error, Programmer, Result, chip_erase_default, program_enable_default, usleep};

pub const CH341A_VID: u16 = 0x1a86;
pub const CH341A_PID: u16 = 0x5512;

pub const CH341A_BULK_OUT: u8 = 0x02;
pub const CH341A_BULK_IN: u8 = 0x82;

const PACKET_LENGTH: usize = 32;

const CMD_SPI_STREAM: u8 = 0xa8;
const CMD_UIO_STREAM: u8 = 0xab;

const UIO_STM_DIR: u8 = 0x40;
const UIO_STM_OUT: u8 = 0x80;
const UIO_STM_END: u8 = 0x20;

pub struct Ch341a<D: BulkPipe> {
    dev: D,
}

impl<D: BulkPipe> Ch341a<D> {
    pub fn new(dev: D) -> Self {
        Ch341a { dev }
    }

    /// Drive chip select `cs` (wired to the target's RESET). UIO bits
    /// 0..=2 are the selects, 3 is SCK, 5 is MOSI; 0x37 idles them high.
    fn chip_select(&mut self, cs: u8, enable: bool) -> Result<()> {
        if cs > 2 {
            return Err(Error::InvalidParameter(format!("invalid CS pin {}", cs)));
        }
        let out = if enable { 0x37 & !(1 << cs) } else { 0x37 };
        let cmd = [
            CMD_UIO_STREAM,
            UIO_STM_OUT | out,
            UIO_STM_DIR | 0x3f,
            UIO_STM_END,
        ];
        self.dev.write_bulk(&cmd)?;
        Ok(())
    }

    /// Full-duplex SPI burst, at most one packet's worth of bytes.
    pub fn spi(&mut self, mosi: &[u8]) -> Result<Vec<u8>> {
        if mosi.is_empty() {
            return Ok(Vec::new());
        }
        let size = mosi.len().min(PACKET_LENGTH - 1);

        let mut pkt = Vec::with_capacity(size + 1);
        pkt.push(CMD_SPI_STREAM);
        pkt.extend(mosi[..size].iter().map(|b| b.reverse_bits()));
        self.dev.write_bulk(&pkt)?;

        let mut miso = vec![0u8; size];
        let mut read = 0;
        while read < size {
            let n = self.dev.read_bulk(&mut miso[read..])?;
            if n == 0 {
                return Err(crate::transport::Error::ShortTransfer {
                    expected: size,
                    got: read,
                }
                .into());
            }
            read += n;
        }
        for b in miso.iter_mut() {
            *b = b.reverse_bits();
        }
        Ok(miso)
    }
}

impl<D: BulkPipe> Programmer for Ch341a<D> {
    fn kind(&self) -> &'static str {
        "ch341a"
    }

    fn initialize(&mut self, part: &Part) -> Result<()> {
        // Pulse RESET so the target samples it low on entry to ISP mode.
        self.chip_select(0, false)?;
        usleep(20 * 1000);
        self.chip_select(0, true)?;
        self.program_enable(part)
    }

    fn program_enable(&mut self, part: &Part) -> Result<()> {
        program_enable_default(self, part)
    }

    fn chip_erase(&mut self, part: &Part) -> Result<()> {
        chip_erase_default(self, part)
    }

    fn cmd(&mut self, cmd: &[u8; 4]) -> Result<[u8; 4]> {
        let miso = self.spi(cmd)?;
        let mut res = [0u8; 4];
        res.copy_from_slice(&miso);
        Ok(res)
    }

    fn close(&mut self) {
        if let Err(e) = self.chip_select(0, false) {
            log::warn!("cannot release chip select: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport;

    /// Loopback wire: MISO returns exactly the (already reversed) MOSI
    /// payload of the previous SPI packet.
    struct Loopback {
        written: Vec<Vec<u8>>,
        pending: Vec<u8>,
    }

    impl Loopback {
        fn new() -> Self {
            Loopback {
                written: Vec::new(),
                pending: Vec::new(),
            }
        }
    }

    impl BulkPipe for Loopback {
        fn write_bulk(&mut self, buf: &[u8]) -> transport::Result<usize> {
            self.written.push(buf.to_vec());
            if buf.first() == Some(&CMD_SPI_STREAM) {
                self.pending = buf[1..].to_vec();
            }
            Ok(buf.len())
        }

        fn read_bulk(&mut self, buf: &mut [u8]) -> transport::Result<usize> {
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    #[test]
    fn spi_loopback_round_trips() {
        // Two bit reversals cancel out.
        let mut pgm = Ch341a::new(Loopback::new());
        let out = pgm.spi(&[0x01, 0x02, 0x03, 0x04]).unwrap();
        assert_eq!(out, vec![0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn mosi_bytes_are_bit_reversed_on_the_wire() {
        let mut pgm = Ch341a::new(Loopback::new());
        pgm.spi(&[0x01, 0x02, 0x03, 0x04]).unwrap();
        assert_eq!(
            pgm.dev.written[0],
            vec![CMD_SPI_STREAM, 0x80, 0x40, 0xc0, 0x20]
        );
    }

    #[test]
    fn chip_select_micro_program() {
        let mut pgm = Ch341a::new(Loopback::new());
        pgm.chip_select(0, true).unwrap();
        pgm.chip_select(0, false).unwrap();
        assert_eq!(pgm.dev.written[0], vec![0xab, 0x80 | 0x36, 0x40 | 0x3f, 0x20]);
        assert_eq!(pgm.dev.written[1], vec![0xab, 0x80 | 0x37, 0x40 | 0x3f, 0x20]);
        assert!(pgm.chip_select(3, true).is_err());
    }

    #[test]
    fn long_bursts_are_clamped_to_packet_payload() {
        let mut pgm = Ch341a::new(Loopback::new());
        let out = pgm.spi(&[0xffu8; 40]).unwrap();
        assert_eq!(out.len(), PACKET_LENGTH - 1);
        assert_eq!(pgm.dev.written[0].len(), PACKET_LENGTH);
    }
}
