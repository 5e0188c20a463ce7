//! USBasp driver: every operation is one USB vendor control transfer.
//!
//! The function code rides in `bRequest`, the first four command bytes in
//! `wValue`/`wIndex`, and bulk data in the transfer buffer. Capable
//! firmwares also speak TPI for the reduced-pin tiny parts; when both the
//! programmer and the part support it, `initialize` selects the TPI
//! sub-driver for the rest of the session.

use scroll::{LE, Pread, Pwrite};

use crate::part::{Memory, Part};
use crate::transport::{self, VendorControl};

use super::{
    Error, Programmer, Result, chip_erase_default, read_byte_default, usleep, write_byte_default,
};

pub const USBASP_SHARED_VID: u16 = 0x16c0;
pub const USBASP_SHARED_PID: u16 = 0x05dc;

/// Pre-release VID/PID, handled with a firmware-update warning.
pub const USBASP_OLD_VID: u16 = 0x03eb;
pub const USBASP_OLD_PID: u16 = 0xc7b4;

const READ_BLOCK_SIZE: usize = 256;
const WRITE_BLOCK_SIZE: usize = 256;

/// TPI block commands move at most this many bytes per transfer.
const TPI_CHUNK: usize = 32;

mod proto {
    pub const FUNC_CONNECT: u8 = 1;
    pub const FUNC_DISCONNECT: u8 = 2;
    pub const FUNC_TRANSMIT: u8 = 3;
    pub const FUNC_READFLASH: u8 = 4;
    pub const FUNC_ENABLEPROG: u8 = 5;
    pub const FUNC_WRITEFLASH: u8 = 6;
    pub const FUNC_READEEPROM: u8 = 7;
    pub const FUNC_WRITEEEPROM: u8 = 8;
    pub const FUNC_SETLONGADDRESS: u8 = 9;
    pub const FUNC_SETISPSCK: u8 = 10;
    pub const FUNC_TPI_CONNECT: u8 = 11;
    pub const FUNC_TPI_DISCONNECT: u8 = 12;
    pub const FUNC_TPI_RAWREAD: u8 = 13;
    pub const FUNC_TPI_RAWWRITE: u8 = 14;
    pub const FUNC_TPI_READBLOCK: u8 = 15;
    pub const FUNC_TPI_WRITEBLOCK: u8 = 16;
    pub const FUNC_GETCAPABILITIES: u8 = 127;

    pub const BLOCKFLAG_FIRST: u8 = 1;
    pub const BLOCKFLAG_LAST: u8 = 2;

    pub const CAP_TPI: u32 = 0x01;
    /// UsbAsp-flash firmware advertises 3 MHz SCK support here.
    pub const CAP_3MHZ: u32 = 0x40;

    pub const ISP_SCK_AUTO: u8 = 0;
}

/// SCK menu the firmware understands, fastest first.
const SCK_OPTIONS: &[(u8, u32)] = &[
    (13, 3_000_000),
    (12, 1_500_000),
    (11, 750_000),
    (10, 375_000),
    (9, 187_500),
    (8, 93_750),
    (7, 32_000),
    (6, 16_000),
    (5, 8_000),
    (4, 4_000),
    (3, 2_000),
    (2, 1_000),
    (1, 500),
];

mod tpi {
    pub const CMD_SIN: u8 = 0x10;
    pub const CMD_SOUT: u8 = 0x90;
    pub const CMD_SLDCS: u8 = 0x80;
    pub const CMD_SSTCS: u8 = 0xc0;
    pub const CMD_SSTPR: u8 = 0x68;
    pub const CMD_SST_INC: u8 = 0x64;

    /// I/O space addresses fold bits 5:4 into the opcode.
    pub const fn sio_addr(a: u8) -> u8 {
        (a & 0x0f) | ((a & 0x30) << 1)
    }

    pub const REG_TPIIR: u8 = 0x0f;
    pub const REG_TPIPCR: u8 = 0x02;
    pub const REG_TPISR: u8 = 0x00;

    pub const IDENT_CODE: u8 = 0x80;
    pub const TPISR_NVMEN: u8 = 1 << 1;
    /// Guard time field value for 2 idle bits.
    pub const TPIPCR_GT_2B: u8 = 0x06;

    pub const IOREG_NVMCSR: u8 = 0x32;
    pub const IOREG_NVMCMD: u8 = 0x33;
    pub const NVMCSR_BSY: u8 = 1 << 7;

    pub const NVMCMD_CHIP_ERASE: u8 = 0x10;
    pub const NVMCMD_SECTION_ERASE: u8 = 0x14;

    pub const SKEY: [u8; 9] = [0xe0, 0xff, 0x88, 0xd8, 0xcd, 0x45, 0xab, 0x89, 0x12];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Spi,
    Tpi,
}

pub struct UsbAsp<D: VendorControl> {
    dev: D,
    mode: Mode,
    capabilities: u32,
    /// SCK frequency in use; zero means firmware-chosen ("auto").
    sck_hz: u32,
    /// Requested bit clock period in seconds, zero for auto.
    bitclock: f64,
    /// `-x section_config`: erase only the configuration section (TPI).
    section_e: bool,
}

impl<D: VendorControl> UsbAsp<D> {
    pub fn new(dev: D, bitclock: f64) -> Self {
        UsbAsp {
            dev,
            mode: Mode::Spi,
            capabilities: 0,
            sck_hz: 0,
            bitclock,
            section_e: false,
        }
    }

    pub fn parse_extended_params(&mut self, params: &[String]) -> Result<()> {
        for p in params {
            if p == "section_config" {
                self.section_e = true;
            } else {
                return Err(Error::InvalidParameter(p.clone()));
            }
        }
        Ok(())
    }

    fn transmit_in(&mut self, func: u8, send: [u8; 4], buf: &mut [u8]) -> Result<usize> {
        let value = send.pread_with::<u16>(0, LE).unwrap();
        let index = send.pread_with::<u16>(2, LE).unwrap();
        Ok(self.dev.control_in(func, value, index, buf)?)
    }

    fn transmit_out(&mut self, func: u8, send: [u8; 4], buf: &[u8]) -> Result<usize> {
        let value = send.pread_with::<u16>(0, LE).unwrap();
        let index = send.pread_with::<u16>(2, LE).unwrap();
        Ok(self.dev.control_out(func, value, index, buf)?)
    }

    fn get_capabilities(&mut self) -> u32 {
        let mut res = [0u8; 4];
        match self.transmit_in(proto::FUNC_GETCAPABILITIES, [0; 4], &mut res) {
            Ok(4) => res.pread_with::<u32>(0, LE).unwrap(),
            // Old firmwares don't know the request at all.
            _ => 0,
        }
    }

    fn spi_set_sck_period(&mut self, period: f64) -> Result<()> {
        let mut clockoption = proto::ISP_SCK_AUTO;
        self.sck_hz = 0;

        if period == 0.0 {
            log::info!("auto-selecting SCK period");
        } else {
            let sckfreq = (1.0 / period) as u32;
            // The stock firmware tops out at 1.5 MHz; only UsbAsp-flash
            // derivatives advertise the 3 MHz entry.
            let start = if self.capabilities & proto::CAP_3MHZ != 0 {
                0
            } else {
                1
            };

            let mut usefreq = 0;
            if sckfreq >= SCK_OPTIONS[start].1 {
                clockoption = SCK_OPTIONS[start].0;
                usefreq = SCK_OPTIONS[start].1;
            } else {
                for &(id, freq) in &SCK_OPTIONS[start..] {
                    // One Hz of slack absorbs rounding in the requested value.
                    if sckfreq >= freq - 1 {
                        clockoption = id;
                        usefreq = freq;
                        break;
                    }
                }
            }
            self.sck_hz = usefreq;
            log::info!("set SCK frequency to {} Hz", usefreq);
        }

        let mut res = [0u8; 4];
        let n = self.transmit_in(proto::FUNC_SETISPSCK, [clockoption, 0, 0, 0], &mut res)?;
        if n != 1 || res[0] != 0 {
            log::error!("cannot set SCK period; check for a usbasp firmware update");
            return Err(Error::Failed);
        }
        Ok(())
    }

    /// Block size for the paged commands: reduced tenfold below 10 kHz
    /// SCK so a block stays inside the control-transfer timeout.
    fn block_size(&self, full: usize) -> usize {
        if self.sck_hz > 0 && self.sck_hz < 10_000 {
            full / 10
        } else {
            full
        }
    }

    fn spi_paged_load(&mut self, mem: &Memory, addr: u32, buf: &mut [u8]) -> Result<usize> {
        let function = if mem.is_flash() {
            proto::FUNC_READFLASH
        } else if mem.is_eeprom() {
            proto::FUNC_READEEPROM
        } else {
            return Err(Error::Capability {
                op: "paged read",
                what: format!("memory {}", mem.name),
            });
        };

        let mut blocksize = self.block_size(READ_BLOCK_SIZE);
        let n_bytes = buf.len();
        let mut address = addr;
        let mut offset = 0;
        while offset < n_bytes {
            blocksize = blocksize.min(n_bytes - offset);

            self.set_long_address(address)?;

            // Compatibility with old firmwares: they ignore the long
            // address and take the 16-bit one embedded here.
            let cmd = [address as u8, (address >> 8) as u8, 0, 0];
            let n = self.transmit_in(function, cmd, &mut buf[offset..offset + blocksize])?;
            if n != blocksize {
                return Err(transport::Error::ShortTransfer {
                    expected: blocksize,
                    got: n,
                }
                .into());
            }

            offset += blocksize;
            address += blocksize as u32;
        }
        Ok(n_bytes)
    }

    fn spi_paged_write(&mut self, mem: &Memory, addr: u32, buf: &[u8]) -> Result<usize> {
        let function = if mem.is_flash() {
            proto::FUNC_WRITEFLASH
        } else if mem.is_eeprom() {
            proto::FUNC_WRITEEEPROM
        } else {
            return Err(Error::Capability {
                op: "paged write",
                what: format!("memory {}", mem.name),
            });
        };

        let page_size = mem.page_size;
        let mut blocksize = self.block_size(WRITE_BLOCK_SIZE);
        let n_bytes = buf.len();
        let mut address = addr;
        let mut offset = 0;
        let mut blockflags = proto::BLOCKFLAG_FIRST;
        while offset < n_bytes {
            blocksize = blocksize.min(n_bytes - offset);
            if offset + blocksize >= n_bytes {
                blockflags |= proto::BLOCKFLAG_LAST;
            }

            self.set_long_address(address)?;

            let cmd = [
                address as u8,
                (address >> 8) as u8,
                page_size as u8,
                // Page sizes beyond 255 carry their high nibble here.
                (blockflags & 0x0f) | ((page_size & 0xf00) >> 4) as u8,
            ];
            blockflags = 0;

            let n = self.transmit_out(function, cmd, &buf[offset..offset + blocksize])?;
            if n != blocksize {
                return Err(transport::Error::ShortTransfer {
                    expected: blocksize,
                    got: n,
                }
                .into());
            }

            offset += blocksize;
            address += blocksize as u32;
        }
        Ok(n_bytes)
    }

    /// Newer firmwares take the full 32-bit address from this request and
    /// ignore the 16 bits embedded in the block command that follows.
    fn set_long_address(&mut self, address: u32) -> Result<()> {
        let mut cmd = [0u8; 4];
        cmd.pwrite_with::<u32>(address, 0, LE).unwrap();
        let mut tmp = [0u8; 4];
        self.transmit_in(proto::FUNC_SETLONGADDRESS, cmd, &mut tmp)?;
        Ok(())
    }

    // --- TPI ---

    fn tpi_send_byte(&mut self, b: u8) -> Result<()> {
        let mut tmp = [0u8; 4];
        self.transmit_in(proto::FUNC_TPI_RAWWRITE, [b, 0, 0, 0], &mut tmp)?;
        Ok(())
    }

    fn tpi_recv_byte(&mut self) -> Result<u8> {
        let mut tmp = [0u8; 4];
        let n = self.transmit_in(proto::FUNC_TPI_RAWREAD, [0; 4], &mut tmp)?;
        if n != 1 {
            return Err(transport::Error::ShortTransfer {
                expected: 1,
                got: n,
            }
            .into());
        }
        Ok(tmp[0])
    }

    fn tpi_nvm_waitbusy(&mut self) -> Result<()> {
        for _ in 0..50 {
            self.tpi_send_byte(tpi::CMD_SIN | tpi::sio_addr(tpi::IOREG_NVMCSR))?;
            if self.tpi_recv_byte()? & tpi::NVMCSR_BSY == 0 {
                return Ok(());
            }
        }
        Err(Error::WritePollTimeout(0))
    }

    /// Point the TPI pointer register at `pr`.
    fn tpi_set_pr(&mut self, pr: u16) -> Result<()> {
        let bytes = pr.to_le_bytes();
        self.tpi_send_byte(tpi::CMD_SSTPR)?;
        self.tpi_send_byte(bytes[0])?;
        self.tpi_send_byte(tpi::CMD_SSTPR | 1)?;
        self.tpi_send_byte(bytes[1])?;
        Ok(())
    }

    fn tpi_nvm_command(&mut self, cmd: u8) -> Result<()> {
        self.tpi_send_byte(tpi::CMD_SOUT | tpi::sio_addr(tpi::IOREG_NVMCMD))?;
        self.tpi_send_byte(cmd)
    }

    fn tpi_program_enable(&mut self) -> Result<()> {
        // Shorten the guard time, then present the NVM access key.
        self.tpi_send_byte(tpi::CMD_SSTCS | tpi::REG_TPIPCR)?;
        self.tpi_send_byte(tpi::TPIPCR_GT_2B)?;
        for b in tpi::SKEY {
            self.tpi_send_byte(b)?;
        }

        for _ in 0..10 {
            self.tpi_send_byte(tpi::CMD_SLDCS | tpi::REG_TPIIR)?;
            if self.tpi_recv_byte()? != tpi::IDENT_CODE {
                continue;
            }
            self.tpi_send_byte(tpi::CMD_SLDCS | tpi::REG_TPISR)?;
            if self.tpi_recv_byte()? & tpi::TPISR_NVMEN == 0 {
                continue;
            }
            return Ok(());
        }
        log::error!("program enable: target does not answer");
        Err(Error::NoDevice)
    }

    fn tpi_chip_erase(&mut self, part: &Part) -> Result<()> {
        let (pr, nvm_cmd) = if self.section_e {
            (0x3f41u16, tpi::NVMCMD_SECTION_ERASE)
        } else {
            // Flash base, high-byte bit set.
            (0x4001u16, tpi::NVMCMD_CHIP_ERASE)
        };

        self.tpi_set_pr(pr)?;
        self.tpi_nvm_command(nvm_cmd)?;
        // A dummy write with post-increment starts the erase.
        self.tpi_send_byte(tpi::CMD_SST_INC)?;
        self.tpi_send_byte(0x00)?;
        self.tpi_nvm_waitbusy()?;

        usleep(part.chip_erase_delay);
        self.initialize(part)
    }

    fn tpi_paged_load(&mut self, mem: &Memory, addr: u32, buf: &mut [u8]) -> Result<usize> {
        let n_bytes = buf.len();
        let mut pr = (mem.offset + addr) as u16;
        let mut offset = 0;
        while offset < n_bytes {
            let chunk = TPI_CHUNK.min(n_bytes - offset);
            let cmd = [pr as u8, (pr >> 8) as u8, 0, 0];
            let n = self.transmit_in(
                proto::FUNC_TPI_READBLOCK,
                cmd,
                &mut buf[offset..offset + chunk],
            )?;
            if n != chunk {
                return Err(transport::Error::ShortTransfer {
                    expected: chunk,
                    got: n,
                }
                .into());
            }
            offset += chunk;
            pr = pr.wrapping_add(chunk as u16);
        }
        Ok(n_bytes)
    }

    fn tpi_write_chunk(&mut self, pr: u16, data: &[u8]) -> Result<()> {
        let cmd = [pr as u8, (pr >> 8) as u8, 0, 0];
        let n = self.transmit_out(proto::FUNC_TPI_WRITEBLOCK, cmd, data)?;
        if n != data.len() {
            return Err(transport::Error::ShortTransfer {
                expected: data.len(),
                got: n,
            }
            .into());
        }
        Ok(())
    }

    fn tpi_paged_write(&mut self, mem: &Memory, addr: u32, buf: &[u8]) -> Result<usize> {
        let n_bytes = buf.len();
        let base = (mem.offset + addr) as u16;

        // TPI parts carry a single fuse byte which must be erased before
        // it can be rewritten.
        if mem.is_a_fuse() {
            self.tpi_set_pr(base | 1)?;
            self.tpi_nvm_command(tpi::NVMCMD_SECTION_ERASE)?;
            self.tpi_send_byte(tpi::CMD_SST_INC)?;
            self.tpi_send_byte(0x00)?;
            self.tpi_nvm_waitbusy()?;
        }

        self.tpi_set_pr(base | 1)?;

        let mut pr = base;
        let mut offset = 0;
        while offset < n_bytes {
            let chunk = TPI_CHUNK.min(n_bytes - offset);
            self.tpi_write_chunk(pr, &buf[offset..offset + chunk])?;
            offset += chunk;
            pr = pr.wrapping_add(chunk as u16);
        }

        // Pad the tail of the final page with 0xff in small bursts so the
        // NVM state machine commits it.
        let page_size = mem.page_size.max(1);
        let mut remainder = (page_size - (n_bytes as u32 % page_size)) % page_size;
        let pad = [0xffu8; 8];
        while remainder > 0 {
            let chunk = (remainder as usize).min(pad.len());
            self.tpi_write_chunk(pr, &pad[..chunk])?;
            pr = pr.wrapping_add(chunk as u16);
            remainder -= chunk as u32;
        }

        Ok(n_bytes)
    }

    fn tpi_read_byte(&mut self, mem: &Memory, addr: u32) -> Result<u8> {
        let pr = (mem.offset + addr) as u16;
        let cmd = [pr as u8, (pr >> 8) as u8, 0, 0];
        let mut value = [0u8; 1];
        let n = self.transmit_in(proto::FUNC_TPI_READBLOCK, cmd, &mut value)?;
        if n != 1 {
            return Err(transport::Error::ShortTransfer {
                expected: 1,
                got: n,
            }
            .into());
        }
        Ok(value[0])
    }
}

impl<D: VendorControl> Programmer for UsbAsp<D> {
    fn kind(&self) -> &'static str {
        "usbasp"
    }

    fn initialize(&mut self, part: &Part) -> Result<()> {
        self.capabilities = self.get_capabilities();

        let use_tpi = self.capabilities & proto::CAP_TPI != 0 && part.is_tpi();
        self.mode = if use_tpi { Mode::Tpi } else { Mode::Spi };

        if use_tpi {
            let dly = (1_500_000.0 * self.bitclock) as i32;
            let dly = dly.clamp(1, 2047) as u16;
            let mut res = [0u8; 4];
            self.transmit_in(
                proto::FUNC_TPI_CONNECT,
                [dly as u8, (dly >> 8) as u8, 0, 0],
                &mut res,
            )?;
        } else {
            self.spi_set_sck_period(self.bitclock)?;
            let mut res = [0u8; 4];
            self.transmit_in(proto::FUNC_CONNECT, [0; 4], &mut res)?;
        }

        // Give the adapter time to pull reset and settle.
        usleep(100_000);

        self.program_enable(part)
    }

    fn program_enable(&mut self, _part: &Part) -> Result<()> {
        if self.mode == Mode::Tpi {
            return self.tpi_program_enable();
        }

        let mut res = [0u8; 4];
        let n = self.transmit_in(proto::FUNC_ENABLEPROG, [0; 4], &mut res)?;
        if n != 1 || res[0] != 0 {
            log::error!("program enable: target does not answer (0x{:02x})", res[0]);
            return Err(Error::NoDevice);
        }
        Ok(())
    }

    fn chip_erase(&mut self, part: &Part) -> Result<()> {
        match self.mode {
            Mode::Tpi => self.tpi_chip_erase(part),
            Mode::Spi => chip_erase_default(self, part),
        }
    }

    fn cmd(&mut self, cmd: &[u8; 4]) -> Result<[u8; 4]> {
        if self.mode == Mode::Tpi {
            // SPI passthrough makes no sense on a TPI wire.
            return Err(Error::Capability {
                op: "spi command",
                what: "usbasp in TPI mode".to_string(),
            });
        }
        let mut res = [0u8; 4];
        let n = self.transmit_in(proto::FUNC_TRANSMIT, *cmd, &mut res)?;
        if n != 4 {
            return Err(transport::Error::ShortTransfer {
                expected: 4,
                got: n,
            }
            .into());
        }
        Ok(res)
    }

    fn read_byte(&mut self, part: &Part, mem: &Memory, addr: u32) -> Result<u8> {
        match self.mode {
            Mode::Tpi => self.tpi_read_byte(mem, addr),
            Mode::Spi => read_byte_default(self, part, mem, addr),
        }
    }

    fn write_byte(&mut self, part: &Part, mem: &Memory, addr: u32, data: u8) -> Result<()> {
        match self.mode {
            Mode::Tpi => Err(Error::Capability {
                op: "byte write",
                what: "usbasp in TPI mode (writes are page level)".to_string(),
            }),
            Mode::Spi => write_byte_default(self, part, mem, addr, data),
        }
    }

    fn paged_load(&mut self, _part: &Part, mem: &Memory, addr: u32, buf: &mut [u8]) -> Result<usize> {
        match self.mode {
            Mode::Tpi => self.tpi_paged_load(mem, addr, buf),
            Mode::Spi => self.spi_paged_load(mem, addr, buf),
        }
    }

    fn paged_write(&mut self, _part: &Part, mem: &Memory, addr: u32, buf: &[u8]) -> Result<usize> {
        match self.mode {
            Mode::Tpi => self.tpi_paged_write(mem, addr, buf),
            Mode::Spi => self.spi_paged_write(mem, addr, buf),
        }
    }

    fn set_sck_period(&mut self, period: f64) -> Result<()> {
        self.bitclock = period;
        match self.mode {
            // The TPI clock is fixed at connect time.
            Mode::Tpi => Ok(()),
            Mode::Spi => self.spi_set_sck_period(period),
        }
    }

    fn disable(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {
        let func = match self.mode {
            Mode::Tpi => proto::FUNC_TPI_DISCONNECT,
            Mode::Spi => proto::FUNC_DISCONNECT,
        };
        let mut tmp = [0u8; 4];
        if let Err(e) = self.transmit_in(func, [0; 4], &mut tmp) {
            log::warn!("disconnect failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::PartDb;
    use std::collections::VecDeque;

    #[derive(Debug, PartialEq, Eq, Clone)]
    struct Transfer {
        dir_in: bool,
        request: u8,
        value: u16,
        index: u16,
        len: usize,
        out_data: Vec<u8>,
    }

    /// Fake USBasp: records control transfers, replays canned IN data.
    struct MockUsb {
        log: Vec<Transfer>,
        replies: VecDeque<Vec<u8>>,
    }

    impl MockUsb {
        fn new() -> Self {
            MockUsb {
                log: Vec::new(),
                replies: VecDeque::new(),
            }
        }

        fn reply(&mut self, data: Vec<u8>) {
            self.replies.push_back(data);
        }
    }

    impl VendorControl for MockUsb {
        fn control_in(
            &mut self,
            request: u8,
            value: u16,
            index: u16,
            buf: &mut [u8],
        ) -> crate::transport::Result<usize> {
            self.log.push(Transfer {
                dir_in: true,
                request,
                value,
                index,
                len: buf.len(),
                out_data: vec![],
            });
            let data = self.replies.pop_front().unwrap_or_default();
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            Ok(n)
        }

        fn control_out(
            &mut self,
            request: u8,
            value: u16,
            index: u16,
            buf: &[u8],
        ) -> crate::transport::Result<usize> {
            self.log.push(Transfer {
                dir_in: false,
                request,
                value,
                index,
                len: buf.len(),
                out_data: buf.to_vec(),
            });
            Ok(buf.len())
        }
    }

    fn ack() -> Vec<u8> {
        vec![0]
    }

    #[test]
    fn sck_quantisation_picks_next_lower_entry() {
        let mut pgm = UsbAsp::new(MockUsb::new(), 0.0);
        pgm.dev.reply(ack());
        pgm.spi_set_sck_period(1.0 / 900_000.0).unwrap();
        assert_eq!(pgm.sck_hz, 750_000);
        // SETISPSCK carried the 750 kHz menu id in send[0].
        let t = pgm.dev.log.last().unwrap();
        assert_eq!(t.request, proto::FUNC_SETISPSCK);
        assert_eq!(t.value & 0xff, 11);
    }

    #[test]
    fn sck_tolerance_absorbs_rounding() {
        // A request that computes to 7999 Hz still lands on the 8 kHz
        // entry thanks to the 1 Hz slack.
        let mut pgm = UsbAsp::new(MockUsb::new(), 0.0);
        pgm.dev.reply(ack());
        pgm.spi_set_sck_period(1.0 / 7999.0).unwrap();
        assert_eq!(pgm.sck_hz, 8_000);
    }

    #[test]
    fn slow_sck_reduces_block_size() {
        let mut pgm = UsbAsp::new(MockUsb::new(), 0.0);
        pgm.dev.reply(ack());
        pgm.spi_set_sck_period(1.0 / 8000.0).unwrap();
        assert_eq!(pgm.block_size(READ_BLOCK_SIZE), 25);

        let mut pgm = UsbAsp::new(MockUsb::new(), 0.0);
        pgm.dev.reply(ack());
        pgm.spi_set_sck_period(1.0 / 93_750.0).unwrap();
        assert_eq!(pgm.block_size(READ_BLOCK_SIZE), READ_BLOCK_SIZE);
    }

    #[test]
    fn fast_request_clamps_to_menu_top() {
        let mut pgm = UsbAsp::new(MockUsb::new(), 0.0);
        pgm.dev.reply(ack());
        pgm.spi_set_sck_period(1.0 / 8_000_000.0).unwrap();
        // Without the 3 MHz capability the top entry is 1.5 MHz.
        assert_eq!(pgm.sck_hz, 1_500_000);

        let mut pgm = UsbAsp::new(MockUsb::new(), 0.0);
        pgm.capabilities = proto::CAP_3MHZ;
        pgm.dev.reply(ack());
        pgm.spi_set_sck_period(1.0 / 8_000_000.0).unwrap();
        assert_eq!(pgm.sck_hz, 3_000_000);
    }

    #[test]
    fn paged_flash_read_sends_long_and_short_address() {
        let part = PartDb::find("m328p").unwrap();
        let flash = part.flash().unwrap();
        let mut pgm = UsbAsp::new(MockUsb::new(), 0.0);
        pgm.dev.reply(vec![0; 4]); // SETLONGADDRESS
        pgm.dev.reply(vec![0x5a; 128]); // READFLASH

        let mut buf = vec![0u8; 128];
        let n = pgm.paged_load(&part, flash, 0x1f80, &mut buf).unwrap();
        assert_eq!(n, 128);
        assert!(buf.iter().all(|&b| b == 0x5a));

        let long = &pgm.dev.log[0];
        assert_eq!(long.request, proto::FUNC_SETLONGADDRESS);
        assert_eq!(long.value, 0x1f80);
        assert_eq!(long.index, 0x0000);

        let read = &pgm.dev.log[1];
        assert_eq!(read.request, proto::FUNC_READFLASH);
        assert_eq!(read.value, 0x1f80);
        assert_eq!(read.len, 128);
    }

    #[test]
    fn paged_read_crossing_64k_issues_two_long_addresses() {
        let part = PartDb::find("m2560").unwrap();
        let flash = part.flash().unwrap();
        let mut pgm = UsbAsp::new(MockUsb::new(), 0.0);
        for _ in 0..2 {
            pgm.dev.reply(vec![0; 4]);
            pgm.dev.reply(vec![0xa5; 256]);
        }

        let mut buf = vec![0u8; 512];
        pgm.paged_load(&part, flash, 0xff00, &mut buf).unwrap();

        let longs: Vec<&Transfer> = pgm
            .dev
            .log
            .iter()
            .filter(|t| t.request == proto::FUNC_SETLONGADDRESS)
            .collect();
        assert_eq!(longs.len(), 2);
        assert_eq!((longs[0].value, longs[0].index), (0xff00, 0x0000));
        assert_eq!((longs[1].value, longs[1].index), (0x0000, 0x0001));
    }

    #[test]
    fn paged_write_flags_first_and_last_blocks() {
        let part = PartDb::find("m328p").unwrap();
        let flash = part.flash().unwrap();
        let mut pgm = UsbAsp::new(MockUsb::new(), 0.0);
        for _ in 0..3 {
            pgm.dev.reply(vec![0; 4]); // SETLONGADDRESS acks
        }

        let data = vec![0x11u8; 512];
        pgm.paged_write(&part, flash, 0, &data).unwrap();

        let writes: Vec<&Transfer> = pgm
            .dev
            .log
            .iter()
            .filter(|t| t.request == proto::FUNC_WRITEFLASH)
            .collect();
        assert_eq!(writes.len(), 2);
        // Page size 128 = 0x080: low byte in index LSB, high nibble
        // packed beside the flags.
        assert_eq!(writes[0].index & 0x00ff, 0x80);
        let flags0 = (writes[0].index >> 8) as u8 & 0x0f;
        let flags1 = (writes[1].index >> 8) as u8 & 0x0f;
        assert_eq!(flags0, proto::BLOCKFLAG_FIRST);
        assert_eq!(flags1, proto::BLOCKFLAG_LAST);
    }

    #[test]
    fn tpi_operations_gated_on_non_tpi_part() {
        let part = PartDb::find("m328p").unwrap();
        let mut pgm = UsbAsp::new(MockUsb::new(), 0.0);
        // Capabilities say TPI, the part does not: stay in SPI mode.
        pgm.dev.reply(vec![proto::CAP_TPI as u8, 0, 0, 0]);
        pgm.dev.reply(ack()); // SETISPSCK
        pgm.dev.reply(vec![0; 4]); // CONNECT
        pgm.dev.reply(ack()); // ENABLEPROG
        pgm.initialize(&part).unwrap();
        assert_eq!(pgm.mode, Mode::Spi);
    }

    #[test]
    fn tpi_byte_write_unsupported() {
        let part = PartDb::find("t10").unwrap();
        let flash = part.flash().unwrap();
        let mut pgm = UsbAsp::new(MockUsb::new(), 0.0);
        pgm.mode = Mode::Tpi;
        let before = pgm.dev.log.len();
        let err = pgm.write_byte(&part, flash, 0, 0xff).unwrap_err();
        assert!(matches!(err, Error::Capability { .. }));
        assert_eq!(pgm.dev.log.len(), before);

        let err = pgm.cmd(&[0xac, 0x53, 0, 0]).unwrap_err();
        assert!(matches!(err, Error::Capability { .. }));
        assert_eq!(pgm.dev.log.len(), before);
    }

    #[test]
    fn tpi_paged_write_pads_final_page() {
        let part = PartDb::find("t10").unwrap();
        let flash = part.flash().unwrap();
        let mut pgm = UsbAsp::new(MockUsb::new(), 0.0);
        pgm.mode = Mode::Tpi;

        // 10 bytes into a 16-byte page: expect one 10-byte block write
        // followed by a 6-byte 0xff pad, plus the pointer setup bytes.
        let data = vec![0x22u8; 10];
        pgm.tpi_paged_write(flash, 0, &data).unwrap();

        let blocks: Vec<&Transfer> = pgm
            .dev
            .log
            .iter()
            .filter(|t| t.request == proto::FUNC_TPI_WRITEBLOCK)
            .collect();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].out_data, data);
        assert_eq!(blocks[1].out_data, vec![0xff; 6]);
        // Pad lands right after the data in the unified address space.
        assert_eq!(blocks[1].value, (flash.offset as u16 + 10));
    }
}
