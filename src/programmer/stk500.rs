//! Atmel STK500 version 1.x firmware driver, framed serial protocol.
//!
//! Most target commands ride the "universal command" passthrough; the
//! exceptions are program enable, paged read and paged write, which use
//! the programmer's own page primitives. The same protocol is spoken by
//! target-resident bootloaders (optiboot and friends), selected here as
//! [`Variant::Bootloader`], and by the Crossbow MIB510, which needs a
//! magic unlock frame and fixed 256-byte blocks.

use crate::opcode::OpKind;
use crate::part::{Memory, Part, ProgMode, ResetDisposition};
use crate::transport::SerialLine;

use super::{Error, ExtAddr, Programmer, Result, chip_erase_default, usleep};

/// STK500 controller crystal, Hz. SCK and oscillator parameters are
/// quantised against this per AVR061.
pub const STK500_XTAL: u32 = 7_372_800;

/// Bounded desync recovery for the initial handshake.
pub const MAX_SYNC_ATTEMPTS: usize = 10;

/// Historic retry bound on NOSYNC replies to in-session commands.
pub const MAX_PROGRAM_ENABLE_RETRIES: usize = 33;

mod proto {
    pub const CRC_EOP: u8 = 0x20;

    pub const GET_SYNC: u8 = 0x30;
    pub const GET_PARAMETER: u8 = 0x41;
    pub const SET_PARAMETER: u8 = 0x40;
    pub const SET_DEVICE: u8 = 0x42;
    pub const SET_DEVICE_EXT: u8 = 0x45;
    pub const ENTER_PROGMODE: u8 = 0x50;
    pub const LEAVE_PROGMODE: u8 = 0x51;
    pub const LOAD_ADDRESS: u8 = 0x55;
    pub const UNIVERSAL: u8 = 0x56;
    pub const PROG_PAGE: u8 = 0x64;
    pub const READ_PAGE: u8 = 0x74;

    pub const RESP_OK: u8 = 0x10;
    pub const RESP_FAILED: u8 = 0x11;
    pub const RESP_NODEVICE: u8 = 0x13;
    pub const RESP_INSYNC: u8 = 0x14;
    pub const RESP_NOSYNC: u8 = 0x15;

    // Parameter indices per AVR061.
    pub const PARM_HW_VER: u8 = 0x80;
    pub const PARM_SW_MAJOR: u8 = 0x81;
    pub const PARM_SW_MINOR: u8 = 0x82;
    pub const PARM_VTARGET: u8 = 0x84;
    pub const PARM_VADJUST: u8 = 0x85;
    pub const PARM_OSC_PSCALE: u8 = 0x86;
    pub const PARM_OSC_CMATCH: u8 = 0x87;
    pub const PARM_SCK_DURATION: u8 = 0x89;
    pub const PARM_TOPCARD_DETECT: u8 = 0x98;
}

/// Protocol bytes bootloaders expect for the extended address, in place of
/// the part's own `load_ext_addr` instruction.
const BOOTLOADER_EXT_ADDR_CMD: u8 = 0x4d;

/// Wire dialects sharing the STK500v1 framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// A genuine STK500 (or faithful clone).
    Stk500,
    /// A bootloader resident on the target: byte addressing for modern
    /// part families, no SET_DEVICE, reset via the serial handshake lines.
    Bootloader,
    /// Crossbow MIB510: unlock frame on open, fixed 256-byte blocks.
    Mib510,
}

pub struct Stk500<S: SerialLine> {
    conn: S,
    variant: Variant,
    ext_addr: ExtAddr,
    xtal: u32,
    retry_attempts: Option<usize>,
    bitclock: Option<f64>,
    vtarget: Option<f64>,
    varef: Option<f64>,
    fosc: Option<f64>,
    /// Attempts the last `get_sync` needed, for diagnostics.
    sync_attempts_used: usize,
}

impl<S: SerialLine> Stk500<S> {
    pub fn new(conn: S, variant: Variant) -> Self {
        Stk500 {
            conn,
            variant,
            ext_addr: ExtAddr::default(),
            xtal: STK500_XTAL,
            retry_attempts: None,
            bitclock: None,
            vtarget: None,
            varef: None,
            fosc: None,
            sync_attempts_used: 0,
        }
    }

    /// Apply `-x` extended parameters before the session starts.
    pub fn parse_extended_params(&mut self, params: &[String]) -> Result<()> {
        for p in params {
            if let Some(v) = p.strip_prefix("attempts=") {
                let n: usize = v
                    .parse()
                    .map_err(|_| Error::InvalidParameter(p.clone()))?;
                log::info!("setting number of retry attempts to {}", n);
                self.retry_attempts = Some(n);
            } else if let Some(v) = p.strip_prefix("xtal=") {
                self.xtal = parse_freq(v).ok_or_else(|| Error::InvalidParameter(p.clone()))? as u32;
            } else if let Some(v) = p.strip_prefix("vtarg=") {
                self.vtarget =
                    Some(v.parse().map_err(|_| Error::InvalidParameter(p.clone()))?);
            } else if let Some(v) = p.strip_prefix("varef=") {
                self.varef = Some(v.parse().map_err(|_| Error::InvalidParameter(p.clone()))?);
            } else if let Some(v) = p.strip_prefix("fosc=") {
                self.fosc = Some(if v == "off" {
                    0.0
                } else {
                    parse_freq(v).ok_or_else(|| Error::InvalidParameter(p.clone()))?
                });
            } else {
                return Err(Error::InvalidParameter(p.clone()));
            }
        }
        Ok(())
    }

    pub fn sync_attempts_used(&self) -> usize {
        self.sync_attempts_used
    }

    /// SCK period in seconds, applied once the handshake is through.
    pub fn set_bitclock(&mut self, period: f64) {
        self.bitclock = Some(period);
    }

    fn recv1(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.conn.recv(&mut b)?;
        Ok(b[0])
    }

    /// Establish sync. Sends GET_SYNC twice with drains to flush line
    /// noise, then retries until the programmer answers INSYNC.
    fn get_sync(&mut self) -> Result<()> {
        let frame = [proto::GET_SYNC, proto::CRC_EOP];

        self.conn.send(&frame)?;
        self.conn.drain()?;
        self.conn.send(&frame)?;
        self.conn.drain()?;

        let max_attempts = self.retry_attempts.unwrap_or(MAX_SYNC_ATTEMPTS);
        let mut synced = false;
        let mut attempts = 0;
        for attempt in 1..=max_attempts {
            attempts = attempt;
            if self.variant == Variant::Bootloader && attempt > 1 {
                // Reset the target through the (negative logic) DTR/RTS
                // lines so the bootloader gets a fresh window. Longer than
                // 100 us charges the reset cap into a spike above Vcc.
                self.conn.set_dtr_rts(true)?;
                usleep(100);
                self.conn.set_dtr_rts(false)?;
                usleep(20_000);
                self.conn.drain()?;
            }

            self.conn.send(&frame)?;
            let mut resp = [0u8; 1];
            match self.conn.recv(&mut resp) {
                Ok(()) if resp[0] == proto::RESP_INSYNC => {
                    synced = true;
                    break;
                }
                Ok(()) => log::warn!(
                    "attempt {} of {}: not in sync: resp=0x{:02x}",
                    attempt,
                    max_attempts,
                    resp[0]
                ),
                Err(e) if e.is_timeout() => {
                    log::warn!("attempt {} of {}: no response", attempt, max_attempts)
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.sync_attempts_used = attempts;

        if !synced {
            self.conn.drain()?;
            return Err(Error::SyncRetries(attempts));
        }

        let ok = self.recv1()?;
        if ok != proto::RESP_OK {
            return Err(Error::UnknownResponse(ok));
        }
        log::debug!("in sync after {} attempt(s)", attempts);
        Ok(())
    }

    /// Send one framed command, read `payload` bytes between INSYNC and
    /// the closing status. `Ok(false)` means the programmer answered
    /// NOSYNC and the caller must resync and retry.
    fn exchange_with(&mut self, frame: &[u8], payload: &mut [u8], ok: u8) -> Result<bool> {
        self.conn.send(frame)?;
        let first = self.recv1()?;
        if first == proto::RESP_NOSYNC {
            return Ok(false);
        }
        if first != proto::RESP_INSYNC {
            return Err(Error::Desync(first));
        }
        if !payload.is_empty() {
            self.conn.recv(payload)?;
        }
        let status = self.recv1()?;
        if status == ok {
            return Ok(true);
        }
        match status {
            proto::RESP_NODEVICE => Err(Error::NoDevice),
            proto::RESP_FAILED => Err(Error::Failed),
            b => Err(Error::UnknownResponse(b)),
        }
    }

    fn exchange(&mut self, frame: &[u8], payload: &mut [u8]) -> Result<bool> {
        self.exchange_with(frame, payload, proto::RESP_OK)
    }

    /// Framed command with the historic bounded resync-and-retry loop.
    fn retrying(&mut self, frame: &[u8], payload: &mut [u8]) -> Result<()> {
        let mut tries = 0;
        loop {
            tries += 1;
            if self.exchange(frame, payload)? {
                return Ok(());
            }
            if tries > MAX_PROGRAM_ENABLE_RETRIES {
                return Err(Error::SyncRetries(tries));
            }
            self.get_sync()?;
        }
    }

    fn get_parameter(&mut self, parm: u8) -> Result<u8> {
        let frame = [proto::GET_PARAMETER, parm, proto::CRC_EOP];
        let mut value = [0u8; 1];
        self.retrying(&frame, &mut value)?;
        Ok(value[0])
    }

    fn set_parameter(&mut self, parm: u8, value: u8) -> Result<()> {
        let frame = [proto::SET_PARAMETER, parm, value, proto::CRC_EOP];
        let mut tries = 0;
        loop {
            tries += 1;
            self.conn.send(&frame)?;
            let first = self.recv1()?;
            if first == proto::RESP_NOSYNC {
                if tries > MAX_PROGRAM_ENABLE_RETRIES {
                    return Err(Error::SyncRetries(tries));
                }
                self.get_sync()?;
                continue;
            }
            if first != proto::RESP_INSYNC {
                return Err(Error::Desync(first));
            }
            let status = self.recv1()?;
            if status == proto::RESP_OK {
                return Ok(());
            }
            // Not OK: the programmer echoed the parameter index, the real
            // status follows.
            let echoed = status;
            let status = self.recv1()?;
            if status == proto::RESP_FAILED {
                log::error!("parameter 0x{:02x} failed", echoed);
                return Err(Error::Failed);
            }
            return Err(Error::UnknownResponse(status));
        }
    }

    /// MIB510 session bracket: `cmd` 1 unlocks, 0 closes.
    fn mib510_isp(&mut self, cmd: u8) -> Result<()> {
        let frame = [
            0xaa,
            0x55,
            0x55,
            0xaa,
            0x17,
            0x51,
            0x31,
            0x13,
            cmd,
        ];
        self.retrying(&frame, &mut [])
    }

    fn set_device(&mut self, part: &Part) -> Result<()> {
        let mut buf = [0u8; 22];
        buf[0] = proto::SET_DEVICE;
        buf[1] = part.stk500_devcode;
        buf[2] = 0; // device revision
        buf[3] = if part.serial_ok && part.parallel_ok { 0 } else { 1 };
        buf[4] = if part.parallel_ok { 1 } else { 0 };
        buf[5] = 1; // polling supported
        buf[6] = 1; // programming is self-timed
        buf[7] = part.lock().map(|m| m.size as u8).unwrap_or(0);
        buf[8] = part.fuse_bytes() as u8;

        if let Some(flash) = part.flash() {
            buf[9] = flash.readback[0];
            buf[10] = flash.readback[1];
            if flash.paged {
                buf[13] = (flash.page_size >> 8) as u8;
                buf[14] = flash.page_size as u8;
            }
            buf[17] = (flash.size >> 24) as u8;
            buf[18] = (flash.size >> 16) as u8;
            buf[19] = (flash.size >> 8) as u8;
            buf[20] = flash.size as u8;
        } else {
            buf[9] = 0xff;
            buf[10] = 0xff;
        }

        if let Some(eeprom) = part.eeprom() {
            buf[11] = eeprom.readback[0];
            buf[12] = eeprom.readback[1];
            buf[15] = (eeprom.size >> 8) as u8;
            buf[16] = eeprom.size as u8;
        } else {
            buf[11] = 0xff;
            buf[12] = 0xff;
        }

        buf[21] = proto::CRC_EOP;
        self.retrying(&buf, &mut [])
    }

    fn set_device_ext(&mut self, part: &Part, n_extparms: usize) -> Result<()> {
        let mut frame = Vec::with_capacity(n_extparms + 3);
        frame.push(proto::SET_DEVICE_EXT);
        frame.push(n_extparms as u8 + 1);
        frame.push(part.eeprom().map(|m| m.page_size as u8).unwrap_or(0));
        // PAGEL/BS2 are only meaningful for parallel programming; parts
        // without them get values that look somehow possible.
        frame.push(part.pagel.unwrap_or(0xd7));
        frame.push(part.bs2.unwrap_or(0xa0));
        if n_extparms == 4 {
            frame.push(match part.reset_disposition {
                ResetDisposition::Dedicated => 0,
                ResetDisposition::Io => 1,
            });
        }
        frame.push(proto::CRC_EOP);
        self.retrying(&frame, &mut [])
    }

    /// Memory channel byte for the page commands plus the address divisor
    /// (2 = word addressing, 1 = byte addressing).
    fn block_params(&self, part: &Part, mem: &Memory) -> Result<(u8, u32)> {
        if mem.is_flash() {
            let a_div = if self.variant == Variant::Bootloader {
                // Classic parts keep word addressing through bootloaders;
                // Xmega and the UPDI/PDI families use byte addressing.
                if part.has_mode(ProgMode::Pdi) || part.has_mode(ProgMode::Updi) {
                    1
                } else {
                    2
                }
            } else if mem.has_op(OpKind::LoadpageLo) || mem.has_op(OpKind::ReadLo) {
                2
            } else {
                1
            };
            return Ok((b'F', a_div));
        }
        if mem.is_eeprom() {
            let a_div = if self.variant == Variant::Bootloader
                && !(part.has_mode(ProgMode::Pdi) || part.has_mode(ProgMode::Updi))
            {
                2
            } else {
                1
            };
            return Ok((b'E', a_div));
        }
        Err(Error::Capability {
            op: "paged access",
            what: format!("memory {}", mem.name),
        })
    }

    /// Load the programmer's address pointer, latching the extended
    /// address byte first when the target needs one for this segment.
    fn load_addr(&mut self, mem: &Memory, byte_addr: u32, a_div: u32) -> Result<()> {
        let addr = byte_addr / a_div;

        if self.variant == Variant::Bootloader {
            if mem.size / a_div > 64 * 1024 {
                if let Some(ext) = self.ext_addr.stale(addr) {
                    let cmd = [BOOTLOADER_EXT_ADDR_CMD, 0x00, ext, 0x00];
                    self.cmd(&cmd)?;
                    self.ext_addr.latched(ext);
                }
                // Bootloaders auto-increment their RAMPZ copy when a read
                // or write runs up to a 64k boundary; drop ours so the
                // next block re-latches.
                self.ext_addr.advance(addr, mem.page_size / a_div);
            }
        } else if let Some(lext) = mem.op(OpKind::LoadExtAddr) {
            let lext = lext.clone();
            if let Some(ext) = self.ext_addr.stale(addr) {
                let mut cmd = [0u8; 4];
                lext.set_bits(&mut cmd);
                lext.set_addr(&mut cmd, addr);
                self.cmd(&cmd)?;
                self.ext_addr.latched(ext);
            }
        }

        let frame = [
            proto::LOAD_ADDRESS,
            (addr & 0xff) as u8,
            (addr >> 8) as u8,
            proto::CRC_EOP,
        ];
        self.retrying(&frame, &mut [])
    }
}

impl<S: SerialLine> Programmer for Stk500<S> {
    fn kind(&self) -> &'static str {
        match self.variant {
            Variant::Stk500 => "STK500",
            Variant::Bootloader => "Arduino",
            Variant::Mib510 => "MIB510",
        }
    }

    fn enable(&mut self, part: &mut Part) -> Result<()> {
        // Drain any extraneous input before the handshake.
        self.conn.drain()?;

        if self.variant == Variant::Mib510 {
            self.mib510_isp(1)?;
        }

        self.get_sync()?;

        if let Some(period) = self.bitclock {
            self.set_sck_period(period)?;
        }

        if self.variant == Variant::Bootloader {
            // Bootloaders only do paged EEPROM access; pretend unpaged
            // EEPROMs have 16-byte pages.
            if let Some(eeprom) = part.memories.iter_mut().find(|m| m.is_eeprom()) {
                if eeprom.page_size == 1 {
                    eeprom.page_size = 16;
                }
            }
        }
        Ok(())
    }

    fn initialize(&mut self, part: &Part) -> Result<()> {
        if self.variant != Variant::Bootloader {
            let maj = self.get_parameter(proto::PARM_SW_MAJOR)?;
            let min = self.get_parameter(proto::PARM_SW_MINOR)?;
            log::debug!("programmer firmware {}.{}", maj, min);

            let n_extparms = if self.variant == Variant::Mib510 {
                0
            } else if (maj, min) > (1, 10) {
                4
            } else {
                3
            };

            self.set_device(part)?;
            if n_extparms > 0 {
                self.set_device_ext(part, n_extparms)?;
            }
        }

        if let Some(v) = self.vtarget {
            self.set_vtarget(v)?;
        }
        if let Some(v) = self.varef {
            self.set_varef(v)?;
        }
        if let Some(v) = self.fosc {
            self.set_fosc(v)?;
        }

        self.program_enable(part)
    }

    fn program_enable(&mut self, _part: &Part) -> Result<()> {
        let frame = [proto::ENTER_PROGMODE, proto::CRC_EOP];
        self.retrying(&frame, &mut [])
    }

    fn chip_erase(&mut self, part: &Part) -> Result<()> {
        chip_erase_default(self, part)
    }

    fn cmd(&mut self, cmd: &[u8; 4]) -> Result<[u8; 4]> {
        let frame = [
            proto::UNIVERSAL,
            cmd[0],
            cmd[1],
            cmd[2],
            cmd[3],
            proto::CRC_EOP,
        ];
        self.conn.send(&frame)?;

        let first = self.recv1()?;
        if first != proto::RESP_INSYNC {
            return Err(Error::Desync(first));
        }

        // The programmer only forwards the final MISO byte; the first
        // three are the target's echo of our own command bytes.
        let mut res = [cmd[1], cmd[2], cmd[3], 0];
        let mut last = [0u8; 1];
        self.conn.recv(&mut last)?;
        res[3] = last[0];

        let status = self.recv1()?;
        if status != proto::RESP_OK {
            return Err(Error::UnknownResponse(status));
        }
        Ok(res)
    }

    fn ext_addr(&mut self) -> Option<&mut ExtAddr> {
        Some(&mut self.ext_addr)
    }

    fn paged_load(&mut self, part: &Part, mem: &Memory, addr: u32, buf: &mut [u8]) -> Result<usize> {
        let (memchr, a_div) = self.block_params(part, mem)?;
        let page_size = mem.page_size.max(1) as usize;
        let final_ok = if self.variant == Variant::Mib510 {
            // MIB510 terminates READ_PAGE with a second INSYNC.
            proto::RESP_INSYNC
        } else {
            proto::RESP_OK
        };

        let n_bytes = buf.len();
        let mut offset = 0usize;
        while offset < n_bytes {
            let block_size = if self.variant == Variant::Mib510 {
                256.min(n_bytes - offset)
            } else {
                page_size.min(n_bytes - offset)
            };
            let block_addr = addr + offset as u32;

            let mut tries = 0;
            loop {
                tries += 1;
                self.load_addr(mem, block_addr, a_div)?;
                let frame = [
                    proto::READ_PAGE,
                    (block_size >> 8) as u8,
                    block_size as u8,
                    memchr,
                    proto::CRC_EOP,
                ];
                let payload = &mut buf[offset..offset + block_size];
                if self.exchange_with(&frame, payload, final_ok)? {
                    break;
                }
                if tries > MAX_PROGRAM_ENABLE_RETRIES {
                    return Err(Error::SyncRetries(tries));
                }
                self.get_sync()?;
            }
            offset += block_size;
        }
        Ok(n_bytes)
    }

    fn paged_write(&mut self, part: &Part, mem: &Memory, addr: u32, buf: &[u8]) -> Result<usize> {
        let (memchr, a_div) = self.block_params(part, mem)?;
        let page_size = mem.page_size.max(1) as usize;

        let n_bytes = buf.len();
        let mut offset = 0usize;
        while offset < n_bytes {
            let block_size = if self.variant == Variant::Mib510 {
                256.min(n_bytes - offset)
            } else {
                page_size.min(n_bytes - offset)
            };
            let block_addr = addr + offset as u32;

            let mut tries = 0;
            loop {
                tries += 1;
                self.load_addr(mem, block_addr, a_div)?;

                // One send for the whole block; splitting it into many
                // small writes crashes some USB serial drivers.
                let mut frame = Vec::with_capacity(block_size + 5);
                frame.push(proto::PROG_PAGE);
                frame.push((block_size >> 8) as u8);
                frame.push(block_size as u8);
                frame.push(memchr);
                frame.extend_from_slice(&buf[offset..offset + block_size]);
                frame.push(proto::CRC_EOP);

                if self.exchange(&frame, &mut [])? {
                    break;
                }
                if tries > MAX_PROGRAM_ENABLE_RETRIES {
                    return Err(Error::SyncRetries(tries));
                }
                self.get_sync()?;
            }
            offset += block_size;
        }
        Ok(n_bytes)
    }

    fn set_sck_period(&mut self, period: f64) -> Result<()> {
        // Each count of SCK_DURATION is 8/xtal seconds; the STK500 bit
        // bangs SCK, so short durations come out somewhat wide.
        let min = 8.0 / self.xtal as f64;
        let max = 255.0 * min;
        let mut dur = (period / min + 0.5) as u32;
        if period < min {
            dur = 1;
            log::warn!("p = {:.1} us too small, using {:.1} us", period / 1e-6, min / 1e-6);
        } else if period > max {
            dur = 255;
            log::warn!("p = {:.1} us too large, using {:.1} us", period / 1e-6, max / 1e-6);
        }
        self.set_parameter(proto::PARM_SCK_DURATION, dur as u8)
    }

    fn set_vtarget(&mut self, v: f64) -> Result<()> {
        let utarg = ((v + 0.049) * 10.0) as u8;
        let uaref = self.get_parameter(proto::PARM_VADJUST)?;
        if uaref > utarg {
            log::warn!(
                "reducing V[aref] from {:.1} to {:.1}",
                uaref as f64 / 10.0,
                v
            );
            self.set_parameter(proto::PARM_VADJUST, utarg)?;
        }
        self.set_parameter(proto::PARM_VTARGET, utarg)
    }

    fn set_varef(&mut self, v: f64) -> Result<()> {
        let uaref = ((v + 0.049) * 10.0) as u8;
        let utarg = self.get_parameter(proto::PARM_VTARGET)?;
        if uaref > utarg {
            return Err(Error::InvalidParameter(format!(
                "V[aref] must not be greater than V[target] = {:.1}",
                utarg as f64 / 10.0
            )));
        }
        self.set_parameter(proto::PARM_VADJUST, uaref)
    }

    fn set_fosc(&mut self, v: f64) -> Result<()> {
        const PRESCALERS: [u32; 7] = [1, 8, 32, 64, 128, 256, 1024];

        let mut prescale = 0u8;
        let mut cmatch = 0u8;
        if v > 0.0 {
            let fosc = if v > self.xtal as f64 / 2.0 {
                log::warn!(
                    "f = {:.3} Hz too high, using {:.3} MHz",
                    v,
                    self.xtal as f64 / 2e6
                );
                self.xtal / 2
            } else {
                v as u32
            };

            let mut found = false;
            for (idx, ps) in PRESCALERS.iter().enumerate() {
                if fosc >= self.xtal / (256 * ps * 2) {
                    prescale = idx as u8 + 1;
                    cmatch = (self.xtal / (2 * fosc * ps) - 1) as u8;
                    found = true;
                    break;
                }
            }
            if !found {
                let fmin = self.xtal / (256 * 1024 * 2);
                log::warn!("f = {} Hz too low, using {} Hz", fosc, fmin);
                prescale = PRESCALERS.len() as u8;
                cmatch = 255;
            }
        }

        self.set_parameter(proto::PARM_OSC_PSCALE, prescale)?;
        self.set_parameter(proto::PARM_OSC_CMATCH, cmatch)
    }

    fn display(&mut self) -> Result<()> {
        let hdw = self.get_parameter(proto::PARM_HW_VER)?;
        let maj = self.get_parameter(proto::PARM_SW_MAJOR)?;
        let min = self.get_parameter(proto::PARM_SW_MINOR)?;
        log::info!("Hardware version: {}", hdw);
        log::info!("Firmware version: {}.{}", maj, min);

        if self.variant == Variant::Stk500 {
            let topcard = self.get_parameter(proto::PARM_TOPCARD_DETECT)?;
            match topcard {
                1 => log::info!("Topcard         : STK502"),
                2 => log::info!("Topcard         : STK501"),
                _ => {}
            }
            let vtarget = self.get_parameter(proto::PARM_VTARGET)?;
            let vadjust = self.get_parameter(proto::PARM_VADJUST)?;
            log::info!("Vtarget         : {:.1} V", vtarget as f64 / 10.0);
            log::info!("Varef           : {:.1} V", vadjust as f64 / 10.0);

            let osc_pscale = self.get_parameter(proto::PARM_OSC_PSCALE)?;
            let osc_cmatch = self.get_parameter(proto::PARM_OSC_CMATCH)?;
            if osc_pscale == 0 {
                log::info!("Oscillator      : Off");
            } else {
                let prescale = [1u32, 8, 32, 64, 128, 256, 1024]
                    [(osc_pscale as usize - 1).min(6)];
                let f = self.xtal as f64 / 2.0 / prescale as f64 / (osc_cmatch as f64 + 1.0);
                log::info!("Oscillator      : {:.3} Hz", f);
            }

            let sck = self.get_parameter(proto::PARM_SCK_DURATION)?;
            log::info!(
                "SCK period      : {:.1} us",
                sck as f64 * 8.0e6 / self.xtal as f64 + 0.0499
            );
        }
        Ok(())
    }

    fn disable(&mut self) -> Result<()> {
        let frame = [proto::LEAVE_PROGMODE, proto::CRC_EOP];
        self.retrying(&frame, &mut [])
    }

    fn close(&mut self) {
        if self.variant == Variant::Mib510 {
            if let Err(e) = self.mib510_isp(0) {
                log::warn!("MIB510 close failed: {}", e);
            }
        }
    }
}

fn parse_freq(s: &str) -> Option<f64> {
    let s = s.trim();
    let (digits, mult) = if let Some(v) = s.strip_suffix("M").or_else(|| s.strip_suffix("MHz")) {
        (v, 1e6)
    } else if let Some(v) = s.strip_suffix("k").or_else(|| s.strip_suffix("kHz")) {
        (v, 1e3)
    } else if let Some(v) = s.strip_suffix("Hz") {
        (v, 1.0)
    } else {
        (s, 1.0)
    };
    digits.trim().parse::<f64>().ok().map(|v| v * mult)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::PartDb;
    use crate::transport;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Scripted serial endpoint: every expected write is paired with the
    /// bytes the fake programmer feeds back.
    struct MockLine {
        script: VecDeque<(Vec<u8>, Vec<u8>)>,
        read_buf: VecDeque<u8>,
        sent: Vec<Vec<u8>>,
        dtr_rts: Vec<bool>,
    }

    impl MockLine {
        fn new(script: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
            MockLine {
                script: script.into(),
                read_buf: VecDeque::new(),
                sent: Vec::new(),
                dtr_rts: Vec::new(),
            }
        }

        fn finished(&self) -> bool {
            self.script.is_empty()
        }
    }

    impl SerialLine for MockLine {
        fn send(&mut self, buf: &[u8]) -> transport::Result<()> {
            self.sent.push(buf.to_vec());
            let (expected, reply) = self
                .script
                .pop_front()
                .unwrap_or_else(|| panic!("unexpected write: {:02x?}", buf));
            assert_eq!(buf, &expected[..], "wire bytes differ");
            self.read_buf.extend(reply);
            Ok(())
        }

        fn recv(&mut self, buf: &mut [u8]) -> transport::Result<()> {
            for slot in buf.iter_mut() {
                *slot = self.read_buf.pop_front().ok_or_else(|| {
                    transport::Error::Io(std::io::Error::from(std::io::ErrorKind::TimedOut))
                })?;
            }
            Ok(())
        }

        fn drain(&mut self) -> transport::Result<()> {
            self.read_buf.clear();
            Ok(())
        }

        fn set_dtr_rts(&mut self, level: bool) -> transport::Result<()> {
            self.dtr_rts.push(level);
            Ok(())
        }

        fn set_timeout(&mut self, _timeout: Duration) -> transport::Result<()> {
            Ok(())
        }
    }

    const SYNC: &[u8] = &[0x30, 0x20];

    fn sync_preamble() -> Vec<(Vec<u8>, Vec<u8>)> {
        vec![
            (SYNC.to_vec(), vec![]),
            (SYNC.to_vec(), vec![]),
            (SYNC.to_vec(), vec![0x14, 0x10]),
        ]
    }

    #[test]
    fn sync_recovers_from_line_noise() {
        // Garbage on the first two attempts, INSYNC/OK on the third.
        let script = vec![
            (SYNC.to_vec(), vec![]),
            (SYNC.to_vec(), vec![]),
            (SYNC.to_vec(), vec![0x42]),
            (SYNC.to_vec(), vec![0x99]),
            (SYNC.to_vec(), vec![0x14, 0x10]),
        ];
        let mut pgm = Stk500::new(MockLine::new(script), Variant::Stk500);
        pgm.get_sync().unwrap();
        assert_eq!(pgm.sync_attempts_used(), 3);
        assert!(pgm.conn.finished());
    }

    #[test]
    fn sync_gives_up_after_bounded_attempts() {
        let mut script = vec![(SYNC.to_vec(), vec![]), (SYNC.to_vec(), vec![])];
        for _ in 0..MAX_SYNC_ATTEMPTS {
            script.push((SYNC.to_vec(), vec![0x00]));
        }
        let mut pgm = Stk500::new(MockLine::new(script), Variant::Stk500);
        let err = pgm.get_sync().unwrap_err();
        assert!(matches!(err, Error::SyncRetries(n) if n == MAX_SYNC_ATTEMPTS));
    }

    #[test]
    fn universal_command_frames_and_synthesizes_echo() {
        // Program enable for an ATmega328P through the passthrough:
        // 0x56 ac 53 00 00 0x20 on the wire, data byte 0x53 echoed back.
        let script = vec![(
            vec![0x56, 0xac, 0x53, 0x00, 0x00, 0x20],
            vec![0x14, 0x53, 0x10],
        )];
        let mut pgm = Stk500::new(MockLine::new(script), Variant::Stk500);
        let res = pgm.cmd(&[0xac, 0x53, 0x00, 0x00]).unwrap();
        assert_eq!(res, [0x53, 0x00, 0x00, 0x53]);
        assert!(pgm.conn.finished());
    }

    #[test]
    fn program_enable_resyncs_on_nosync() {
        let mut script = vec![(vec![0x50, 0x20], vec![0x15])];
        script.extend(sync_preamble());
        script.push((vec![0x50, 0x20], vec![0x14, 0x10]));
        let part = PartDb::find("m328p").unwrap();
        let mut pgm = Stk500::new(MockLine::new(script), Variant::Stk500);
        pgm.program_enable(&part).unwrap();
        assert!(pgm.conn.finished());
    }

    #[test]
    fn program_enable_reports_no_device() {
        let script = vec![(vec![0x50, 0x20], vec![0x14, 0x13])];
        let part = PartDb::find("m328p").unwrap();
        let mut pgm = Stk500::new(MockLine::new(script), Variant::Stk500);
        assert!(matches!(
            pgm.program_enable(&part).unwrap_err(),
            Error::NoDevice
        ));
    }

    #[test]
    fn paged_write_one_flash_page() {
        let part = PartDb::find("m328p").unwrap();
        let flash = part.flash().unwrap().clone();
        let data = vec![0xabu8; 128];

        // Word address 0x40 for byte address 0x80.
        let mut page_frame = vec![0x64, 0x00, 0x80, b'F'];
        page_frame.extend_from_slice(&data);
        page_frame.push(0x20);

        let script = vec![
            (vec![0x55, 0x40, 0x00, 0x20], vec![0x14, 0x10]),
            (page_frame, vec![0x14, 0x10]),
        ];
        let mut pgm = Stk500::new(MockLine::new(script), Variant::Stk500);
        let n = pgm.paged_write(&part, &flash, 0x80, &data).unwrap();
        assert_eq!(n, 128);
        assert!(pgm.conn.finished());
    }

    #[test]
    fn paged_load_latches_ext_addr_once_per_segment() {
        let part = PartDb::find("m2560").unwrap();
        let flash = part.flash().unwrap().clone();

        let read_page = |addr_lo: u8, addr_hi: u8| -> Vec<(Vec<u8>, Vec<u8>)> {
            vec![
                (vec![0x55, addr_lo, addr_hi, 0x20], vec![0x14, 0x10]),
                (
                    vec![0x74, 0x01, 0x00, b'F', 0x20],
                    {
                        let mut r = vec![0x14];
                        r.extend(std::iter::repeat(0xee).take(256));
                        r.push(0x10);
                        r
                    },
                ),
            ]
        };

        let mut script = Vec::new();
        // Block 1, byte 0x1fe00 = word 0xff00: first latch of segment 0.
        script.push((
            vec![0x56, 0x4d, 0x00, 0x00, 0x00, 0x20],
            vec![0x14, 0x00, 0x10],
        ));
        script.extend(read_page(0x00, 0xff));
        // Block 2, word 0xff80: same segment, no latch.
        script.extend(read_page(0x80, 0xff));
        // Block 3, word 0x10000: exactly one more latch.
        script.push((
            vec![0x56, 0x4d, 0x00, 0x01, 0x00, 0x20],
            vec![0x14, 0x00, 0x10],
        ));
        script.extend(read_page(0x00, 0x00));

        let mut pgm = Stk500::new(MockLine::new(script), Variant::Stk500);
        let mut buf = vec![0u8; 768];
        pgm.paged_load(&part, &flash, 0x1fe00, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xee));
        assert!(pgm.conn.finished());
    }

    #[test]
    fn bootloader_toggles_reset_lines_between_sync_attempts() {
        let script = vec![
            (SYNC.to_vec(), vec![]),
            (SYNC.to_vec(), vec![]),
            (SYNC.to_vec(), vec![0x00]),
            (SYNC.to_vec(), vec![0x14, 0x10]),
        ];
        let mut pgm = Stk500::new(MockLine::new(script), Variant::Bootloader);
        pgm.get_sync().unwrap();
        // One low/high pulse before the second attempt.
        assert_eq!(pgm.conn.dtr_rts, vec![true, false]);
    }

    #[test]
    fn bootloader_forces_paged_eeprom() {
        let script = sync_preamble();
        let mut part = PartDb::find("m328p").unwrap();
        // Pretend the part table declared byte-wise EEPROM access.
        for m in part.memories.iter_mut() {
            if m.is_eeprom() {
                m.page_size = 1;
            }
        }
        let mut pgm = Stk500::new(MockLine::new(script), Variant::Bootloader);
        pgm.enable(&mut part).unwrap();
        assert_eq!(part.eeprom().unwrap().page_size, 16);
    }

    #[test]
    fn bootloader_addressing_is_word_for_classic_parts() {
        let part = PartDb::find("m328p").unwrap();
        let pgm = Stk500::new(MockLine::new(vec![]), Variant::Bootloader);
        let (memchr, a_div) = pgm.block_params(&part, part.flash().unwrap()).unwrap();
        assert_eq!((memchr, a_div), (b'F', 2));
        let (memchr, a_div) = pgm.block_params(&part, part.eeprom().unwrap()).unwrap();
        assert_eq!((memchr, a_div), (b'E', 2));
    }

    #[test]
    fn sck_period_quantises_and_clamps() {
        // 10 us at 7.3728 MHz xtal: 10e-6 / (8/7372800) + 0.5 = 9.7 -> 9.
        let script = vec![(vec![0x40, 0x89, 9, 0x20], vec![0x14, 0x10])];
        let mut pgm = Stk500::new(MockLine::new(script), Variant::Stk500);
        pgm.set_sck_period(10e-6).unwrap();

        let script = vec![(vec![0x40, 0x89, 255, 0x20], vec![0x14, 0x10])];
        let mut pgm = Stk500::new(MockLine::new(script), Variant::Stk500);
        pgm.set_sck_period(1.0).unwrap();

        let script = vec![(vec![0x40, 0x89, 1, 0x20], vec![0x14, 0x10])];
        let mut pgm = Stk500::new(MockLine::new(script), Variant::Stk500);
        pgm.set_sck_period(1e-9).unwrap();
    }

    #[test]
    fn fosc_uses_prescaler_table() {
        // 1 kHz: prescaler 32 (idx 2 -> value 3), cmatch = 7372800/(2*1000*32)-1 = 114.
        let script = vec![
            (vec![0x40, 0x86, 3, 0x20], vec![0x14, 0x10]),
            (vec![0x40, 0x87, 114, 0x20], vec![0x14, 0x10]),
        ];
        let mut pgm = Stk500::new(MockLine::new(script), Variant::Stk500);
        pgm.set_fosc(1000.0).unwrap();
        assert!(pgm.conn.finished());
    }
}
