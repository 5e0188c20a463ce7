//! Bus Pirate driver.
//!
//! The Bus Pirate is a universal serial gadget with two faces: a binary
//! "BBIO" protocol entered by flooding the line with NULs, and the
//! human-oriented text CLI it boots into. The driver prefers binary SPI
//! mode and falls back to driving the text menus when the binary banner
//! never shows up (old firmware). Newer firmwares add an "AVR Extended
//! Commands" subset used for bulk flash reads, and a write-then-read
//! instruction that makes paged writes practical.
//!
//! Wiring: CS to RESET, SDO/SDI/CLK to the ISP lines, optionally AUX to
//! XTAL1 for targets that need an external clock.

use scroll::{BE, Pwrite};

use crate::opcode::OpKind;
use crate::part::{Memory, Part};
use crate::transport::SerialLine;

use super::{
    Error, Programmer, Result, chip_erase_default, paged_load_bytewise, paged_write_bytewise,
    program_enable_default, usleep, write_page,
};

/// CS and AUX pin bits in the 0100wxyz peripheral-config command.
const BP_RESET_CS: u8 = 0x01;
const BP_RESET_AUX: u8 = 0x02;
const BP_RESET_AUX2: u8 = 0x04;

/// Binary-mode command bytes.
const BIN_RESET_BITBANG: u8 = 0x00;
const BIN_ENTER_SPI: u8 = 0x01;
const BIN_WRITE_THEN_READ: u8 = 0x05;
const BIN_AVR_EXTENDED: u8 = 0x06;
const BIN_HW_RESET: u8 = 0x0f;
const BIN_PWM_SETUP: u8 = 0x12;
const BIN_PWM_STOP: u8 = 0x13;
const BIN_BULK_SPI: u8 = 0x10;
const BIN_PERIPHERALS: u8 = 0x40;
const BIN_SET_SPEED: u8 = 0x60;

/// SPI config bits: 3.3 V drive, clock idle low, data on trailing edge,
/// sample in the middle.
const SPI_CONFIG_DEFAULT: u8 = 0x8a;
const SPI_CONFIG_3V3: u8 = 1 << 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Driving the text CLI (also the state before `enable`).
    Text,
    /// Binary SPI submode.
    Binary,
}

pub struct BusPirate<S: SerialLine> {
    conn: S,
    mode: Mode,
    reset: u8,
    spifreq: u8,
    spifreq_set: bool,
    force_ascii: bool,
    nopagedwrite: bool,
    nopagedread: bool,
    pullups: bool,
    hiz: bool,
    cpufreq: Option<u16>,
    serial_recv_timeout: Option<u64>,
    peripherals: u8,
    binmode_version: u8,
    submode_version: u8,
}

impl<S: SerialLine> BusPirate<S> {
    pub fn new(conn: S) -> Self {
        BusPirate {
            conn,
            mode: Mode::Text,
            reset: 0,
            spifreq: 0,
            spifreq_set: false,
            force_ascii: false,
            nopagedwrite: false,
            nopagedread: false,
            pullups: false,
            hiz: false,
            cpufreq: None,
            serial_recv_timeout: None,
            peripherals: 0,
            binmode_version: 0,
            submode_version: 0,
        }
    }

    pub fn parse_extended_params(&mut self, params: &[String]) -> Result<()> {
        for p in params {
            if p == "ascii" {
                self.force_ascii = true;
            } else if p == "pullups" {
                self.pullups = true;
            } else if p == "hiz" {
                self.hiz = true;
            } else if p == "nopagedwrite" {
                self.nopagedwrite = true;
            } else if p == "nopagedread" {
                self.nopagedread = true;
            } else if let Some(v) = p.strip_prefix("spifreq=") {
                let f: u8 = v.parse().map_err(|_| Error::InvalidParameter(p.clone()))?;
                if f & !0x07 != 0 {
                    return Err(Error::InvalidParameter(p.clone()));
                }
                self.spifreq = f;
                self.spifreq_set = true;
            } else if let Some(v) = p.strip_prefix("cpufreq=") {
                let khz: u16 = v.parse().map_err(|_| Error::InvalidParameter(p.clone()))?;
                // Lower bound comes from cpufreq > 4x the ASCII-mode SPI clock.
                if !(125..=4000).contains(&khz) {
                    return Err(Error::InvalidParameter(p.clone()));
                }
                self.cpufreq = Some(khz);
            } else if let Some(v) = p.strip_prefix("serial_recv_timeout=") {
                let ms: u64 = v.parse().map_err(|_| Error::InvalidParameter(p.clone()))?;
                if ms == 0 {
                    return Err(Error::InvalidParameter(p.clone()));
                }
                self.serial_recv_timeout = Some(ms);
            } else if let Some(v) = p.strip_prefix("reset=") {
                for pin in v.split(',') {
                    self.reset |= match pin.to_ascii_lowercase().as_str() {
                        "cs" => BP_RESET_CS,
                        "aux" | "aux1" => BP_RESET_AUX,
                        "aux2" => BP_RESET_AUX2,
                        _ => return Err(Error::InvalidParameter(p.clone())),
                    };
                }
            } else {
                return Err(Error::InvalidParameter(p.clone()));
            }
        }
        Ok(())
    }

    fn verify_config(&mut self) -> Result<()> {
        if self.reset == 0 {
            self.reset = BP_RESET_CS;
        }
        if self.reset != BP_RESET_CS && self.force_ascii {
            return Err(Error::InvalidParameter(
                "RESET pin other than CS is not supported in ASCII mode".to_string(),
            ));
        }
        if self.spifreq_set && self.force_ascii {
            return Err(Error::InvalidParameter(
                "SPI speed selection is not supported in ASCII mode".to_string(),
            ));
        }
        Ok(())
    }

    // --- binary-mode plumbing ---

    fn send_bin(&mut self, data: &[u8]) -> Result<()> {
        log::trace!("bp => {}", hex::encode(data));
        self.conn.send(data)?;
        Ok(())
    }

    fn recv_bin(&mut self, buf: &mut [u8]) -> Result<()> {
        self.conn.recv(buf)?;
        log::trace!("bp <= {}", hex::encode(&buf[..]));
        Ok(())
    }

    fn expect_bin(&mut self, send: &[u8], expect: &[u8]) -> Result<bool> {
        self.send_bin(send)?;
        let mut got = vec![0u8; expect.len()];
        match self.recv_bin(&mut got) {
            Ok(()) => Ok(got == expect),
            // A silent device is a mismatch, not a session killer.
            Err(Error::Transport(ref e)) if e.is_timeout() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn expect_bin_byte(&mut self, send: u8, expect: u8) -> Result<bool> {
        self.expect_bin(&[send], &[expect])
    }

    /// Try to bring the device into binary SPI mode. `Ok(false)` means the
    /// BBIO banner never appeared and the caller should fall back to the
    /// text CLI.
    fn start_mode_bin(&mut self) -> Result<bool> {
        // Twenty NULs flip the text UI into binary mode.
        self.send_bin(&[0u8; 20])?;

        let mut banner = [0u8; 5];
        match self.recv_bin(&mut banner) {
            Ok(()) => {}
            Err(Error::Transport(ref e)) if e.is_timeout() => return Ok(false),
            Err(e) => return Err(e),
        }
        if &banner[..4] != b"BBIO" || !banner[4].is_ascii_digit() {
            log::warn!("binary mode not confirmed: {:?}", banner);
            return Ok(false);
        }
        self.binmode_version = banner[4] - b'0';
        log::debug!("BusPirate binmode version: {}", self.binmode_version);
        self.mode = Mode::Binary;

        if let Some(khz) = self.cpufreq {
            // 32 MHz oscillator, no prescaler; 50% duty clock on AUX.
            let period: u16 = 16_000 / khz - 1;
            let duty = period / 2;
            let mut pwm = [0u8; 6];
            pwm[0] = BIN_PWM_SETUP;
            pwm[1] = 0;
            pwm.pwrite_with::<u16>(duty, 2, BE).unwrap();
            pwm.pwrite_with::<u16>(period, 4, BE).unwrap();
            self.send_bin(&pwm)?;
            let mut ack = [0u8; 1];
            self.recv_bin(&mut ack)?;
            if ack[0] != 0x01 {
                log::error!("cpufreq (PWM) setup failed");
            }
        }

        self.send_bin(&[BIN_ENTER_SPI])?;
        let mut sub = [0u8; 4];
        self.recv_bin(&mut sub)?;
        if &sub[..3] != b"SPI" || !sub[3].is_ascii_digit() {
            log::warn!("SPI mode not confirmed: {:?}", sub);
            // Leave binary mode again before the text fallback takes over.
            let _ = self.reset_from_binmode();
            return Ok(false);
        }
        self.submode_version = sub[3] - b'0';
        log::debug!("BusPirate SPI version: {}", self.submode_version);

        if self.nopagedwrite {
            log::debug!("paged flash write disabled");
        } else {
            // Probe for write-then-read without CS toggling; firmwares
            // older than 5.10 lack it and cannot do paged writes.
            if self.expect_bin(&[BIN_WRITE_THEN_READ, 0, 0, 0, 0], &[0x01])? {
                log::info!("paged flash write enabled");
            } else {
                self.nopagedwrite = true;
                // The NULs of the probe dropped us to raw bitbang; get
                // back into SPI and flush whatever is left.
                self.send_bin(&[BIN_ENTER_SPI])?;
                log::debug!("disabling paged flash write (need firmware >= v5.10)");
                self.conn.drain()?;
            }
        }

        // Power on, pull the reset pin(s) high.
        self.peripherals = 0x48 | self.reset;
        let mut config = SPI_CONFIG_DEFAULT;
        if self.pullups {
            self.peripherals |= 1 << 2;
            config &= !SPI_CONFIG_3V3;
        }
        if self.hiz {
            config &= !SPI_CONFIG_3V3;
        }
        let peripherals = self.peripherals;
        if !self.expect_bin_byte(peripherals, 0x01)? {
            log::warn!("no response to peripheral config");
        }
        usleep(50_000); // let the supplies settle

        if !self.expect_bin_byte(BIN_SET_SPEED | self.spifreq, 0x01)? {
            log::warn!("no response to speed selection");
        }

        if !self.expect_bin_byte(config, 0x01)? {
            log::warn!("no response to SPI config");
        }

        if self.nopagedread {
            log::debug!("paged flash read disabled");
        } else if self.expect_bin_byte(BIN_AVR_EXTENDED, 0x01)? {
            self.send_bin(&[0x01])?;
            let mut ver = [0u8; 3];
            self.recv_bin(&mut ver)?;
            log::debug!(
                "AVR Extended Commands version {}",
                u16::from(ver[1]) << 8 | u16::from(ver[2])
            );
        } else {
            log::debug!("AVR Extended Commands not found");
            self.nopagedread = true;
        }

        Ok(true)
    }

    /// Exit binary mode: back to bitbang, peripherals off, hardware reset,
    /// then swallow output until the text prompt reappears.
    fn reset_from_binmode(&mut self) -> Result<()> {
        self.send_bin(&[BIN_RESET_BITBANG])?;
        let mut banner = [0u8; 5];
        let _ = self.recv_bin(&mut banner);

        if self.cpufreq.is_some() && !self.expect_bin_byte(BIN_PWM_STOP, 0x01).unwrap_or(false) {
            log::error!("no response to stop PWM command");
        }

        self.send_bin(&[BIN_PERIPHERALS])?;
        let mut off = [0u8; 1];
        if self.recv_bin(&mut off).is_err() || off[0] == 0x00 {
            log::error!("no response to power off command");
        }

        self.send_bin(&[BIN_HW_RESET])?;

        let mut line = Vec::new();
        loop {
            let mut b = [0u8; 1];
            match self.conn.recv(&mut b) {
                Ok(()) => {
                    line.push(b[0]);
                    if b[0] == b'>' {
                        self.mode = Mode::Text;
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        if self.mode != Mode::Text {
            log::error!("reset failed; you may need to powercycle the BusPirate");
            return Err(Error::Failed);
        }
        log::debug!("BusPirate is back in text mode");
        Ok(())
    }

    // --- text-mode plumbing ---

    fn getc(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.conn.recv(&mut b)?;
        Ok(b[0])
    }

    /// Read one line, retaining the terminating newline. A read timeout
    /// returns the partial buffer, which is how prompts (no newline)
    /// arrive; an empty timeout is an error.
    fn readline(&mut self) -> Result<String> {
        let mut line = Vec::new();
        loop {
            match self.getc() {
                Ok(b'\r') => continue,
                Ok(b'\n') => {
                    line.push(b'\n');
                    break;
                }
                Ok(b) => line.push(b),
                Err(Error::Transport(ref e)) if e.is_timeout() => break,
                Err(e) => return Err(e),
            }
        }
        if line.is_empty() {
            return Err(Error::NoDevice);
        }
        let s = String::from_utf8_lossy(&line).into_owned();
        log::trace!("bp <= {:?}", s);
        Ok(s)
    }

    /// Send a text command and swallow the device's echo of it.
    fn ascii_send(&mut self, cmd: &str) -> Result<()> {
        log::trace!("bp => {:?}", cmd);
        self.conn.send(cmd.as_bytes())?;
        loop {
            let line = self.readline()?;
            if line.trim_end_matches('\n') == cmd.trim_end_matches('\n') {
                return Ok(());
            }
        }
    }

    fn is_prompt(line: &str) -> bool {
        let t = line.trim_end_matches('\n');
        t.ends_with('>') || t.ends_with("> ")
    }

    /// Send `cmd`, scan replies for a line starting with `expect`, reading
    /// on until the prompt when asked to.
    fn ascii_expect(&mut self, cmd: &str, expect: &str, wait_for_prompt: bool) -> Result<bool> {
        self.ascii_send(cmd)?;
        let mut got_it = false;
        loop {
            let line = self.readline()?;
            if line.starts_with(expect) {
                if !wait_for_prompt {
                    self.conn.drain()?;
                    return Ok(true);
                }
                got_it = true;
            }
            if Self::is_prompt(&line) {
                break;
            }
        }
        Ok(got_it)
    }

    /// Walk the `m` menu to the SPI entry and pick 3.3 V outputs.
    fn start_spi_mode_ascii(&mut self) -> Result<()> {
        self.ascii_send("m\n")?;
        let mut spi_cmd = None;
        loop {
            let line = self.readline()?;
            if spi_cmd.is_none() {
                let mut words = line.split_whitespace();
                if let (Some(num), Some(mode)) = (words.next(), words.next()) {
                    if mode == "SPI" {
                        if let Ok(n) = num.trim_end_matches('.').parse::<u32>() {
                            spi_cmd = Some(n);
                        }
                    }
                }
            }
            if Self::is_prompt(&line) {
                break;
            }
        }
        let Some(spi_cmd) = spi_cmd else {
            log::error!("SPI mode number not found; try powercycling the BusPirate");
            return Err(Error::NoDevice);
        };

        self.ascii_send(&format!("{}\n", spi_cmd))?;
        let mut answer = String::new();
        loop {
            let line = self.readline()?;
            if line.contains("Normal (H=3.3V, L=GND)") {
                // Firmware 2.1 defaults to open drain, which needs
                // pull-ups the ISP header rarely has; pick 3.3 V drive.
                if let Some(num) = line.split_whitespace().next() {
                    answer = format!("{}\n", num.trim_end_matches('.'));
                }
            }
            if Self::is_prompt(&line) {
                if line.starts_with("SPI>") {
                    log::info!("BusPirate is now configured for SPI");
                    return Ok(());
                }
                if answer.is_empty() {
                    self.ascii_send("\n")?;
                } else {
                    let a = std::mem::take(&mut answer);
                    self.ascii_send(&a)?;
                }
            }
        }
    }

    fn powerup(&mut self) -> Result<()> {
        match self.mode {
            // Binary-mode power-up happened with the peripheral config.
            Mode::Binary => Ok(()),
            Mode::Text => {
                if self.ascii_expect("W\n", "POWER SUPPLIES ON", true)? {
                    Ok(())
                } else {
                    log::warn!("no response to PowerUp command; trying to continue anyway");
                    Ok(())
                }
            }
        }
    }

    fn cmd_bin(&mut self, cmd: &[u8; 4]) -> Result<[u8; 4]> {
        // 0001xxxx: bulk SPI transfer of 1-16 bytes (0 means 1).
        if !self.expect_bin_byte(BIN_BULK_SPI | 0x03, 0x01)? {
            return Err(Error::Desync(0));
        }
        self.send_bin(cmd)?;
        let mut res = [0u8; 4];
        self.recv_bin(&mut res)?;
        Ok(res)
    }

    fn cmd_ascii(&mut self, cmd: &[u8; 4]) -> Result<[u8; 4]> {
        let line = format!(
            "0x{:02x} 0x{:02x} 0x{:02x} 0x{:02x}\n",
            cmd[0], cmd[1], cmd[2], cmd[3]
        );
        self.ascii_send(&line)?;

        let mut res = [0u8; 4];
        let mut i = 0;
        while i < 4 {
            let line = self.readline()?;
            if let Some(byte) = parse_spi_reply(&line) {
                res[i] = byte;
                i += 1;
            }
            if Self::is_prompt(&line) {
                break;
            }
        }
        if i != 4 {
            log::error!("SPI has not read 4 bytes back");
            return Err(Error::UnknownResponse(0));
        }

        // Eat the prompt so the next command starts clean.
        while self.getc()? != b'>' {}
        Ok(res)
    }

    fn avr_extended_paged_load(&mut self, addr: u32, buf: &mut [u8]) -> Result<usize> {
        // Extended command 6/2: bulk flash read. Word start address and
        // byte count, both big-endian.
        let mut header = [0u8; 10];
        header[0] = BIN_AVR_EXTENDED;
        header[1] = 0x02;
        header.pwrite_with::<u32>(addr >> 1, 2, BE).unwrap();
        header.pwrite_with::<u32>(buf.len() as u32, 6, BE).unwrap();
        self.send_bin(&header)?;

        let mut status = [0u8; 1];
        self.recv_bin(&mut status)?;
        if status[0] != 0x01 {
            log::error!("paged read command returned zero");
            return Err(Error::Failed);
        }

        self.recv_bin(buf)?;
        Ok(buf.len())
    }

    fn write_then_read_page(
        &mut self,
        part: &Part,
        mem: &Memory,
        base: u32,
        data: &[u8],
    ) -> Result<()> {
        let lo = mem
            .op(OpKind::LoadpageLo)
            .ok_or_else(|| Error::Capability {
                op: "paged write",
                what: format!("{} lacks loadpage_lo", part.name),
            })?
            .clone();
        let hi = mem
            .op(OpKind::LoadpageHi)
            .ok_or_else(|| Error::Capability {
                op: "paged write",
                what: format!("{} lacks loadpage_hi", part.name),
            })?
            .clone();

        // One 4-byte loadpage instruction per data byte, low/high
        // alternating with the word address.
        let mut cmd_buf = vec![0u8; 4 * data.len()];
        for (i, &b) in data.iter().enumerate() {
            let addr = base + i as u32;
            let op = if addr & 1 == 0 { &lo } else { &hi };
            let slot: &mut [u8; 4] = (&mut cmd_buf[4 * i..4 * i + 4]).try_into().unwrap();
            op.set_bits(slot);
            op.set_addr(slot, addr / 2);
            op.set_input(slot, b);
        }

        let mut frame = Vec::with_capacity(cmd_buf.len() + 5);
        frame.push(BIN_WRITE_THEN_READ);
        frame.extend_from_slice(&(cmd_buf.len() as u16).to_be_bytes());
        frame.extend_from_slice(&[0, 0]); // nothing to read back
        frame.extend_from_slice(&cmd_buf);
        self.send_bin(&frame)?;

        let mut status = [0u8; 1];
        self.recv_bin(&mut status)?;
        if status[0] != 0x01 {
            log::error!("write then read did not succeed");
            return Err(Error::Failed);
        }

        // Commit the loaded page.
        write_page(self, part, mem, base + data.len() as u32 - 1)
    }
}

fn parse_spi_reply(line: &str) -> Option<u8> {
    // Replies look like: WRITE: 0xAC READ: 0x04
    let rest = line.trim().strip_prefix("WRITE: 0x")?;
    let (_, read) = rest.split_once("READ: 0x")?;
    u8::from_str_radix(read.trim().get(..2)?, 16).ok()
}

impl<S: SerialLine> Programmer for BusPirate<S> {
    fn kind(&self) -> &'static str {
        "BusPirate"
    }

    fn enable(&mut self, _part: &mut Part) -> Result<()> {
        self.verify_config()?;

        if let Some(ms) = self.serial_recv_timeout {
            self.conn.set_timeout(std::time::Duration::from_millis(ms))?;
        }

        if !self.force_ascii {
            log::info!("attempting to initiate BusPirate binary mode ...");

            // Two CRs first, in case the text UI sits in a sub-menu.
            self.send_bin(b"\n\n")?;
            self.conn.drain()?;

            if self.start_mode_bin()? {
                return Ok(());
            }
            log::info!("unable to start binary mode, falling back to ASCII ...");
        }

        log::info!("attempting to initiate BusPirate ASCII mode ...");
        self.conn.send(b"#\n")?;
        loop {
            let line = match self.readline() {
                Ok(l) => l,
                Err(_) => return Err(Error::NoDevice),
            };
            if line.starts_with("Are you sure?") {
                self.conn.send(b"y\n")?;
            }
            if line.starts_with("RESET") {
                continue;
            }
            if Self::is_prompt(&line) {
                break;
            }
        }

        log::info!("using ASCII mode");
        self.start_spi_mode_ascii()
    }

    fn initialize(&mut self, part: &Part) -> Result<()> {
        self.powerup()?;
        self.program_enable(part)
    }

    fn program_enable(&mut self, part: &Part) -> Result<()> {
        match self.mode {
            Mode::Binary => {
                // Drop the configured reset pin(s) so the target sees
                // RESET low while the ISP instruction goes out.
                self.peripherals &= !self.reset;
                let peripherals = self.peripherals;
                if !self.expect_bin_byte(peripherals, 0x01)? {
                    return Err(Error::Desync(0));
                }
            }
            Mode::Text => {
                self.ascii_expect("{\n", "CS ENABLED", true)?;
            }
        }
        program_enable_default(self, part)
    }

    fn chip_erase(&mut self, part: &Part) -> Result<()> {
        chip_erase_default(self, part)
    }

    fn cmd(&mut self, cmd: &[u8; 4]) -> Result<[u8; 4]> {
        match self.mode {
            Mode::Binary => self.cmd_bin(cmd),
            Mode::Text => self.cmd_ascii(cmd),
        }
    }

    fn paged_load(&mut self, part: &Part, mem: &Memory, addr: u32, buf: &mut [u8]) -> Result<usize> {
        if self.mode != Mode::Binary || self.nopagedread || !mem.is_flash() {
            return paged_load_bytewise(self, part, mem, addr, buf);
        }
        self.avr_extended_paged_load(addr, buf)
    }

    fn paged_write(&mut self, part: &Part, mem: &Memory, addr: u32, buf: &[u8]) -> Result<usize> {
        if self.mode != Mode::Binary
            || self.nopagedwrite
            || !mem.is_flash()
            || mem.page_size > 1024
        {
            return paged_write_bytewise(self, part, mem, addr, buf);
        }

        let page_size = mem.page_size as usize;
        let mut offset = 0;
        while offset < buf.len() {
            let this_page = page_size.min(buf.len() - offset);
            self.write_then_read_page(
                part,
                mem,
                addr + offset as u32,
                &buf[offset..offset + this_page],
            )?;
            offset += this_page;
        }
        Ok(buf.len())
    }

    fn disable(&mut self) -> Result<()> {
        match self.mode {
            Mode::Binary => self.reset_from_binmode(),
            Mode::Text => {
                self.ascii_expect("#\n", "RESET", true)?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::PartDb;
    use crate::transport;
    use std::collections::VecDeque;
    use std::time::Duration;

    struct MockLine {
        script: VecDeque<(Vec<u8>, Vec<u8>)>,
        read_buf: VecDeque<u8>,
    }

    impl MockLine {
        fn new(script: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
            MockLine {
                script: script.into(),
                read_buf: VecDeque::new(),
            }
        }

        fn finished(&self) -> bool {
            self.script.is_empty()
        }
    }

    impl SerialLine for MockLine {
        fn send(&mut self, buf: &[u8]) -> transport::Result<()> {
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

        fn set_dtr_rts(&mut self, _level: bool) -> transport::Result<()> {
            Ok(())
        }

        fn set_timeout(&mut self, _timeout: Duration) -> transport::Result<()> {
            Ok(())
        }
    }

    fn w(bytes: &[u8]) -> Vec<u8> {
        bytes.to_vec()
    }

    fn binary_entry_script() -> Vec<(Vec<u8>, Vec<u8>)> {
        vec![
            (w(b"\n\n"), vec![]),
            (vec![0u8; 20], w(b"BBIO1")),
            (vec![BIN_ENTER_SPI], w(b"SPI1")),
            (vec![BIN_WRITE_THEN_READ, 0, 0, 0, 0], vec![0x01]),
            (vec![0x49], vec![0x01]), // power + CS high
            (vec![0x60], vec![0x01]), // speed 0
            (vec![0x8a], vec![0x01]), // SPI config
            (vec![BIN_AVR_EXTENDED], vec![0x01]),
            (vec![0x01], vec![0x00, 0x00, 0x01]), // extended version
        ]
    }

    #[test]
    fn binary_mode_negotiation() {
        let mut part = PartDb::find("m328p").unwrap();
        let mut pgm = BusPirate::new(MockLine::new(binary_entry_script()));
        pgm.enable(&mut part).unwrap();
        assert_eq!(pgm.mode, Mode::Binary);
        assert_eq!(pgm.binmode_version, 1);
        assert_eq!(pgm.submode_version, 1);
        assert!(!pgm.nopagedwrite);
        assert!(!pgm.nopagedread);
        assert!(pgm.conn.finished());
    }

    #[test]
    fn binary_spi_command() {
        let mut script = binary_entry_script();
        script.push((vec![0x13], vec![0x01]));
        script.push((vec![0xac, 0x53, 0x00, 0x00], vec![0x00, 0xac, 0x53, 0x00]));

        let mut part = PartDb::find("m328p").unwrap();
        let mut pgm = BusPirate::new(MockLine::new(script));
        pgm.enable(&mut part).unwrap();
        let res = pgm.cmd(&[0xac, 0x53, 0x00, 0x00]).unwrap();
        assert_eq!(res, [0x00, 0xac, 0x53, 0x00]);
        assert!(pgm.conn.finished());
    }

    #[test]
    fn missing_write_then_read_disables_paged_write() {
        let script = vec![
            (w(b"\n\n"), vec![]),
            (vec![0u8; 20], w(b"BBIO1")),
            (vec![BIN_ENTER_SPI], w(b"SPI1")),
            (vec![BIN_WRITE_THEN_READ, 0, 0, 0, 0], vec![0x00]),
            (vec![BIN_ENTER_SPI], vec![]),
            (vec![0x49], vec![0x01]),
            (vec![0x60], vec![0x01]),
            (vec![0x8a], vec![0x01]),
            (vec![BIN_AVR_EXTENDED], vec![0x00]),
        ];
        let mut part = PartDb::find("m328p").unwrap();
        let mut pgm = BusPirate::new(MockLine::new(script));
        pgm.enable(&mut part).unwrap();
        assert!(pgm.nopagedwrite);
        assert!(pgm.nopagedread);
    }

    #[test]
    fn ascii_fallback_when_banner_absent() {
        let script = vec![
            (w(b"\n\n"), vec![]),
            (vec![0u8; 20], vec![]), // no BBIO banner at all
            (w(b"#\n"), w(b"Are you sure?")),
            (w(b"y\n"), w(b"RESET\nBus Pirate v2.1\nHiZ>")),
            // Menu walk: find the SPI entry.
            (w(b"m\n"), w(b"m\n1. HiZ\n2. UART\n5. SPI\n(1)>")),
            (w(b"5\n"), w(b"5\nSet speed:\n 1. 30KHz\n(1)>")),
            (w(b"\n"), w(b"\n 1. Open drain\n 2. Normal (H=3.3V, L=GND)\n(1)>")),
            (w(b"2\n"), w(b"2\nSPI>")),
        ];
        let mut part = PartDb::find("m328p").unwrap();
        let mut pgm = BusPirate::new(MockLine::new(script));
        pgm.enable(&mut part).unwrap();
        assert_eq!(pgm.mode, Mode::Text);
        assert!(pgm.conn.finished());
    }

    #[test]
    fn ascii_spi_command_parses_read_bytes() {
        let reply = b"0xac 0x53 0x00 0x00\n\
                      WRITE: 0xAC READ: 0x00\n\
                      WRITE: 0x53 READ: 0xAC\n\
                      WRITE: 0x00 READ: 0x53\n\
                      WRITE: 0x00 READ: 0x00\n\
                      SPI>";
        let script = vec![(w(b"0xac 0x53 0x00 0x00\n"), w(reply))];
        let mut pgm = BusPirate::new(MockLine::new(script));
        pgm.mode = Mode::Text;
        let res = pgm.cmd(&[0xac, 0x53, 0x00, 0x00]).unwrap();
        assert_eq!(res, [0x00, 0xac, 0x53, 0x00]);
        // The in-sync echo lands in byte 2.
        assert_eq!(res[2], 0x53);
    }

    #[test]
    fn paged_write_builds_loadpage_instruction_stream() {
        let part = PartDb::find("m328p").unwrap();
        let flash = part.flash().unwrap().clone();

        // Two data bytes at flash address 0: loadpage lo then hi at word 0.
        let mut frame = vec![BIN_WRITE_THEN_READ, 0x00, 0x08, 0x00, 0x00];
        frame.extend_from_slice(&[0x40, 0x00, 0x00, 0x11]); // loadpage_lo
        frame.extend_from_slice(&[0x48, 0x00, 0x00, 0x22]); // loadpage_hi

        let script = vec![
            (frame, vec![0x01]),
            // Page commit via the bulk SPI path: writepage at word 0.
            (vec![0x13], vec![0x01]),
            (vec![0x4c, 0x00, 0x00, 0x00], vec![0, 0, 0, 0]),
        ];
        let mut pgm = BusPirate::new(MockLine::new(script));
        pgm.mode = Mode::Binary;
        pgm.write_then_read_page(&part, &flash, 0, &[0x11, 0x22])
            .unwrap();
        assert!(pgm.conn.finished());
    }

    #[test]
    fn avr_extended_read_uses_word_address_and_byte_count() {
        let part = PartDb::find("m328p").unwrap();
        let flash = part.flash().unwrap().clone();

        let mut reply = vec![0x01];
        reply.extend(std::iter::repeat(0x77).take(8));
        let script = vec![(
            vec![0x06, 0x02, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00, 0x08],
            reply,
        )];
        let mut pgm = BusPirate::new(MockLine::new(script));
        pgm.mode = Mode::Binary;
        let mut buf = [0u8; 8];
        // Byte address 0x80 -> word address 0x40 on the wire.
        pgm.paged_load(&part, &flash, 0x80, &mut buf).unwrap();
        assert_eq!(buf, [0x77; 8]);
    }

    #[test]
    fn invalid_extended_parameters_are_rejected() {
        let mut pgm = BusPirate::new(MockLine::new(vec![]));
        assert!(matches!(
            pgm.parse_extended_params(&["spifreq=9".to_string()]),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            pgm.parse_extended_params(&["cpufreq=50".to_string()]),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            pgm.parse_extended_params(&["bogus".to_string()]),
            Err(Error::InvalidParameter(_))
        ));
        pgm.parse_extended_params(&["reset=cs,aux".to_string()])
            .unwrap();
        assert_eq!(pgm.reset, BP_RESET_CS | BP_RESET_AUX);
    }

    #[test]
    fn ascii_mode_refuses_binary_only_options() {
        let mut pgm = BusPirate::new(MockLine::new(vec![]));
        pgm.parse_extended_params(&["ascii".to_string(), "spifreq=3".to_string()])
            .unwrap();
        assert!(matches!(
            pgm.verify_config(),
            Err(Error::InvalidParameter(_))
        ));
    }
}
