//! The programmer abstraction: one capability record per adapter.
//!
//! Every adapter implements [`Programmer`]. Mandatory operations are the
//! session lifecycle (`initialize`, `program_enable`, `disable`) and the
//! 4-byte SPI passthrough `cmd`; everything else has a default body, either
//! a generic implementation built on `cmd` (byte and bytewise paged I/O) or
//! a capability error for operations the adapter does not support.

use std::thread::sleep;
use std::time::{Duration, Instant};

use crate::opcode::OpKind;
use crate::part::{Memory, Part};

pub use self::buspirate::BusPirate;
pub use self::ch341a::Ch341a;
pub use self::stk500::Stk500;
pub use self::usbasp::UsbAsp;

pub mod buspirate;
pub mod ch341a;
pub mod stk500;
pub mod usbasp;

/// Errors surfaced to the session orchestrator, grouped by origin:
/// transport, framing/sync, target, capability, user input.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] crate::transport::Error),
    #[error("programmer is out of sync: unexpected byte 0x{0:02x}")]
    Desync(u8),
    #[error("cannot get into sync after {0} attempts")]
    SyncRetries(usize),
    #[error("unknown response 0x{0:02x}")]
    UnknownResponse(u8),
    #[error("programmer reports no device attached")]
    NoDevice,
    #[error("programmer reports command failed")]
    Failed,
    #[error("target rejected program enable: echo 0x{echoed:02x}, expected 0x{expected:02x}")]
    ProgramEnable { echoed: u8, expected: u8 },
    #[error("write polling timed out after {0} us")]
    WritePollTimeout(u32),
    #[error("{op} is not supported by {what}")]
    Capability { op: &'static str, what: String },
    #[error("invalid extended parameter {0:?}")]
    InvalidParameter(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn capability(op: &'static str, what: impl Into<String>) -> Error {
    Error::Capability {
        op,
        what: what.into(),
    }
}

/// Sleep for a part-table delay given in microseconds.
pub(crate) fn usleep(us: u32) {
    sleep(Duration::from_micros(us as u64));
}

/// Cached extended-address byte, for byte-addressed flash beyond 64 KiB.
///
/// Addresses handed to [`ExtAddr`] are in the memory's own addressing
/// units, i.e. already divided for word-addressed flash.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtAddr {
    last: Option<u8>,
}

impl ExtAddr {
    /// The extended-address byte for `addr` if the target has not latched
    /// it yet, `None` while the cache is still valid.
    pub fn stale(&self, addr: u32) -> Option<u8> {
        let ext = (addr >> 16) as u8;
        if self.last == Some(ext) { None } else { Some(ext) }
    }

    pub fn latched(&mut self, ext: u8) {
        self.last = Some(ext);
    }

    pub fn invalidate(&mut self) {
        self.last = None;
    }

    /// Invalidate when the block after `addr` starts in a different 64 KiB
    /// segment. Bootloaders that keep their own copy in RAMPZ
    /// auto-increment it at the boundary, so the cached value must not
    /// survive into the next block.
    pub fn advance(&mut self, addr: u32, step: u32) {
        if (addr & 0xffff_0000) != ((addr + step) & 0xffff_0000) {
            self.invalidate();
        }
    }
}

/// A programmer adapter driving one attached target.
pub trait Programmer {
    /// Short type tag, e.g. `"STK500"`.
    fn kind(&self) -> &'static str;

    /// Prepare the wire (negotiate modes, power up). May adjust the
    /// session's copy of the part, e.g. to fix up an EEPROM page size.
    fn enable(&mut self, _part: &mut Part) -> Result<()> {
        Ok(())
    }

    /// Set up target parameters and enter programming mode.
    fn initialize(&mut self, part: &Part) -> Result<()>;

    fn program_enable(&mut self, part: &Part) -> Result<()>;

    fn chip_erase(&mut self, part: &Part) -> Result<()>;

    /// 4-byte SPI instruction passthrough.
    fn cmd(&mut self, cmd: &[u8; 4]) -> Result<[u8; 4]>;

    /// The driver's extended-address latch, when it tracks one.
    fn ext_addr(&mut self) -> Option<&mut ExtAddr> {
        None
    }

    fn read_byte(&mut self, part: &Part, mem: &Memory, addr: u32) -> Result<u8> {
        read_byte_default(self, part, mem, addr)
    }

    fn write_byte(&mut self, part: &Part, mem: &Memory, addr: u32, data: u8) -> Result<()> {
        write_byte_default(self, part, mem, addr, data)
    }

    /// Read `buf.len()` bytes starting at `addr`. `addr` is page aligned
    /// and the length a multiple of the page size except for the tail.
    fn paged_load(&mut self, part: &Part, mem: &Memory, addr: u32, buf: &mut [u8]) -> Result<usize> {
        paged_load_bytewise(self, part, mem, addr, buf)
    }

    fn paged_write(&mut self, part: &Part, mem: &Memory, addr: u32, buf: &[u8]) -> Result<usize> {
        paged_write_bytewise(self, part, mem, addr, buf)
    }

    /// SCK period in seconds; zero selects the adapter's default.
    fn set_sck_period(&mut self, _period: f64) -> Result<()> {
        Err(capability("set_sck_period", self.kind()))
    }

    fn set_vtarget(&mut self, _v: f64) -> Result<()> {
        Err(capability("set_vtarget", self.kind()))
    }

    fn set_varef(&mut self, _v: f64) -> Result<()> {
        Err(capability("set_varef", self.kind()))
    }

    fn set_fosc(&mut self, _v: f64) -> Result<()> {
        Err(capability("set_fosc", self.kind()))
    }

    /// Log adapter parameters for the `info` command.
    fn display(&mut self) -> Result<()> {
        Ok(())
    }

    /// Leave programming mode.
    fn disable(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release the transport. Called exactly once, after `disable`.
    fn close(&mut self) {}
}

/// Emit the memory's `load_ext_addr` instruction for `caddr` (already in
/// the memory's addressing units) unless the driver's cache shows the
/// target has it latched. Drivers without a cache emit unconditionally.
pub fn load_ext_addr_if_needed<P: Programmer + ?Sized>(
    pgm: &mut P,
    mem: &Memory,
    caddr: u32,
) -> Result<()> {
    let Some(lext) = mem.op(OpKind::LoadExtAddr) else {
        return Ok(());
    };
    let lext = lext.clone();
    let ext = (caddr >> 16) as u8;
    if let Some(cache) = pgm.ext_addr() {
        if cache.stale(caddr).is_none() {
            return Ok(());
        }
    }
    let mut cmd = [0u8; 4];
    lext.set_bits(&mut cmd);
    lext.set_addr(&mut cmd, caddr);
    pgm.cmd(&cmd)?;
    if let Some(cache) = pgm.ext_addr() {
        cache.latched(ext);
    }
    Ok(())
}

/// Generic byte read over the SPI passthrough.
pub fn read_byte_default<P: Programmer + ?Sized>(
    pgm: &mut P,
    part: &Part,
    mem: &Memory,
    addr: u32,
) -> Result<u8> {
    // Flash with a lo/hi opcode pair is word addressed.
    let (kind, caddr) = if mem.has_op(OpKind::ReadLo) {
        let kind = if addr & 1 != 0 {
            OpKind::ReadHi
        } else {
            OpKind::ReadLo
        };
        (kind, addr / 2)
    } else {
        (OpKind::Read, addr)
    };
    let readop = mem
        .op(kind)
        .ok_or_else(|| capability("read", format!("memory {} of {}", mem.name, part.name)))?
        .clone();

    load_ext_addr_if_needed(pgm, mem, caddr)?;

    let mut cmd = [0u8; 4];
    readop.set_bits(&mut cmd);
    readop.set_addr(&mut cmd, caddr);
    let res = pgm.cmd(&cmd)?;
    Ok(readop.get_output(&res))
}

/// Generic byte write over the SPI passthrough, with write-completion
/// detection by polled read-back where the part supports it.
pub fn write_byte_default<P: Programmer + ?Sized>(
    pgm: &mut P,
    part: &Part,
    mem: &Memory,
    addr: u32,
    data: u8,
) -> Result<()> {
    if mem.is_readonly() {
        if let Ok(current) = pgm.read_byte(part, mem, addr) {
            if current == data {
                return Ok(());
            }
        }
        return Err(capability("write", format!("read-only memory {}", mem.name)));
    }

    // Skip the write if the target already holds the value. Not applicable
    // to paged memories, where bytes only land in the page buffer.
    let mut readable = false;
    if !mem.paged {
        if let Ok(current) = pgm.read_byte(part, mem, addr) {
            readable = true;
            if current == data {
                return Ok(());
            }
        }
    }

    let (kind, caddr) = if mem.has_op(OpKind::WriteLo) {
        let kind = if addr & 1 != 0 {
            OpKind::WriteHi
        } else {
            OpKind::WriteLo
        };
        (kind, addr / 2)
    } else if mem.paged && mem.has_op(OpKind::LoadpageLo) {
        let kind = if addr & 1 != 0 {
            OpKind::LoadpageHi
        } else {
            OpKind::LoadpageLo
        };
        (kind, addr / 2)
    } else {
        (OpKind::Write, addr)
    };
    let writeop = mem
        .op(kind)
        .ok_or_else(|| capability("write", format!("memory {} of {}", mem.name, part.name)))?
        .clone();

    let mut cmd = [0u8; 4];
    writeop.set_bits(&mut cmd);
    writeop.set_addr(&mut cmd, caddr);
    writeop.set_input(&mut cmd, data);
    pgm.cmd(&cmd)?;

    if mem.paged {
        // Page-buffer loads complete immediately; the delay belongs to the
        // later page commit.
        return Ok(());
    }

    if !readable {
        usleep(mem.max_write_delay);
        return Ok(());
    }

    if data == mem.readback[0] || data == mem.readback[1] {
        // Polling cannot distinguish this value from a cell still busy
        // programming, wait out the worst case instead.
        usleep(mem.max_write_delay);
        pgm.read_byte(part, mem, addr)?;
        return Ok(());
    }

    let deadline = Instant::now() + Duration::from_micros(mem.max_write_delay as u64);
    loop {
        if pgm.read_byte(part, mem, addr)? == data {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::WritePollTimeout(mem.max_write_delay));
        }
        usleep(mem.min_write_delay.max(1));
    }
}

/// Commit the loaded page buffer at `addr` (a byte address inside the page).
pub fn write_page<P: Programmer + ?Sized>(
    pgm: &mut P,
    part: &Part,
    mem: &Memory,
    addr: u32,
) -> Result<()> {
    let wp = mem
        .op(OpKind::Writepage)
        .ok_or_else(|| capability("page write", format!("memory {} of {}", mem.name, part.name)))?
        .clone();

    let caddr = if mem.has_op(OpKind::LoadpageLo) || mem.has_op(OpKind::ReadLo) {
        addr / 2
    } else {
        addr
    };

    load_ext_addr_if_needed(pgm, mem, caddr)?;

    let mut cmd = [0u8; 4];
    wp.set_bits(&mut cmd);
    wp.set_addr(&mut cmd, caddr);
    pgm.cmd(&cmd)?;

    // The target's supply voltage is unknown, so wait the worst case.
    usleep(mem.max_write_delay);
    Ok(())
}

/// Paged read fallback iterating the byte path.
pub fn paged_load_bytewise<P: Programmer + ?Sized>(
    pgm: &mut P,
    part: &Part,
    mem: &Memory,
    addr: u32,
    buf: &mut [u8],
) -> Result<usize> {
    for (i, slot) in buf.iter_mut().enumerate() {
        *slot = pgm.read_byte(part, mem, addr + i as u32)?;
    }
    Ok(buf.len())
}

/// Paged write fallback iterating the byte path, committing each page of a
/// paged memory once its bytes are loaded.
pub fn paged_write_bytewise<P: Programmer + ?Sized>(
    pgm: &mut P,
    part: &Part,
    mem: &Memory,
    addr: u32,
    buf: &[u8],
) -> Result<usize> {
    let page_size = mem.page_size.max(1);
    for (i, &b) in buf.iter().enumerate() {
        let a = addr + i as u32;
        pgm.write_byte(part, mem, a, b)?;
        if mem.paged && ((a + 1) % page_size == 0 || i == buf.len() - 1) {
            write_page(pgm, part, mem, a)?;
        }
    }
    Ok(buf.len())
}

/// Program enable for drivers whose `cmd` returns the genuine 4-byte MISO
/// image: the target in sync echoes command byte 1 in response byte 2.
pub fn program_enable_default<P: Programmer + ?Sized>(pgm: &mut P, part: &Part) -> Result<()> {
    let op = part
        .op(OpKind::PgmEnable)
        .ok_or_else(|| capability("program enable", part.name.clone()))?
        .clone();
    let mut cmd = [0u8; 4];
    op.set_bits(&mut cmd);
    let res = pgm.cmd(&cmd)?;
    if res[2] != cmd[1] {
        return Err(Error::ProgramEnable {
            echoed: res[2],
            expected: cmd[1],
        });
    }
    Ok(())
}

/// Chip erase via the part's opcode, then re-initialize: the erase drops
/// the target out of programming mode.
pub fn chip_erase_default<P: Programmer + ?Sized>(pgm: &mut P, part: &Part) -> Result<()> {
    let op = part
        .op(OpKind::ChipErase)
        .ok_or_else(|| capability("chip erase", part.name.clone()))?
        .clone();
    let mut cmd = [0u8; 4];
    op.set_bits(&mut cmd);
    pgm.cmd(&cmd)?;
    usleep(part.chip_erase_delay);
    pgm.initialize(part)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::PartDb;
    use std::collections::VecDeque;

    /// Records every SPI word and replays canned responses.
    struct MockIsp {
        sent: Vec<[u8; 4]>,
        responses: VecDeque<[u8; 4]>,
        ext: ExtAddr,
    }

    impl MockIsp {
        fn new() -> Self {
            MockIsp {
                sent: Vec::new(),
                responses: VecDeque::new(),
                ext: ExtAddr::default(),
            }
        }

        fn respond(&mut self, res: [u8; 4]) {
            self.responses.push_back(res);
        }
    }

    impl Programmer for MockIsp {
        fn kind(&self) -> &'static str {
            "mock"
        }

        fn initialize(&mut self, _part: &Part) -> Result<()> {
            Ok(())
        }

        fn program_enable(&mut self, _part: &Part) -> Result<()> {
            Ok(())
        }

        fn chip_erase(&mut self, part: &Part) -> Result<()> {
            chip_erase_default(self, part)
        }

        fn cmd(&mut self, cmd: &[u8; 4]) -> Result<[u8; 4]> {
            self.sent.push(*cmd);
            Ok(self.responses.pop_front().unwrap_or([0; 4]))
        }

        fn ext_addr(&mut self) -> Option<&mut ExtAddr> {
            Some(&mut self.ext)
        }
    }

    #[test]
    fn ext_addr_latches_once_per_segment() {
        let mut ext = ExtAddr::default();
        assert_eq!(ext.stale(0x0000), Some(0));
        ext.latched(0);
        assert_eq!(ext.stale(0x8000), None);
        assert_eq!(ext.stale(0x1_0000), Some(1));
        ext.latched(1);
        assert_eq!(ext.stale(0x1_ff00), None);
    }

    #[test]
    fn ext_addr_invalidates_across_segment_boundary() {
        let mut ext = ExtAddr::default();
        ext.latched(0);
        // Block ends below the boundary: cache survives.
        ext.advance(0xfe00, 0x100);
        assert_eq!(ext.stale(0xff00), None);
        // Next block crosses into the second segment.
        ext.advance(0xff80, 0x100);
        assert_eq!(ext.stale(0xff80), Some(0));
    }

    #[test]
    fn flash_read_selects_lo_hi_and_divides_address() {
        let part = PartDb::find("m328p").unwrap();
        let flash = part.flash().unwrap();
        let mut pgm = MockIsp::new();
        pgm.respond([0, 0, 0, 0x42]);
        pgm.respond([0, 0, 0, 0x43]);

        assert_eq!(pgm.read_byte(&part, flash, 0x0100).unwrap(), 0x42);
        assert_eq!(pgm.read_byte(&part, flash, 0x0101).unwrap(), 0x43);
        // Byte addresses 0x100/0x101 are word 0x80, lo then hi.
        assert_eq!(pgm.sent[0], [0x20, 0x00, 0x80, 0x00]);
        assert_eq!(pgm.sent[1], [0x28, 0x00, 0x80, 0x00]);
    }

    #[test]
    fn signature_read_uses_single_opcode() {
        let part = PartDb::find("m328p").unwrap();
        let sig = part.memory("signature").unwrap();
        let mut pgm = MockIsp::new();
        for b in [0x1e, 0x95, 0x0f] {
            pgm.respond([0, 0, 0, b]);
        }
        let bytes: Vec<u8> = (0..3).map(|a| pgm.read_byte(&part, sig, a).unwrap()).collect();
        assert_eq!(bytes, [0x1e, 0x95, 0x0f]);
        assert_eq!(pgm.sent[0][0], 0x30);
        assert_eq!(pgm.sent[1][2] & 0x03, 1);
        assert_eq!(pgm.sent[2][2] & 0x03, 2);
    }

    #[test]
    fn eeprom_write_polls_readback() {
        let part = PartDb::find("m328p").unwrap();
        let eeprom = part.eeprom().unwrap();
        let mut pgm = MockIsp::new();
        pgm.respond([0, 0, 0, 0x00]); // pre-read: differs
        pgm.respond([0, 0, 0, 0x00]); // write command itself
        pgm.respond([0, 0, 0, 0x00]); // first poll: still busy
        pgm.respond([0, 0, 0, 0x5a]); // second poll: done
        pgm.write_byte(&part, eeprom, 0x10, 0x5a).unwrap();
        assert_eq!(pgm.sent.len(), 4);
        assert_eq!(pgm.sent[1], [0xc0, 0x00, 0x10, 0x5a]);
    }

    #[test]
    fn unpollable_write_value_waits_full_delay() {
        let part = PartDb::find("m328p").unwrap();
        let eeprom = part.eeprom().unwrap();
        let mut pgm = MockIsp::new();
        pgm.respond([0, 0, 0, 0x00]); // pre-read
        pgm.respond([0, 0, 0, 0x00]); // write
        pgm.respond([0, 0, 0, 0xff]); // single post-delay read
        pgm.write_byte(&part, eeprom, 0x00, 0xff).unwrap();
        assert_eq!(pgm.sent.len(), 3);
    }

    #[test]
    fn capability_error_without_wire_traffic() {
        let part = PartDb::find("m328p").unwrap();
        let lock = part.lock().unwrap();
        let mut pgm = MockIsp::new();
        // Lock bytes define no paged commit; asking for one must fail
        // before anything reaches the wire.
        let err = write_page(&mut pgm, &part, lock, 0).unwrap_err();
        assert!(matches!(err, Error::Capability { .. }));
        assert!(pgm.sent.is_empty());

        let err = pgm.set_sck_period(1e-6).unwrap_err();
        assert!(matches!(err, Error::Capability { .. }));
        assert!(pgm.sent.is_empty());
    }

    #[test]
    fn readonly_memory_rejects_new_values() {
        let part = PartDb::find("m328p").unwrap();
        let sig = part.memory("signature").unwrap();
        let mut pgm = MockIsp::new();
        pgm.respond([0, 0, 0, 0x1e]);
        // Writing the value already present is a no-op ...
        pgm.write_byte(&part, sig, 0, 0x1e).unwrap();
        // ... anything else is refused.
        pgm.respond([0, 0, 0, 0x1e]);
        let err = pgm.write_byte(&part, sig, 0, 0x00).unwrap_err();
        assert!(matches!(err, Error::Capability { .. }));
    }
}
