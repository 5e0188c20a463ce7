//! Programming-session orchestration.
//!
//! One [`Session`] spans the life of a programmer connection: enable the
//! wire, initialize the target, gate on the device signature, run the
//! requested memory operations, then leave programming mode and release
//! the transport.

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};

use crate::part::{Memory, Part};
use crate::programmer::Programmer;

/// Per-byte marker for memory images: only allocated bytes came from the
/// input file and deserve to reach the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Untouched,
    Allocated,
}

/// The in-memory copy of one memory region.
pub struct MemoryImage {
    pub data: Vec<u8>,
    pub tags: Vec<Tag>,
}

impl MemoryImage {
    /// Blank image, erased-flash state.
    pub fn new(size: usize) -> Self {
        MemoryImage {
            data: vec![0xff; size],
            tags: vec![Tag::Untouched; size],
        }
    }

    /// Image carrying `bytes` at offset zero.
    pub fn from_bytes(bytes: &[u8], size: usize) -> Result<Self> {
        anyhow::ensure!(
            bytes.len() <= size,
            "input is {} bytes but the memory only holds {}",
            bytes.len(),
            size
        );
        let mut image = MemoryImage::new(size);
        image.data[..bytes.len()].copy_from_slice(bytes);
        for tag in &mut image.tags[..bytes.len()] {
            *tag = Tag::Allocated;
        }
        Ok(image)
    }

    /// Bytes up to the last allocated one.
    pub fn allocated_len(&self) -> usize {
        self.tags
            .iter()
            .rposition(|t| *t == Tag::Allocated)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    /// Interesting length for flash programming: up to the last non-0xff
    /// byte, rounded up to an even count since flash is word addressed.
    /// Writing 0xff to erased flash is a no-op, so the tail can be skipped.
    pub fn flash_hiaddr(&self) -> usize {
        let n = self
            .data[..self.allocated_len()]
            .iter()
            .rposition(|&b| b != 0xff)
            .map(|i| i + 1)
            .unwrap_or(0);
        n + (n & 1)
    }
}

pub struct Session {
    pgm: Box<dyn Programmer>,
    part: Part,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("part", &self.part).finish_non_exhaustive()
    }
}

impl Session {
    /// Bring the programmer and target up, then verify the signature.
    /// A mismatch aborts unless `force` is set.
    pub fn start(mut pgm: Box<dyn Programmer>, mut part: Part, force: bool) -> Result<Session> {
        pgm.enable(&mut part)?;
        pgm.initialize(&part)?;

        let mut session = Session { pgm, part };
        session.check_signature(force)?;
        Ok(session)
    }

    pub fn part(&self) -> &Part {
        &self.part
    }

    fn check_signature(&mut self, force: bool) -> Result<()> {
        let Some(mem) = self.part.memory("signature").cloned() else {
            log::warn!("part {} has no signature memory, skipping check", self.part.name);
            return Ok(());
        };

        let mut signature = [0u8; 3];
        for (i, slot) in signature.iter_mut().enumerate() {
            *slot = self.pgm.read_byte(&self.part, &mem, i as u32)?;
        }
        log::info!("Device signature = 0x{}", hex::encode(signature));

        if signature != self.part.signature {
            if signature == [0x00; 3] || signature == [0xff; 3] {
                log::error!("invalid device signature; check connections and target power");
            }
            let msg = format!(
                "expected signature for {} is 0x{}, read 0x{}",
                self.part.name,
                hex::encode(self.part.signature),
                hex::encode(signature)
            );
            if force {
                log::warn!("{} (continuing anyway)", msg);
            } else {
                anyhow::bail!("{}; double check the part or use --force", msg);
            }
        }
        Ok(())
    }

    fn memory(&self, name: &str) -> Result<Memory> {
        self.part
            .memory(name)
            .cloned()
            .ok_or_else(|| anyhow::format_err!("part {} has no {} memory", self.part.name, name))
    }

    /// Read a whole memory region off the device.
    pub fn read_memory(&mut self, name: &str) -> Result<Vec<u8>> {
        let mem = self.memory(name)?;
        let mut buf = vec![0xffu8; mem.size as usize];

        if mem.page_size > 1 {
            // Read page-aligned chunks so the bar moves; drivers batch
            // blocks however their wire prefers.
            let chunk = chunk_size(&mem);
            let bar = byte_bar(buf.len(), "reading");
            for (i, slice) in buf.chunks_mut(chunk).enumerate() {
                self.pgm
                    .paged_load(&self.part, &mem, (i * chunk) as u32, slice)?;
                bar.inc(slice.len() as u64);
            }
            bar.finish_and_clear();
        } else {
            let bar = byte_bar(buf.len(), "reading");
            for (addr, slot) in buf.iter_mut().enumerate() {
                *slot = self.pgm.read_byte(&self.part, &mem, addr as u32)?;
                bar.inc(1);
            }
            bar.finish_and_clear();
        }

        log::info!("read {} bytes from {}", buf.len(), mem.name);
        Ok(buf)
    }

    pub fn read_byte(&mut self, name: &str, addr: u32) -> Result<u8> {
        let mem = self.memory(name)?;
        Ok(self.pgm.read_byte(&self.part, &mem, addr)?)
    }

    /// Write an image to a memory region. Returns the bytes written.
    pub fn write_memory(&mut self, name: &str, image: &MemoryImage) -> Result<usize> {
        let mem = self.memory(name)?;
        anyhow::ensure!(
            image.data.len() == mem.size as usize,
            "image size {} does not match {} size {}",
            image.data.len(),
            mem.name,
            mem.size
        );

        let len = if mem.is_flash() {
            image.flash_hiaddr()
        } else {
            image.allocated_len()
        };
        if len == 0 {
            log::info!("nothing to write to {}", mem.name);
            return Ok(0);
        }

        if mem.page_size > 1 {
            log::info!("writing {} bytes to {}", len, mem.name);
            self.pgm.paged_write(&self.part, &mem, 0, &image.data[..len])?;
        } else {
            let bar = byte_bar(len, "writing");
            for addr in 0..len {
                if image.tags[addr] == Tag::Allocated {
                    self.pgm
                        .write_byte(&self.part, &mem, addr as u32, image.data[addr])?;
                }
                bar.inc(1);
            }
            bar.finish_and_clear();
        }

        log::info!("{} bytes of {} written", len, mem.name);
        Ok(len)
    }

    /// Read back a region and compare it with `image`. Only allocated
    /// bytes participate. Returns the number of bytes verified.
    pub fn verify_memory(&mut self, name: &str, image: &MemoryImage) -> Result<usize> {
        let len = image.allocated_len();
        if len == 0 {
            return Ok(0);
        }
        let device = self.read_memory(name)?;
        anyhow::ensure!(
            device.len() >= len,
            "memory {} only contains {} bytes, {} requested",
            name,
            device.len(),
            len
        );

        for addr in 0..len {
            if image.tags[addr] == Tag::Allocated && device[addr] != image.data[addr] {
                anyhow::bail!(
                    "verification error, first mismatch at byte 0x{:04x}: 0x{:02x} != 0x{:02x}",
                    addr,
                    device[addr],
                    image.data[addr]
                );
            }
        }
        log::info!("{} bytes of {} verified", len, name);
        Ok(len)
    }

    pub fn chip_erase(&mut self) -> Result<()> {
        self.pgm.chip_erase(&self.part)?;
        log::info!("chip erase done");
        Ok(())
    }

    /// Log part and programmer details for the `info` command.
    pub fn dump_info(&mut self) -> Result<()> {
        log::info!("Part: {}", self.part);
        for mem in &self.part.memories {
            log::info!(
                "  {:<12} {:>7} bytes{}",
                mem.name,
                mem.size,
                if mem.paged {
                    format!(", {} pages of {}", mem.pages(), mem.page_size)
                } else {
                    String::new()
                }
            );
        }
        self.pgm.display()?;
        Ok(())
    }

    /// Leave programming mode and release the transport.
    pub fn finish(mut self) -> Result<()> {
        let result = self.pgm.disable();
        self.pgm.close();
        result?;
        Ok(())
    }
}

/// Chunk paged reads in page multiples of roughly 256 bytes so progress
/// stays visible without throttling the wire.
fn chunk_size(mem: &Memory) -> usize {
    let page = mem.page_size.max(1) as usize;
    page * (256 / page).max(1)
}

fn byte_bar(len: usize, verb: &str) -> ProgressBar {
    let bar = ProgressBar::new(len as u64);
    bar.set_style(
        ProgressStyle::with_template("{msg:>8} [{bar:32}] {bytes}/{total_bytes}")
            .unwrap()
            .progress_chars("=> "),
    );
    bar.set_message(verb.to_string());
    bar
}
