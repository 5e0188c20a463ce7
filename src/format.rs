//! Firmware file formats.
use std::str;
use std::{borrow::Cow, path::Path};

use anyhow::Result;
use object::{
    Endianness, elf::FileHeader32, elf::PT_LOAD, read::elf::FileHeader, read::elf::ProgramHeader,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    PlainHex,
    IntelHex,
    Elf,
    Binary,
}

/// Read a firmware image, guessing the format from the extension and the
/// first bytes. Gaps in sparse images are filled with 0xff, the erased
/// state of AVR memories.
pub fn read_image_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;

    let format = guess_format(p, &raw);
    log::info!("Read {} as {:?} format", p.display(), format);
    match format {
        ImageFormat::PlainHex => {
            let text: String = str::from_utf8(&raw)?
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            Ok(hex::decode(text)?)
        }
        ImageFormat::IntelHex => read_ihex(str::from_utf8(&raw)?),
        ImageFormat::Elf => objcopy_binary(&raw),
        ImageFormat::Binary => Ok(raw),
    }
}

/// Write a device dump, as Intel hex if the extension asks for it and raw
/// binary otherwise.
pub fn write_image_to_file<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<()> {
    let p = path.as_ref();
    let ext = p
        .extension()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if ["ihex", "ihe", "hex", "h86", "a43", "a90"].contains(&&*ext) {
        let mut records: Vec<ihex::Record> = data
            .chunks(16)
            .enumerate()
            .map(|(i, chunk)| ihex::Record::Data {
                offset: (i * 16) as u16,
                value: chunk.to_vec(),
            })
            .collect();
        records.push(ihex::Record::EndOfFile);
        let text = ihex::create_object_file_representation(&records)?;
        std::fs::write(p, text)?;
    } else {
        std::fs::write(p, data)?;
    }
    Ok(())
}

pub fn guess_format(path: &Path, raw: &[u8]) -> ImageFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihe", "h86", "hex", "a43", "a90"].contains(&&*ext) {
        return ImageFormat::IntelHex;
    }

    if raw.starts_with(&[0x7f, b'E', b'L', b'F']) {
        ImageFormat::Elf
    } else if !raw.is_empty()
        && raw[0] == b':'
        && raw
            .iter()
            .all(|&c| (c as char).is_ascii_hexdigit() || c == b':' || c == b'\n' || c == b'\r')
    {
        ImageFormat::IntelHex
    } else if !raw.is_empty()
        && raw
            .iter()
            .all(|&c| (c as char).is_ascii_hexdigit() || c == b'\n' || c == b'\r' || c == b' ')
    {
        ImageFormat::PlainHex
    } else {
        ImageFormat::Binary
    }
}

pub fn read_ihex(data: &str) -> Result<Vec<u8>> {
    use ihex::Record;

    let mut base_address = 0;

    let mut records = vec![];
    for record in ihex::Reader::new(data) {
        let record = record?;
        match record {
            Record::Data { offset, value } => {
                let offset = base_address + offset as u32;
                records.push((offset, Cow::from(value)));
            }
            Record::EndOfFile => (),
            Record::ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            Record::StartSegmentAddress { .. } => (),
            Record::ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            Record::StartLinearAddress(_) => (),
        };
    }
    merge_sections(records)
}

/// Simulates `objcopy -O binary`: concatenate the PT_LOAD segments at
/// their physical addresses.
pub fn objcopy_binary(elf_data: &[u8]) -> Result<Vec<u8>> {
    let file_kind = object::FileKind::parse(elf_data)?;

    match file_kind {
        object::FileKind::Elf32 => (),
        _ => anyhow::bail!("cannot read file as ELF32 format"),
    }
    let elf_header = FileHeader32::<Endianness>::parse(elf_data)?;

    let mut sections = vec![];

    let endian = elf_header.endian()?;

    for segment in elf_header.program_headers(endian, elf_data)? {
        // The physical address is where the data gets programmed; AVR
        // ELF files put flash at 0x0 and data spaces at 0x80xxxx.
        let p_paddr: u64 = segment.p_paddr(endian).into();

        let segment_data = segment
            .data(endian, elf_data)
            .map_err(|_| anyhow::format_err!("Failed to access data for an ELF segment."))?;
        if !segment_data.is_empty() && segment.p_type(endian) == PT_LOAD {
            log::debug!(
                "Found loadable segment, physical address: {:#010x}, size {:#x}",
                p_paddr,
                segment_data.len()
            );
            let (segment_offset, segment_filesize) = segment.file_range(endian);
            if segment_filesize == 0 {
                continue;
            }
            let section_data = &elf_data[segment_offset as usize..][..segment_filesize as usize];
            sections.push((p_paddr as u32, Cow::from(section_data)));
        }
    }

    if sections.is_empty() {
        anyhow::bail!("empty ELF file");
    }
    log::debug!("found {} sections", sections.len());
    merge_sections(sections)
}

fn merge_sections(mut sections: Vec<(u32, Cow<[u8]>)>) -> Result<Vec<u8>> {
    if sections.is_empty() {
        return Ok(vec![]);
    }
    sections.sort(); // order by start address

    let start_address = sections.first().unwrap().0;
    let end_address = sections.last().unwrap().0 + sections.last().unwrap().1.len() as u32;

    let total_size = end_address - start_address;

    // Unprogrammed gaps read as 0xff.
    let mut binary = vec![0xffu8; total_size as usize];
    for (addr, sect) in sections {
        let sect_start = (addr - start_address) as usize;
        let sect_end = sect_start + sect.len();
        binary[sect_start..sect_end].copy_from_slice(&sect);
    }
    Ok(binary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guesses_by_extension_and_magic() {
        let p = Path::new("firmware.hex");
        assert_eq!(guess_format(p, b"whatever"), ImageFormat::IntelHex);

        let p = Path::new("firmware.bin");
        assert_eq!(
            guess_format(p, &[0x7f, b'E', b'L', b'F', 0x01]),
            ImageFormat::Elf
        );
        assert_eq!(
            guess_format(p, b":100000000C9434000C943E000C943E000C943E0082\n"),
            ImageFormat::IntelHex
        );
        assert_eq!(guess_format(p, b"0c94 3e00\n"), ImageFormat::PlainHex);
        assert_eq!(guess_format(p, &[0x0c, 0x94, 0x3e, 0x00]), ImageFormat::Binary);
    }

    #[test]
    fn ihex_records_merge_with_gap_fill() {
        let hex = ":020000000C945E\n:02001000AABB89\n:00000001FF\n";
        let image = read_ihex(hex).unwrap();
        assert_eq!(image.len(), 0x12);
        assert_eq!(&image[0..2], &[0x0c, 0x94]);
        assert!(image[2..0x10].iter().all(|&b| b == 0xff));
        assert_eq!(&image[0x10..], &[0xaa, 0xbb]);
    }

    #[test]
    fn ihex_extended_linear_addresses() {
        let hex = ":020000040001F9\n:020000001122CB\n:00000001FF\n";
        let image = read_ihex(hex).unwrap();
        // A single section starting at 0x10000 collapses to offset 0.
        assert_eq!(image, vec![0x11, 0x22]);
    }
}
