//! AVR part definitions, with per-part and per-memory opcode tables.
//!
//! Parts are described by YAML documents under `devices/` and loaded into
//! an in-memory database at startup. The core treats them as read-only for
//! the whole session.

use anyhow::Result;
use serde::{Deserialize, Deserializer};

use crate::opcode::{OpKind, Opcode, OpcodeTable};

/// How the part's RESET pin is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetDisposition {
    /// RESET is a dedicated pin.
    #[default]
    Dedicated,
    /// RESET shares a general I/O pin.
    Io,
}

/// Programming interfaces a part supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgMode {
    Isp,
    Tpi,
    Pdi,
    Updi,
}

/// One memory region of a part.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Memory {
    /// Region name: `flash`, `eeprom`, `lfuse`, `hfuse`, `efuse`, `fuse`,
    /// `lock`, `signature`, `calibration`.
    pub name: String,
    #[serde(deserialize_with = "parse_size")]
    pub size: u32,
    #[serde(default)]
    pub paged: bool,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub num_pages: u32,
    /// Microseconds.
    #[serde(default)]
    pub min_write_delay: u32,
    /// Microseconds.
    #[serde(default)]
    pub max_write_delay: u32,
    /// Values that defeat polled read-back and force the full delay.
    #[serde(default = "default_readback")]
    pub readback: [u8; 2],
    /// Offset in the unified address space (TPI parts).
    #[serde(default, deserialize_with = "parse_size_default")]
    pub offset: u32,
    #[serde(default)]
    ops: OpcodeTable,
}

fn default_page_size() -> u32 {
    1
}

fn default_readback() -> [u8; 2] {
    [0xff, 0xff]
}

impl Memory {
    pub fn op(&self, kind: OpKind) -> Option<&Opcode> {
        self.ops.get(kind)
    }

    pub fn has_op(&self, kind: OpKind) -> bool {
        self.ops.contains(kind)
    }

    pub fn is_flash(&self) -> bool {
        self.name == "flash"
    }

    pub fn is_eeprom(&self) -> bool {
        self.name == "eeprom"
    }

    pub fn is_a_fuse(&self) -> bool {
        self.name == "fuse" || self.name.ends_with("fuse")
    }

    /// Signature and calibration bytes are factory programmed.
    pub fn is_readonly(&self) -> bool {
        self.name == "signature" || self.name == "calibration"
    }

    /// Number of pages, derived when the definition does not spell it out.
    pub fn pages(&self) -> u32 {
        if self.num_pages != 0 {
            self.num_pages
        } else if self.paged && self.page_size > 0 {
            self.size / self.page_size
        } else {
            1
        }
    }
}

/// A target microcontroller, as loaded from the device database.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Part {
    /// Canonical name, e.g. `ATmega328P`.
    pub name: String,
    /// Short id used on the command line, e.g. `m328p`.
    pub id: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(deserialize_with = "parse_signature")]
    pub signature: [u8; 3],
    /// Microseconds.
    pub chip_erase_delay: u32,
    #[serde(default)]
    pub reset_disposition: ResetDisposition,
    #[serde(default = "default_prog_modes")]
    pub prog_modes: Vec<ProgMode>,
    /// STK500 SET_DEVICE device code.
    #[serde(default)]
    pub stk500_devcode: u8,
    /// PAGEL signal for SET_DEVICE_EXT, when the datasheet defines one.
    #[serde(default)]
    pub pagel: Option<u8>,
    /// BS2 signal for SET_DEVICE_EXT.
    #[serde(default)]
    pub bs2: Option<u8>,
    #[serde(default = "default_true")]
    pub serial_ok: bool,
    #[serde(default)]
    pub parallel_ok: bool,
    #[serde(default)]
    ops: OpcodeTable,
    pub memories: Vec<Memory>,
}

fn default_prog_modes() -> Vec<ProgMode> {
    vec![ProgMode::Isp]
}

fn default_true() -> bool {
    true
}

impl std::fmt::Display for Part {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, hex::encode(self.signature))
    }
}

impl Part {
    /// Part-level instruction, e.g. `pgm_enable` or `chip_erase`.
    pub fn op(&self, kind: OpKind) -> Option<&Opcode> {
        self.ops.get(kind)
    }

    pub fn has_mode(&self, mode: ProgMode) -> bool {
        self.prog_modes.contains(&mode)
    }

    pub fn is_tpi(&self) -> bool {
        self.has_mode(ProgMode::Tpi)
    }

    pub fn memory(&self, name: &str) -> Option<&Memory> {
        self.memories.iter().find(|m| m.name == name)
    }

    pub fn flash(&self) -> Option<&Memory> {
        self.memory("flash")
    }

    pub fn eeprom(&self) -> Option<&Memory> {
        self.memory("eeprom")
    }

    pub fn lock(&self) -> Option<&Memory> {
        self.memory("lock")
    }

    /// Total size of the classic fuse bytes, for SET_DEVICE.
    pub fn fuse_bytes(&self) -> u32 {
        ["fuse", "lfuse", "hfuse", "efuse"]
            .iter()
            .filter_map(|n| self.memory(n))
            .map(|m| m.size)
            .sum()
    }

    fn matches(&self, spec: &str) -> bool {
        self.id.eq_ignore_ascii_case(spec)
            || self.name.eq_ignore_ascii_case(spec)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(spec))
    }
}

/// The built-in device database.
pub struct PartDb {
    parts: Vec<Part>,
}

impl PartDb {
    pub fn load() -> Result<Self> {
        Ok(PartDb {
            parts: vec![
                serde_yaml::from_str(include_str!("../devices/atmega8.yaml"))?,
                serde_yaml::from_str(include_str!("../devices/atmega328p.yaml"))?,
                serde_yaml::from_str(include_str!("../devices/atmega644p.yaml"))?,
                serde_yaml::from_str(include_str!("../devices/atmega2560.yaml"))?,
                serde_yaml::from_str(include_str!("../devices/attiny13a.yaml"))?,
                serde_yaml::from_str(include_str!("../devices/attiny85.yaml"))?,
                serde_yaml::from_str(include_str!("../devices/attiny10.yaml"))?,
            ],
        })
    }

    /// Look a part up by id, full name or alias.
    pub fn find(spec: &str) -> Result<Part> {
        let db = PartDb::load()?;
        db.parts
            .iter()
            .find(|p| p.matches(spec))
            .cloned()
            .ok_or_else(|| anyhow::format_err!("part {:?} is not in the device database", spec))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Part> {
        self.parts.iter()
    }
}

fn parse_signature<'de, D>(deserializer: D) -> std::result::Result<[u8; 3], D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(&cleaned).map_err(serde::de::Error::custom)?;
    bytes
        .try_into()
        .map_err(|_| serde::de::Error::custom(format!("signature {:?} is not 3 bytes", s)))
}

/// Accepts `1024`, `0x400`, `1K`, `4KiB` and friends.
fn parse_size<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u32),
        Str(String),
    }

    match Deserialize::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => parse_size_str(&s).map_err(serde::de::Error::custom),
    }
}

fn parse_size_default<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    parse_size(deserializer)
}

fn parse_size_str(s: &str) -> Result<u32> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else if let Some(k) = s
        .strip_suffix("KiB")
        .or_else(|| s.strip_suffix("KB"))
        .or_else(|| s.strip_suffix("K"))
    {
        k.trim().parse::<u32>().ok().map(|n| n * 1024)
    } else {
        s.parse().ok()
    };
    parsed.ok_or_else(|| anyhow::format_err!("cannot parse size {:?}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_loads() {
        let db = PartDb::load().unwrap();
        assert!(db.iter().count() >= 7);
    }

    #[test]
    fn find_by_id_name_or_alias() {
        assert_eq!(PartDb::find("m328p").unwrap().name, "ATmega328P");
        assert_eq!(PartDb::find("ATMEGA328P").unwrap().id, "m328p");
        assert_eq!(PartDb::find("atmega328").unwrap().id, "m328p");
        assert!(PartDb::find("z80").is_err());
    }

    #[test]
    fn atmega328p_shape() {
        let part = PartDb::find("m328p").unwrap();
        assert_eq!(part.signature, [0x1e, 0x95, 0x0f]);
        let flash = part.flash().unwrap();
        assert!(flash.paged);
        assert_eq!(flash.size, 32 * 1024);
        assert_eq!(flash.page_size, 128);
        assert_eq!(flash.pages(), 256);
        assert!(flash.has_op(OpKind::ReadLo));
        assert!(flash.has_op(OpKind::ReadHi));
        assert!(flash.has_op(OpKind::LoadpageLo));
        assert!(flash.has_op(OpKind::Writepage));
        assert!(!flash.has_op(OpKind::LoadExtAddr));
        assert!(part.op(OpKind::PgmEnable).is_some());
        assert!(part.op(OpKind::ChipErase).is_some());
    }

    #[test]
    fn atmega2560_has_extended_addressing() {
        let part = PartDb::find("m2560").unwrap();
        let flash = part.flash().unwrap();
        assert_eq!(flash.size, 256 * 1024);
        let lext = flash.op(OpKind::LoadExtAddr).unwrap();
        assert!(lext.uses_address_bit(16));
    }

    #[test]
    fn attiny10_is_tpi_only() {
        let part = PartDb::find("t10").unwrap();
        assert!(part.is_tpi());
        assert!(!part.has_mode(ProgMode::Isp));
        let flash = part.flash().unwrap();
        assert_eq!(flash.offset, 0x4000);
    }

    #[test]
    fn pgm_enable_assembles_to_datasheet_bytes() {
        let part = PartDb::find("m328p").unwrap();
        let mut cmd = [0u8; 4];
        part.op(OpKind::PgmEnable).unwrap().set_bits(&mut cmd);
        assert_eq!(cmd, [0xac, 0x53, 0x00, 0x00]);
    }

    #[test]
    fn size_strings() {
        assert_eq!(parse_size_str("1024").unwrap(), 1024);
        assert_eq!(parse_size_str("0x400").unwrap(), 1024);
        assert_eq!(parse_size_str("32K").unwrap(), 32768);
        assert_eq!(parse_size_str("4KiB").unwrap(), 4096);
        assert!(parse_size_str("lots").is_err());
    }
}
