//! Bit-level description of AVR serial programming instructions.
//!
//! Every ISP instruction is four bytes on the wire. A part's datasheet
//! describes each of the 32 bits as either a fixed value, an address bit,
//! a data input bit, a data output bit, or a don't-care. The part database
//! carries these descriptions as 32-token pattern strings; this module
//! parses them and assembles/disassembles concrete commands.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Deserializer};

/// Role of a single bit slot inside a 4-byte instruction.
///
/// Slot `i` maps to bit `i % 8` of wire byte `3 - i / 8`, i.e. slot 31 is
/// the MSB of the first byte transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitSlot {
    /// Don't care on input, undefined on output.
    Ignore,
    /// Fixed instruction bit.
    Value(bool),
    /// Bit `n` of the (possibly word) address.
    Address(u8),
    /// Bit `n` of the data byte written to the target.
    Input(u8),
    /// Bit `n` of the data byte read back from the target.
    Output(u8),
}

/// One serial programming instruction template.
#[derive(Clone, PartialEq, Eq)]
pub struct Opcode {
    bits: [BitSlot; 32],
}

impl Opcode {
    /// Copy all fixed instruction bits into `cmd`. Idempotent.
    pub fn set_bits(&self, cmd: &mut [u8; 4]) {
        for (i, slot) in self.bits.iter().enumerate() {
            if let BitSlot::Value(v) = slot {
                let byte = 3 - i / 8;
                let mask = 1 << (i % 8);
                if *v {
                    cmd[byte] |= mask;
                } else {
                    cmd[byte] &= !mask;
                }
            }
        }
    }

    /// Copy the relevant bits of `addr` into the address slots of `cmd`.
    pub fn set_addr(&self, cmd: &mut [u8; 4], addr: u32) {
        for (i, slot) in self.bits.iter().enumerate() {
            if let BitSlot::Address(n) = slot {
                let byte = 3 - i / 8;
                let mask = 1 << (i % 8);
                if addr >> n & 1 != 0 {
                    cmd[byte] |= mask;
                } else {
                    cmd[byte] &= !mask;
                }
            }
        }
    }

    /// Copy the bits of `data` into the input slots of `cmd`.
    pub fn set_input(&self, cmd: &mut [u8; 4], data: u8) {
        for (i, slot) in self.bits.iter().enumerate() {
            if let BitSlot::Input(n) = slot {
                let byte = 3 - i / 8;
                let mask = 1 << (i % 8);
                if data >> n & 1 != 0 {
                    cmd[byte] |= mask;
                } else {
                    cmd[byte] &= !mask;
                }
            }
        }
    }

    /// Extract the output byte from a 4-byte response.
    pub fn get_output(&self, res: &[u8; 4]) -> u8 {
        let mut data = 0u8;
        for (i, slot) in self.bits.iter().enumerate() {
            if let BitSlot::Output(n) = slot {
                let byte = 3 - i / 8;
                if res[byte] >> (i % 8) & 1 != 0 {
                    data |= 1 << n;
                }
            }
        }
        data
    }

    /// True if any slot carries an address bit at index `n` or above.
    pub fn uses_address_bit(&self, n: u8) -> bool {
        self.bits
            .iter()
            .any(|s| matches!(s, BitSlot::Address(b) if *b >= n))
    }
}

impl fmt::Debug for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut cmd = [0u8; 4];
        self.set_bits(&mut cmd);
        write!(f, "Opcode[{}]", hex::encode(cmd))
    }
}

impl FromStr for Opcode {
    type Err = anyhow::Error;

    /// Parse a 32-token pattern, MSB of the first wire byte first.
    ///
    /// Tokens: `0`, `1`, `x`, `aN` (address bit N), `i`, `o`. Bare `i`/`o`
    /// tokens are numbered descending, the leftmost getting the highest
    /// bit index, so eight of them cover bits 7..=0.
    fn from_str(s: &str) -> Result<Self> {
        let tokens: Vec<&str> = s.split_whitespace().collect();
        anyhow::ensure!(
            tokens.len() == 32,
            "opcode pattern needs 32 tokens, got {}: {:?}",
            tokens.len(),
            s
        );

        let n_inputs = tokens.iter().filter(|t| **t == "i").count();
        let n_outputs = tokens.iter().filter(|t| **t == "o").count();
        anyhow::ensure!(n_inputs <= 8, "more than 8 input bits in {:?}", s);
        anyhow::ensure!(n_outputs <= 8, "more than 8 output bits in {:?}", s);

        let mut bits = [BitSlot::Ignore; 32];
        let mut next_input = n_inputs;
        let mut next_output = n_outputs;
        for (pos, token) in tokens.iter().enumerate() {
            // Token 0 is the MSB of cmd[0], i.e. slot 31.
            let slot = 31 - pos;
            bits[slot] = match *token {
                "0" => BitSlot::Value(false),
                "1" => BitSlot::Value(true),
                "x" => BitSlot::Ignore,
                "i" => {
                    next_input -= 1;
                    BitSlot::Input(next_input as u8)
                }
                "o" => {
                    next_output -= 1;
                    BitSlot::Output(next_output as u8)
                }
                t if t.starts_with('a') => {
                    let n: u8 = t[1..]
                        .parse()
                        .map_err(|_| anyhow::anyhow!("bad address token {:?} in {:?}", t, s))?;
                    anyhow::ensure!(n < 32, "address bit {} out of range in {:?}", n, s);
                    BitSlot::Address(n)
                }
                t => anyhow::bail!("unknown opcode token {:?} in {:?}", t, s),
            };
        }
        Ok(Opcode { bits })
    }
}

impl<'de> Deserialize<'de> for Opcode {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The serial programming instructions a part or memory region may define.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Read,
    Write,
    ReadLo,
    ReadHi,
    WriteLo,
    WriteHi,
    LoadpageLo,
    LoadpageHi,
    LoadExtAddr,
    Writepage,
    ChipErase,
    PgmEnable,
}

impl OpKind {
    pub const COUNT: usize = 12;

    const fn index(self) -> usize {
        self as usize
    }
}

/// Opcode table indexed by [`OpKind`], most entries typically absent.
#[derive(Debug, Clone, Default)]
pub struct OpcodeTable {
    ops: [Option<Opcode>; OpKind::COUNT],
}

impl OpcodeTable {
    pub fn get(&self, kind: OpKind) -> Option<&Opcode> {
        self.ops[kind.index()].as_ref()
    }

    pub fn insert(&mut self, kind: OpKind, op: Opcode) {
        self.ops[kind.index()] = Some(op);
    }

    pub fn contains(&self, kind: OpKind) -> bool {
        self.ops[kind.index()].is_some()
    }
}

impl<'de> Deserialize<'de> for OpcodeTable {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map: std::collections::BTreeMap<OpKind, Opcode> =
            Deserialize::deserialize(deserializer)?;
        let mut table = OpcodeTable::default();
        for (kind, op) in map {
            table.insert(kind, op);
        }
        Ok(table)
    }
}

// BTreeMap key ordering only, the wire never sees this.
impl Ord for OpKind {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self as usize).cmp(&(*other as usize))
    }
}

impl PartialOrd for OpKind {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
