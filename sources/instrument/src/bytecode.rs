use anyhow::anyhow;
use support::bytes_ext::ByteSlice;
use tracing::warn;

use crate::error::InstrumentResult;
use crate::opcode::{IINC, LOOKUPSWITCH, TABLESWITCH, WIDE};

/// Fixed instruction lengths, zero where the length depends on the operands
/// or the opcode is not defined.
const LENGTHS: [u8; 256] = build_lengths();

const fn build_lengths() -> [u8; 256] {
    let mut lengths = [0u8; 256];
    let mut opcode = 0;
    while opcode < 256 {
        lengths[opcode] = match opcode as u8 {
            0x00..=0x0f => 1,
            0x10 => 2,
            0x11 => 3,
            0x12 => 2,
            0x13 | 0x14 => 3,
            0x15..=0x19 => 2,
            0x1a..=0x35 => 1,
            0x36..=0x3a => 2,
            0x3b..=0x83 => 1,
            0x84 => 3,
            0x85..=0x98 => 1,
            0x99..=0xa8 => 3,
            0xa9 => 2,
            0xac..=0xb1 => 1,
            0xb2..=0xb8 => 3,
            0xb9 | 0xba => 5,
            0xbb => 3,
            0xbc => 2,
            0xbd => 3,
            0xbe | 0xbf => 1,
            0xc0 | 0xc1 => 3,
            0xc2 | 0xc3 => 1,
            0xc5 => 4,
            0xc6 | 0xc7 => 3,
            0xc8 | 0xc9 => 5,
            0xca => 1,
            _ => 0,
        };
        opcode += 1;
    }
    lengths
}

/// Bytes between a switch opcode at `bci` and its 4-aligned operands.
pub fn padding(bci: usize) -> usize {
    (4 - (bci + 1) % 4) % 4
}

/// Length of the instruction at `bci`. Switch operands are read assuming the
/// padding implied by `bci`; see [`switch_length`] for stale layouts.
pub fn instruction_length(code: &[u8], bci: usize) -> InstrumentResult<usize> {
    let opcode = *code
        .get(bci)
        .ok_or_else(|| anyhow!("no instruction at {} (code is {} bytes)", bci, code.len()))?;

    match opcode {
        TABLESWITCH | LOOKUPSWITCH => switch_length(code, bci, padding(bci)),
        WIDE => match code.get(bci + 1) {
            Some(&IINC) => Ok(6),
            Some(_) => Ok(4),
            None => Err(anyhow!("truncated wide instruction at {}", bci).into()),
        },
        _ => match LENGTHS[opcode as usize] {
            0 => {
                warn!("unknown opcode {:#04x} at {}, assuming 1 byte", opcode, bci);
                Ok(1)
            }
            length => Ok(length as usize),
        },
    }
}

/// Length of the switch at `bci` whose operands start after `padding` bytes.
pub fn switch_length(code: &[u8], bci: usize, padding: usize) -> InstrumentResult<usize> {
    let base = bci + 1 + padding;

    let length = if code.get(bci) == Some(&LOOKUPSWITCH) {
        let pairs = code.i32_at(base + 4)?;
        if pairs < 0 {
            return Err(anyhow!("lookupswitch at {} has {} pairs", bci, pairs).into());
        }

        1 + padding + 8 + 8 * pairs as usize
    } else {
        let low = code.i32_at(base + 4)?;
        let high = code.i32_at(base + 8)?;
        if high < low {
            return Err(anyhow!("tableswitch at {} has bounds {}..{}", bci, low, high).into());
        }

        1 + padding + 12 + 4 * (high as i64 - low as i64 + 1) as usize
    };

    Ok(length)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub bci: usize,
    pub opcode: u8,
    pub length: usize,
}

impl Instruction {
    pub fn next(&self) -> usize {
        self.bci + self.length
    }
}

/// Walks instruction boundaries of a method body.
pub struct Cursor<'a> {
    code: &'a [u8],
    bci: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(code: &'a [u8]) -> Self {
        Self { code, bci: 0 }
    }

    pub fn bci(&self) -> usize {
        self.bci
    }

    pub fn next_instruction(&mut self) -> InstrumentResult<Option<Instruction>> {
        if self.bci >= self.code.len() {
            return Ok(None);
        }

        let instruction = Instruction {
            bci: self.bci,
            opcode: self.code[self.bci],
            length: instruction_length(self.code, self.bci)?,
        };

        self.bci = instruction.next();
        if self.bci > self.code.len() {
            return Err(anyhow!(
                "instruction at {} runs past the end of the code",
                instruction.bci
            )
            .into());
        }

        Ok(Some(instruction))
    }
}

pub fn scan(code: &[u8]) -> InstrumentResult<Vec<Instruction>> {
    let mut cursor = Cursor::new(code);
    let mut instructions = Vec::new();

    while let Some(instruction) = cursor.next_instruction()? {
        instructions.push(instruction);
    }

    Ok(instructions)
}
