//! Bytecode disassembler.
//!
//! Decodes an image with the same opcode table the assembler encodes with.
//! Code-segment constants follow the code, so decoding can be bounded with
//! [`Disassembler::with_limit`].

use super::opcode::{Cond, Opcode, Operand, RuntimeParameter};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DisasmError {
    #[error("unknown opcode {byte:#04x} at offset {offset:#x}")]
    UnknownOpcode { offset: usize, byte: u8 },

    #[error("truncated {opcode} at offset {offset:#x}")]
    Truncated { offset: usize, opcode: Opcode },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedOperand {
    Reg(Operand, u8),
    Byte(u8),
    Imm(u64),
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstr {
    pub offset: usize,
    pub opcode: Opcode,
    pub operands: Vec<DecodedOperand>,
}

impl DecodedInstr {
    pub fn size(&self) -> usize {
        self.opcode.encoded_size()
    }

    /// Absolute target of a relative jump or call.
    pub fn branch_target(&self) -> Option<usize> {
        if !self.opcode.is_relative() {
            return None;
        }
        match self.operands.last() {
            Some(DecodedOperand::Imm(rel)) => {
                let next = (self.offset + self.size()) as i64;
                usize::try_from(next + *rel as i64).ok()
            }
            _ => None,
        }
    }

    fn fmt_byte(&self, index: usize, byte: u8, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode {
            Opcode::Cmp | Opcode::CmpImm | Opcode::FCmp => match Cond::from_byte(byte) {
                Some(cond) => f.write_str(cond.mnemonic()),
                None => write!(f, "cond?{byte}"),
            },
            Opcode::RuntimeParam => match RuntimeParameter::from_byte(byte) {
                Some(param) => f.write_str(param.name()),
                None => write!(f, "param?{byte}"),
            },
            Opcode::IntToFloat | Opcode::FloatToInt if index == 2 => {
                f.write_str(if byte != 0 { "s" } else { "u" })
            }
            _ => write!(f, "{byte}"),
        }
    }
}

impl fmt::Display for DecodedInstr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06x}: {}", self.offset, self.opcode)?;
        for (index, operand) in self.operands.iter().enumerate() {
            f.write_str(if index == 0 { " " } else { ", " })?;
            match operand {
                DecodedOperand::Reg(Operand::F, id) => write!(f, "f{id}")?,
                DecodedOperand::Reg(Operand::X, id) => write!(f, "%{id}")?,
                DecodedOperand::Reg(_, id) => write!(f, "r{id}")?,
                DecodedOperand::Byte(byte) => self.fmt_byte(index, *byte, f)?,
                DecodedOperand::Imm(v) => write!(f, "{}", *v as i64)?,
            }
        }
        if let Some(target) = self.branch_target() {
            write!(f, " ; -> {target:06x}")?;
        }
        Ok(())
    }
}

/// Iterator over the instructions of an image.
pub struct Disassembler<'a> {
    code: &'a [u8],
    offset: usize,
    limit: usize,
}

impl<'a> Disassembler<'a> {
    pub fn new(code: &'a [u8]) -> Self {
        Self {
            code,
            offset: 0,
            limit: code.len(),
        }
    }

    /// Stop decoding at `limit` bytes.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.min(self.code.len());
        self
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    fn decode_one(&mut self) -> Result<DecodedInstr, DisasmError> {
        let offset = self.offset;
        let byte = self.code[offset];
        let opcode =
            Opcode::from_byte(byte).ok_or(DisasmError::UnknownOpcode { offset, byte })?;
        if offset + opcode.encoded_size() > self.limit {
            return Err(DisasmError::Truncated { offset, opcode });
        }

        let mut cursor = offset + 1;
        let mut operands = Vec::with_capacity(opcode.operands().len());
        for kind in opcode.operands() {
            let operand = match kind {
                Operand::I => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&self.code[cursor..cursor + 8]);
                    DecodedOperand::Imm(u64::from_le_bytes(raw))
                }
                Operand::B => DecodedOperand::Byte(self.code[cursor]),
                reg => DecodedOperand::Reg(*reg, self.code[cursor]),
            };
            cursor += kind.encoded_size();
            operands.push(operand);
        }
        self.offset = cursor;
        Ok(DecodedInstr {
            offset,
            opcode,
            operands,
        })
    }
}

impl Iterator for Disassembler<'_> {
    type Item = Result<DecodedInstr, DisasmError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.limit {
            return None;
        }
        let result = self.decode_one();
        if result.is_err() {
            // Stop after the first undecodable byte.
            self.offset = self.limit;
        }
        Some(result)
    }
}

/// Decode the first `limit` bytes of `code` into a listing.
pub fn disassemble(code: &[u8], limit: usize) -> Result<Vec<DecodedInstr>, DisasmError> {
    Disassembler::new(code).with_limit(limit).collect()
}
