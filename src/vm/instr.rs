//! Low-level instructions produced by lowering.
//!
//! An [`Instr`] is bound to concrete registers, but its stack displacements,
//! jump targets and frame sizes may still be symbolic: they are resolved by
//! the assembler once every frame has reached its final size and every label
//! has a position. Labels, comments and debug locations are pseudo
//! instructions that occupy zero bytes.

use super::opcode::{AluOp, Cond, FAluOp, Opcode, RuntimeParameter};
use crate::core::{AsmReg, ConstId, FrameId, Position, RegBank, StackSlot};
use std::fmt;

/// Jump/call target allocated up front and positioned during assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelId(pub u32);

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Immediate operand, possibly an address known only after layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Imm {
    Value(u64),
    /// Offset of a code-segment blob from the code base.
    ConstantAddress(ConstId),
    /// Offset of a label from the code base.
    LabelAddress(LabelId),
}

impl fmt::Display for Imm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Imm::Value(v) => write!(f, "{}", *v as i64),
            Imm::ConstantAddress(id) => write!(f, "@const{}", id.0),
            Imm::LabelAddress(label) => write!(f, "@{label}"),
        }
    }
}

/// Stack pointer adjustment, resolved at assembly time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackAmount {
    /// Prologue: reserve the frame minus the return address pushed by `Call`.
    FrameEnter(FrameId),
    /// Epilogue: release what `FrameEnter` reserved.
    FrameLeave(FrameId),
    /// Entry stub: skip the static segment.
    StaticSegment,
}

impl fmt::Display for StackAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackAmount::FrameEnter(frame) => write!(f, "+frame{}", frame.0),
            StackAmount::FrameLeave(frame) => write!(f, "-frame{}", frame.0),
            StackAmount::StaticSegment => write!(f, "static"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instr<'s> {
    // Pseudo instructions.
    Label(LabelId),
    Comment(&'s str),
    DebugLocation {
        name: &'s str,
        position: Position,
        frame: Option<FrameId>,
    },
    /// Raw read-only data appended after the code.
    Data {
        id: ConstId,
        bytes: &'s [u8],
    },

    Halt,
    /// Bank of `dst` selects `movi` or `fmovi`.
    MovImm {
        dst: AsmReg,
        imm: Imm,
    },
    Mov {
        dst: AsmReg,
        src: AsmReg,
    },
    Alu {
        op: AluOp,
        dst: AsmReg,
        src: AsmReg,
    },
    AluImm {
        op: AluOp,
        dst: AsmReg,
        imm: Imm,
    },
    /// `lhs = (lhs cond rhs) as u64`.
    Cmp {
        lhs: AsmReg,
        rhs: AsmReg,
        cond: Cond,
    },
    CmpImm {
        lhs: AsmReg,
        imm: u64,
        cond: Cond,
    },
    Neg(AsmReg),
    Not(AsmReg),
    Mask {
        reg: AsmReg,
        size: u8,
    },
    SignExtend {
        reg: AsmReg,
        size: u8,
    },
    FAlu {
        op: FAluOp,
        dst: AsmReg,
        src: AsmReg,
    },
    FNeg(AsmReg),
    /// Round a float register to single precision.
    FNarrow(AsmReg),
    FCmp {
        dst: AsmReg,
        lhs: AsmReg,
        rhs: AsmReg,
        cond: Cond,
    },
    IntToFloat {
        dst: AsmReg,
        src: AsmReg,
        signed: bool,
    },
    FloatToInt {
        dst: AsmReg,
        src: AsmReg,
        signed: bool,
    },
    /// Integer loads read eight bytes; float loads honour `size`.
    LoadStack {
        dst: AsmReg,
        slot: StackSlot,
        size: u8,
    },
    StoreStack {
        src: AsmReg,
        slot: StackSlot,
        size: u8,
    },
    LoadPtr {
        dst: AsmReg,
        ptr: AsmReg,
        size: u8,
    },
    StorePtr {
        ptr: AsmReg,
        src: AsmReg,
        size: u8,
    },
    LeaStack {
        dst: AsmReg,
        slot: StackSlot,
    },
    CopyStack {
        dst: StackSlot,
        src: StackSlot,
        size: u64,
    },
    CopyMem {
        dst: AsmReg,
        src: AsmReg,
        size: u64,
    },
    RuntimeParam {
        dst: AsmReg,
        param: RuntimeParameter,
    },
    StackAdjust(StackAmount),
    Push(AsmReg),
    PushImm(u64),
    Jump(LabelId),
    JumpIf {
        reg: AsmReg,
        target: LabelId,
        when_nonzero: bool,
    },
    Call(LabelId),
    CallPtr(AsmReg),
    Ret,
    CallExternal {
        dst: AsmReg,
    },
}

impl<'s> Instr<'s> {
    /// Opcode this instruction encodes to, or `None` for pseudo instructions.
    pub fn opcode(&self) -> Option<Opcode> {
        let float = |reg: &AsmReg| reg.bank == RegBank::Float;
        Some(match self {
            Instr::Label(_) | Instr::Comment(_) | Instr::DebugLocation { .. } | Instr::Data { .. } => {
                return None
            }
            Instr::Halt => Opcode::Halt,
            Instr::MovImm { dst, .. } if float(dst) => Opcode::FMovImm,
            Instr::MovImm { .. } => Opcode::MovImm,
            Instr::Mov { dst, .. } if float(dst) => Opcode::FMov,
            Instr::Mov { .. } => Opcode::Mov,
            Instr::Alu { op, .. } => op.reg_opcode(),
            Instr::AluImm { op, .. } => op.imm_opcode(),
            Instr::Cmp { .. } => Opcode::Cmp,
            Instr::CmpImm { .. } => Opcode::CmpImm,
            Instr::Neg(_) => Opcode::Neg,
            Instr::Not(_) => Opcode::Not,
            Instr::Mask { .. } => Opcode::Mask,
            Instr::SignExtend { .. } => Opcode::SignExtend,
            Instr::FAlu { op, .. } => op.opcode(),
            Instr::FNeg(_) => Opcode::FNeg,
            Instr::FNarrow(_) => Opcode::FNarrow,
            Instr::FCmp { .. } => Opcode::FCmp,
            Instr::IntToFloat { .. } => Opcode::IntToFloat,
            Instr::FloatToInt { .. } => Opcode::FloatToInt,
            Instr::LoadStack { dst, .. } if float(dst) => Opcode::FLoadStack,
            Instr::LoadStack { .. } => Opcode::LoadStack,
            Instr::StoreStack { src, .. } if float(src) => Opcode::FStoreStack,
            Instr::StoreStack { .. } => Opcode::StoreStack,
            Instr::LoadPtr { dst, .. } if float(dst) => Opcode::FLoadPtr,
            Instr::LoadPtr { .. } => Opcode::LoadPtr,
            Instr::StorePtr { src, .. } if float(src) => Opcode::FStorePtr,
            Instr::StorePtr { .. } => Opcode::StorePtr,
            Instr::LeaStack { .. } => Opcode::LeaStack,
            Instr::CopyStack { .. } => Opcode::CopyStack,
            Instr::CopyMem { .. } => Opcode::CopyMem,
            Instr::RuntimeParam { .. } => Opcode::RuntimeParam,
            Instr::StackAdjust(_) => Opcode::StackAdjust,
            Instr::Push(reg) if float(reg) => Opcode::FPush,
            Instr::Push(_) => Opcode::Push,
            Instr::PushImm(_) => Opcode::PushImm,
            Instr::Jump(_) => Opcode::Jmp,
            Instr::JumpIf {
                when_nonzero: false,
                ..
            } => Opcode::Jz,
            Instr::JumpIf { .. } => Opcode::Jnz,
            Instr::Call(_) => Opcode::Call,
            Instr::CallPtr(_) => Opcode::CallPtr,
            Instr::Ret => Opcode::Ret,
            Instr::CallExternal { .. } => Opcode::CallExternal,
        })
    }

    /// Labels, comments and debug locations.
    pub fn is_marker(&self) -> bool {
        matches!(
            self,
            Instr::Label(_) | Instr::Comment(_) | Instr::DebugLocation { .. }
        )
    }

    /// Size before any optimisation.
    pub fn nominal_size(&self) -> usize {
        match self {
            Instr::Data { bytes, .. } => bytes.len(),
            _ => self.opcode().map_or(0, Opcode::encoded_size),
        }
    }

    /// Whether the instruction has no effect on its own. Stack adjustments
    /// depend on final frame sizes and are judged by the assembler.
    pub fn is_noop(&self) -> bool {
        match self {
            Instr::Mov { dst, src } => dst == src,
            Instr::AluImm {
                op,
                imm: Imm::Value(v),
                ..
            } => op.is_identity(*v),
            _ => false,
        }
    }
}

impl fmt::Display for Instr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Label(label) => return write!(f, "{label}:"),
            Instr::Comment(text) => return write!(f, "; {text}"),
            Instr::DebugLocation { name, position, .. } => {
                return write!(f, "; loc {name} = {position}")
            }
            Instr::Data { id, bytes } => return write!(f, "const{}: {} bytes", id.0, bytes.len()),
            _ => {}
        }
        let Some(opcode) = self.opcode() else {
            return Ok(());
        };
        write!(f, "{opcode}")?;
        match self {
            Instr::MovImm { dst, imm } | Instr::AluImm { dst, imm, .. } => write!(f, " {dst}, {imm}"),
            Instr::Mov { dst, src }
            | Instr::Alu { dst, src, .. }
            | Instr::FAlu { dst, src, .. } => write!(f, " {dst}, {src}"),
            Instr::Cmp { lhs, rhs, cond } => write!(f, " {lhs}, {rhs}, {}", cond.mnemonic()),
            Instr::CmpImm { lhs, imm, cond } => {
                write!(f, " {lhs}, {}, {}", *imm as i64, cond.mnemonic())
            }
            Instr::Neg(reg)
            | Instr::Not(reg)
            | Instr::FNeg(reg)
            | Instr::FNarrow(reg)
            | Instr::Push(reg) => {
                write!(f, " {reg}")
            }
            Instr::CallPtr(reg) | Instr::CallExternal { dst: reg } => write!(f, " {reg}"),
            Instr::Mask { reg, size } | Instr::SignExtend { reg, size } => {
                write!(f, " {reg}, {size}")
            }
            Instr::FCmp {
                dst,
                lhs,
                rhs,
                cond,
            } => write!(f, " {dst}, {lhs}, {rhs}, {}", cond.mnemonic()),
            Instr::IntToFloat { dst, src, signed } | Instr::FloatToInt { dst, src, signed } => {
                write!(f, " {dst}, {src}, {}", if *signed { "s" } else { "u" })
            }
            Instr::LoadStack { dst, slot, size } => {
                write!(f, " {dst}, {}, {size}", Position::Stack(*slot))
            }
            Instr::StoreStack { src, slot, size } => {
                write!(f, " {}, {src}, {size}", Position::Stack(*slot))
            }
            Instr::LoadPtr { dst, ptr, size } => write!(f, " {dst}, [{ptr}], {size}"),
            Instr::StorePtr { ptr, src, size } => write!(f, " [{ptr}], {src}, {size}"),
            Instr::LeaStack { dst, slot } => write!(f, " {dst}, {}", Position::Stack(*slot)),
            Instr::CopyStack { dst, src, size } => write!(
                f,
                " {}, {}, {size}",
                Position::Stack(*dst),
                Position::Stack(*src)
            ),
            Instr::CopyMem { dst, src, size } => write!(f, " [{dst}], [{src}], {size}"),
            Instr::RuntimeParam { dst, param } => write!(f, " {dst}, {}", param.name()),
            Instr::StackAdjust(amount) => write!(f, " {amount}"),
            Instr::PushImm(v) => write!(f, " {v}"),
            Instr::Jump(target) | Instr::Call(target) => write!(f, " {target}"),
            Instr::JumpIf { reg, target, .. } => write!(f, " {reg}, {target}"),
            _ => Ok(()),
        }
    }
}
