//! Storage locations a value can occupy.

use super::register_file::AsmReg;
use std::fmt;

/// Identifier of a function frame whose size grows during lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u32);

/// Handle to a read-only data blob placed after the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConstId(pub u32);

/// What a stack offset is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackBase {
    /// Forward offset inside a function frame. The SP-relative displacement
    /// is `offset - frame_size` and is only known once lowering finishes.
    Frame(FrameId),
    /// Forward offset into the frame of the callee about to be invoked,
    /// i.e. `SP + offset` at the call site.
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackSlot {
    pub base: StackBase,
    pub offset: u32,
}

impl StackSlot {
    pub fn frame(frame: FrameId, offset: u32) -> Self {
        Self {
            base: StackBase::Frame(frame),
            offset,
        }
    }

    pub fn outgoing(offset: u32) -> Self {
        Self {
            base: StackBase::Outgoing,
            offset,
        }
    }

    /// The slot `delta` bytes further into the same area.
    pub fn advanced(self, delta: u32) -> Self {
        Self {
            base: self.base,
            offset: self.offset + delta,
        }
    }

    /// SP-relative displacement given the final size of its frame.
    pub fn displacement(&self, frame_size: u32) -> i64 {
        match self.base {
            StackBase::Frame(_) => self.offset as i64 - frame_size as i64,
            StackBase::Outgoing => self.offset as i64,
        }
    }
}

/// Closed set of storage kinds for a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Position {
    Register(AsmReg),
    Stack(StackSlot),
    Static(u64),
    CodeConstant(ConstId),
}

impl Position {
    pub fn register(&self) -> Option<AsmReg> {
        match self {
            Position::Register(reg) => Some(*reg),
            _ => None,
        }
    }

    pub fn stack_slot(&self) -> Option<StackSlot> {
        match self {
            Position::Stack(slot) => Some(*slot),
            _ => None,
        }
    }

    pub fn static_offset(&self) -> Option<u64> {
        match self {
            Position::Static(offset) => Some(*offset),
            _ => None,
        }
    }

    pub fn constant(&self) -> Option<ConstId> {
        match self {
            Position::CodeConstant(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_register(&self) -> bool {
        matches!(self, Position::Register(_))
    }

    /// Memory positions that are addressed through a runtime base pointer.
    pub fn needs_base_pointer(&self) -> bool {
        matches!(self, Position::Static(_) | Position::CodeConstant(_))
    }

    /// Whether both positions are the same storage kind.
    pub fn same_kind(&self, other: &Position) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Register(reg) => write!(f, "{reg}"),
            Position::Stack(StackSlot {
                base: StackBase::Frame(frame),
                offset,
            }) => write!(f, "frame{}[{}]", frame.0, offset),
            Position::Stack(StackSlot {
                base: StackBase::Outgoing,
                offset,
            }) => write!(f, "out[{offset}]"),
            Position::Static(offset) => write!(f, "static[{offset}]"),
            Position::CodeConstant(id) => write!(f, "const{}", id.0),
        }
    }
}
