//! Target side of vmgen: the VM's opcode table, low-level instructions,
//! the two-pass assembler, the calling convention and a disassembler.

pub mod assembler;
pub mod calling_convention;
pub mod disasm;
pub mod instr;
pub mod opcode;

pub use assembler::{AssembledImage, Assembler, Extent, FrameLayout, Marker, MarkerKind};
pub use calling_convention::{
    ArgClass, ArgLocation, CCAssigner, CCAssignment, CallLayout, ReturnLocation, VmAssigner,
    RETURN_POINTER_OFFSET,
};
pub use disasm::{disassemble, DecodedInstr, DecodedOperand, DisasmError, Disassembler};
pub use instr::{Imm, Instr, LabelId, StackAmount};
pub use opcode::{AluOp, Cond, FAluOp, Opcode, Operand, RuntimeParameter};
