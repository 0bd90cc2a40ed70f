// This module defines the bytecode opcode table of the companion register VM. Every
// instruction is a one-byte opcode followed by a fixed list of operands: register indices
// and small enumerations take one byte, immediates and stack displacements take eight
// little-endian bytes. The table is written once through the `opcodes!` macro so the
// encoder in `assembler` and the decoder in `disasm` cannot drift apart: the macro derives
// the Opcode enum, byte conversion, mnemonics and operand layouts from the same rows.
// The smaller enumerations carried as operand bytes (comparison conditions, runtime
// parameters) and the integer/float ALU operation kinds also live here.

//! Opcode table shared by the encoder and the disassembler.

use std::fmt;

/// Kind of a single encoded operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Integer register index.
    R,
    /// Float register index.
    F,
    /// Register index whose bank is decided at run time.
    X,
    /// One-byte enumeration or size.
    B,
    /// Eight-byte little-endian immediate or displacement.
    I,
}

impl Operand {
    pub const fn encoded_size(self) -> usize {
        match self {
            Operand::I => 8,
            _ => 1,
        }
    }
}

macro_rules! opcodes {
    ($($name:ident = $code:literal, $mnemonic:literal, [$($operand:ident),*];)*) => {
        /// One-byte VM opcodes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($name = $code,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name,)*];

            pub fn from_byte(byte: u8) -> Option<Opcode> {
                match byte {
                    $($code => Some(Opcode::$name),)*
                    _ => None,
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic,)*
                }
            }

            pub fn operands(self) -> &'static [Operand] {
                match self {
                    $(Opcode::$name => &[$(Operand::$operand),*],)*
                }
            }
        }
    };
}

opcodes! {
    Halt = 0x00, "halt", [];
    MovImm = 0x01, "movi", [R, I];
    Mov = 0x02, "mov", [R, R];
    FMovImm = 0x03, "fmovi", [F, I];
    FMov = 0x04, "fmov", [F, F];

    Add = 0x10, "add", [R, R];
    Sub = 0x11, "sub", [R, R];
    Mul = 0x12, "mul", [R, R];
    DivS = 0x13, "divs", [R, R];
    DivU = 0x14, "divu", [R, R];
    RemS = 0x15, "rems", [R, R];
    RemU = 0x16, "remu", [R, R];
    And = 0x17, "and", [R, R];
    Or = 0x18, "or", [R, R];
    Xor = 0x19, "xor", [R, R];
    Shl = 0x1A, "shl", [R, R];
    ShrS = 0x1B, "shrs", [R, R];
    ShrU = 0x1C, "shru", [R, R];

    AddImm = 0x20, "addi", [R, I];
    SubImm = 0x21, "subi", [R, I];
    MulImm = 0x22, "muli", [R, I];
    DivSImm = 0x23, "divsi", [R, I];
    DivUImm = 0x24, "divui", [R, I];
    RemSImm = 0x25, "remsi", [R, I];
    RemUImm = 0x26, "remui", [R, I];
    AndImm = 0x27, "andi", [R, I];
    OrImm = 0x28, "ori", [R, I];
    XorImm = 0x29, "xori", [R, I];
    ShlImm = 0x2A, "shli", [R, I];
    ShrSImm = 0x2B, "shrsi", [R, I];
    ShrUImm = 0x2C, "shrui", [R, I];

    Cmp = 0x30, "cmp", [R, R, B];
    CmpImm = 0x31, "cmpi", [R, I, B];
    Neg = 0x32, "neg", [R];
    Not = 0x33, "not", [R];
    Mask = 0x34, "mask", [R, B];
    SignExtend = 0x35, "sext", [R, B];

    FAdd = 0x40, "fadd", [F, F];
    FSub = 0x41, "fsub", [F, F];
    FMul = 0x42, "fmul", [F, F];
    FDiv = 0x43, "fdiv", [F, F];
    FNeg = 0x44, "fneg", [F];
    FCmp = 0x45, "fcmp", [R, F, F, B];
    IntToFloat = 0x46, "itof", [F, R, B];
    FloatToInt = 0x47, "ftoi", [R, F, B];
    FNarrow = 0x48, "fnarrow", [F];

    LoadStack = 0x50, "lds", [R, I];
    StoreStack = 0x51, "sts", [R, I, B];
    FLoadStack = 0x52, "flds", [F, I, B];
    FStoreStack = 0x53, "fsts", [F, I, B];
    LoadPtr = 0x54, "ldp", [R, R];
    StorePtr = 0x55, "stp", [R, R, B];
    FLoadPtr = 0x56, "fldp", [F, R, B];
    FStorePtr = 0x57, "fstp", [R, F, B];
    LeaStack = 0x58, "leas", [R, I];
    CopyStack = 0x59, "cpys", [I, I, I];
    CopyMem = 0x5A, "cpym", [R, R, I];
    RuntimeParam = 0x5B, "rtparam", [R, B];

    StackAdjust = 0x60, "sadj", [I];
    Push = 0x61, "push", [R];
    FPush = 0x62, "fpush", [F];
    PushImm = 0x63, "pushi", [I];

    Jmp = 0x70, "jmp", [I];
    Jz = 0x71, "jz", [R, I];
    Jnz = 0x72, "jnz", [R, I];
    Call = 0x73, "call", [I];
    CallPtr = 0x74, "callp", [R];
    Ret = 0x75, "ret", [];
    CallExternal = 0x76, "callx", [X];
}

impl Opcode {
    /// Total encoded size including the opcode byte.
    pub fn encoded_size(self) -> usize {
        1 + self
            .operands()
            .iter()
            .map(|operand| operand.encoded_size())
            .sum::<usize>()
    }

    /// Whether the last immediate is a displacement relative to the next instruction.
    pub fn is_relative(self) -> bool {
        matches!(self, Opcode::Jmp | Opcode::Jz | Opcode::Jnz | Opcode::Call)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Integer ALU operations with a register and an immediate form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
    Add,
    Sub,
    Mul,
    DivS,
    DivU,
    RemS,
    RemU,
    And,
    Or,
    Xor,
    Shl,
    ShrS,
    ShrU,
}

impl AluOp {
    pub fn reg_opcode(self) -> Opcode {
        match self {
            AluOp::Add => Opcode::Add,
            AluOp::Sub => Opcode::Sub,
            AluOp::Mul => Opcode::Mul,
            AluOp::DivS => Opcode::DivS,
            AluOp::DivU => Opcode::DivU,
            AluOp::RemS => Opcode::RemS,
            AluOp::RemU => Opcode::RemU,
            AluOp::And => Opcode::And,
            AluOp::Or => Opcode::Or,
            AluOp::Xor => Opcode::Xor,
            AluOp::Shl => Opcode::Shl,
            AluOp::ShrS => Opcode::ShrS,
            AluOp::ShrU => Opcode::ShrU,
        }
    }

    pub fn imm_opcode(self) -> Opcode {
        match self {
            AluOp::Add => Opcode::AddImm,
            AluOp::Sub => Opcode::SubImm,
            AluOp::Mul => Opcode::MulImm,
            AluOp::DivS => Opcode::DivSImm,
            AluOp::DivU => Opcode::DivUImm,
            AluOp::RemS => Opcode::RemSImm,
            AluOp::RemU => Opcode::RemUImm,
            AluOp::And => Opcode::AndImm,
            AluOp::Or => Opcode::OrImm,
            AluOp::Xor => Opcode::XorImm,
            AluOp::Shl => Opcode::ShlImm,
            AluOp::ShrS => Opcode::ShrSImm,
            AluOp::ShrU => Opcode::ShrUImm,
        }
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            AluOp::Add | AluOp::Mul | AluOp::And | AluOp::Or | AluOp::Xor
        )
    }

    pub fn is_division(self) -> bool {
        matches!(self, AluOp::DivS | AluOp::DivU | AluOp::RemS | AluOp::RemU)
    }

    /// Whether applying the operation with `imm` leaves the register unchanged.
    pub fn is_identity(self, imm: u64) -> bool {
        match self {
            AluOp::Add | AluOp::Sub | AluOp::Or | AluOp::Xor => imm == 0,
            AluOp::Shl | AluOp::ShrS | AluOp::ShrU => imm == 0,
            AluOp::Mul | AluOp::DivS | AluOp::DivU => imm == 1,
            _ => false,
        }
    }
}

/// Float ALU operations (register form only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FAluOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl FAluOp {
    pub fn opcode(self) -> Opcode {
        match self {
            FAluOp::Add => Opcode::FAdd,
            FAluOp::Sub => Opcode::FSub,
            FAluOp::Mul => Opcode::FMul,
            FAluOp::Div => Opcode::FDiv,
        }
    }
}

/// Comparison condition, encoded as one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cond {
    Eq = 0,
    Ne = 1,
    LtS = 2,
    LeS = 3,
    GtS = 4,
    GeS = 5,
    LtU = 6,
    LeU = 7,
    GtU = 8,
    GeU = 9,
}

impl Cond {
    pub fn from_byte(byte: u8) -> Option<Cond> {
        Some(match byte {
            0 => Cond::Eq,
            1 => Cond::Ne,
            2 => Cond::LtS,
            3 => Cond::LeS,
            4 => Cond::GtS,
            5 => Cond::GeS,
            6 => Cond::LtU,
            7 => Cond::LeU,
            8 => Cond::GtU,
            9 => Cond::GeU,
            _ => return None,
        })
    }

    /// Condition that holds for `b ? a` whenever `self` holds for `a ? b`.
    pub fn swapped(self) -> Cond {
        match self {
            Cond::Eq | Cond::Ne => self,
            Cond::LtS => Cond::GtS,
            Cond::LeS => Cond::GeS,
            Cond::GtS => Cond::LtS,
            Cond::GeS => Cond::LeS,
            Cond::LtU => Cond::GtU,
            Cond::LeU => Cond::GeU,
            Cond::GtU => Cond::LtU,
            Cond::GeU => Cond::LeU,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::LtS => "lts",
            Cond::LeS => "les",
            Cond::GtS => "gts",
            Cond::GeS => "ges",
            Cond::LtU => "ltu",
            Cond::LeU => "leu",
            Cond::GtU => "gtu",
            Cond::GeU => "geu",
        }
    }
}

/// Base pointers the VM provides at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RuntimeParameter {
    CodeBase = 0,
    InstructionPointer = 1,
    StackBase = 2,
}

impl RuntimeParameter {
    pub fn from_byte(byte: u8) -> Option<RuntimeParameter> {
        match byte {
            0 => Some(RuntimeParameter::CodeBase),
            1 => Some(RuntimeParameter::InstructionPointer),
            2 => Some(RuntimeParameter::StackBase),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RuntimeParameter::CodeBase => "code_base",
            RuntimeParameter::InstructionPointer => "ip",
            RuntimeParameter::StackBase => "stack_base",
        }
    }
}
