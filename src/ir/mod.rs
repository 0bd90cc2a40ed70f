//! Mid-level operations handed to the backend by the front-end.
//!
//! A function body is a program-ordered list of [`MidInstr`]s over
//! [`ValueId`]s. Operations are created through
//! [`FunctionBuilder`](builder::FunctionBuilder), which validates them and
//! counts every operand use so lowering can tell when a value dies.

pub mod builder;

pub use builder::{FunctionBuilder, LoweredFunction, LoweredProgram, Module};

use crate::core::{FrameId, SourceLoc, Signature, ValueId};
use crate::vm::{AluOp, CallLayout, Cond, FAluOp, LabelId};
use std::fmt;
use std::rc::Rc;

/// Index of a declared function within its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn{}", self.0)
    }
}

/// How calls to a function are made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    /// Generated in this module and called with `call`.
    Internal,
    /// Provided by the VM host and called with `callext`.
    External { handle: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

impl BinaryOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Rem => "rem",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::Shl => "shl",
            BinaryOp::Shr => "shr",
        }
    }

    pub fn is_commutative(self) -> bool {
        self.alu_op(false).is_commutative()
    }

    pub fn is_division(self) -> bool {
        matches!(self, BinaryOp::Div | BinaryOp::Rem)
    }

    pub fn is_bitwise(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or | BinaryOp::Xor)
    }

    pub fn is_shift(self) -> bool {
        matches!(self, BinaryOp::Shl | BinaryOp::Shr)
    }

    /// Integer ALU operation; `signed` picks the division and shift flavour.
    pub fn alu_op(self, signed: bool) -> AluOp {
        match (self, signed) {
            (BinaryOp::Add, _) => AluOp::Add,
            (BinaryOp::Sub, _) => AluOp::Sub,
            (BinaryOp::Mul, _) => AluOp::Mul,
            (BinaryOp::Div, true) => AluOp::DivS,
            (BinaryOp::Div, false) => AluOp::DivU,
            (BinaryOp::Rem, true) => AluOp::RemS,
            (BinaryOp::Rem, false) => AluOp::RemU,
            (BinaryOp::And, _) => AluOp::And,
            (BinaryOp::Or, _) => AluOp::Or,
            (BinaryOp::Xor, _) => AluOp::Xor,
            (BinaryOp::Shl, _) => AluOp::Shl,
            (BinaryOp::Shr, true) => AluOp::ShrS,
            (BinaryOp::Shr, false) => AluOp::ShrU,
        }
    }

    /// Float ALU operation, if the operator applies to floats.
    pub fn float_op(self) -> Option<FAluOp> {
        match self {
            BinaryOp::Add => Some(FAluOp::Add),
            BinaryOp::Sub => Some(FAluOp::Sub),
            BinaryOp::Mul => Some(FAluOp::Mul),
            BinaryOp::Div => Some(FAluOp::Div),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
            CompareOp::Lt => "lt",
            CompareOp::Le => "le",
            CompareOp::Gt => "gt",
            CompareOp::Ge => "ge",
        }
    }

    /// VM condition; floats use the signed conditions.
    pub fn cond(self, signed: bool) -> Cond {
        match (self, signed) {
            (CompareOp::Eq, _) => Cond::Eq,
            (CompareOp::Ne, _) => Cond::Ne,
            (CompareOp::Lt, true) => Cond::LtS,
            (CompareOp::Le, true) => Cond::LeS,
            (CompareOp::Gt, true) => Cond::GtS,
            (CompareOp::Ge, true) => Cond::GeS,
            (CompareOp::Lt, false) => Cond::LtU,
            (CompareOp::Le, false) => Cond::LeU,
            (CompareOp::Gt, false) => Cond::GtU,
            (CompareOp::Ge, false) => Cond::GeU,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    BitNot,
    LogicalNot,
}

impl UnaryOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::BitNot => "not",
            UnaryOp::LogicalNot => "lnot",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callee {
    Direct(FuncId),
    /// Through a function pointer value.
    Indirect(ValueId),
}

/// One mid-level operation.
#[derive(Debug, Clone, PartialEq)]
pub enum MidInstr<'s> {
    /// With `to_self`, `lhs` is a named value updated in place and `result == lhs`.
    Binary {
        op: BinaryOp,
        lhs: ValueId,
        rhs: ValueId,
        result: ValueId,
        to_self: bool,
    },
    Compare {
        cond: CompareOp,
        lhs: ValueId,
        rhs: ValueId,
        result: ValueId,
    },
    Unary {
        op: UnaryOp,
        operand: ValueId,
        result: ValueId,
    },
    Convert {
        value: ValueId,
        result: ValueId,
    },
    Assign {
        target: ValueId,
        value: ValueId,
    },
    Call {
        callee: Callee,
        args: Vec<ValueId>,
        result: Option<ValueId>,
    },
    AddressOf {
        value: ValueId,
        result: ValueId,
    },
    Dereference {
        pointer: ValueId,
        result: ValueId,
    },
    Store {
        pointer: ValueId,
        value: ValueId,
    },
    Member {
        pointer: ValueId,
        offset: u64,
        result: ValueId,
    },
    FunctionAddress {
        func: FuncId,
        result: ValueId,
    },
    Label(LabelId),
    Jump(LabelId),
    Branch {
        cond: ValueId,
        target: LabelId,
        jump_if: bool,
        spill_all: bool,
    },
    Return(Option<ValueId>),
    Comment(&'s str),
}

impl MidInstr<'_> {
    /// Values read by the operation; each entry is one counted use.
    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            MidInstr::Binary {
                lhs, rhs, to_self, ..
            } => {
                if *to_self {
                    vec![*rhs]
                } else {
                    vec![*lhs, *rhs]
                }
            }
            MidInstr::Compare { lhs, rhs, .. } => vec![*lhs, *rhs],
            MidInstr::Unary { operand, .. } => vec![*operand],
            MidInstr::Convert { value, .. } => vec![*value],
            MidInstr::Assign { value, .. } => vec![*value],
            MidInstr::Call { callee, args, .. } => {
                let mut operands = args.clone();
                if let Callee::Indirect(pointer) = callee {
                    operands.push(*pointer);
                }
                operands
            }
            MidInstr::AddressOf { value, .. } => vec![*value],
            MidInstr::Dereference { pointer, .. } => vec![*pointer],
            MidInstr::Store { pointer, value } => vec![*pointer, *value],
            MidInstr::Member { pointer, .. } => vec![*pointer],
            MidInstr::Branch { cond, .. } => vec![*cond],
            MidInstr::Return(value) => value.iter().copied().collect(),
            MidInstr::FunctionAddress { .. }
            | MidInstr::Label(_)
            | MidInstr::Jump(_)
            | MidInstr::Comment(_) => Vec::new(),
        }
    }

    /// Short name used for statistics.
    pub fn kind(&self) -> &'static str {
        match self {
            MidInstr::Binary { .. } => "binary",
            MidInstr::Compare { .. } => "compare",
            MidInstr::Unary { .. } => "unary",
            MidInstr::Convert { .. } => "convert",
            MidInstr::Assign { .. } => "assign",
            MidInstr::Call { .. } => "call",
            MidInstr::AddressOf { .. } => "address_of",
            MidInstr::Dereference { .. } => "dereference",
            MidInstr::Store { .. } => "store",
            MidInstr::Member { .. } => "member",
            MidInstr::FunctionAddress { .. } => "function_address",
            MidInstr::Label(_) => "label",
            MidInstr::Jump(_) => "jump",
            MidInstr::Branch { .. } => "branch",
            MidInstr::Return(_) => "return",
            MidInstr::Comment(_) => "comment",
        }
    }
}

impl fmt::Display for MidInstr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MidInstr::Binary {
                op,
                lhs,
                rhs,
                result,
                to_self: true,
            } if lhs == result => write!(f, "{lhs} {}= {rhs}", op.mnemonic()),
            MidInstr::Binary {
                op,
                lhs,
                rhs,
                result,
                ..
            } => write!(f, "{result} = {} {lhs}, {rhs}", op.mnemonic()),
            MidInstr::Compare {
                cond,
                lhs,
                rhs,
                result,
            } => write!(f, "{result} = cmp.{} {lhs}, {rhs}", cond.mnemonic()),
            MidInstr::Unary { op, operand, result } => {
                write!(f, "{result} = {} {operand}", op.mnemonic())
            }
            MidInstr::Convert { value, result } => write!(f, "{result} = convert {value}"),
            MidInstr::Assign { target, value } => write!(f, "{target} := {value}"),
            MidInstr::Call {
                callee,
                args,
                result,
            } => {
                if let Some(result) = result {
                    write!(f, "{result} = ")?;
                }
                match callee {
                    Callee::Direct(func) => write!(f, "call {func}(")?,
                    Callee::Indirect(pointer) => write!(f, "call *{pointer}(")?,
                }
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            MidInstr::AddressOf { value, result } => write!(f, "{result} = &{value}"),
            MidInstr::Dereference { pointer, result } => write!(f, "{result} = *{pointer}"),
            MidInstr::Store { pointer, value } => write!(f, "*{pointer} := {value}"),
            MidInstr::Member {
                pointer,
                offset,
                result,
            } => write!(f, "{result} = {pointer} + {offset}"),
            MidInstr::FunctionAddress { func, result } => write!(f, "{result} = &{func}"),
            MidInstr::Label(label) => write!(f, "{label}:"),
            MidInstr::Jump(label) => write!(f, "jump {label}"),
            MidInstr::Branch {
                cond,
                target,
                jump_if,
                spill_all,
            } => {
                let when = if *jump_if { "if" } else { "unless" };
                write!(f, "jump {target} {when} {cond}")?;
                if *spill_all {
                    write!(f, " (spill)")?;
                }
                Ok(())
            }
            MidInstr::Return(Some(value)) => write!(f, "return {value}"),
            MidInstr::Return(None) => write!(f, "return"),
            MidInstr::Comment(text) => write!(f, "; {text}"),
        }
    }
}

/// An operation and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Op<'s> {
    pub instr: MidInstr<'s>,
    pub loc: SourceLoc,
}

/// A declared function and everything lowering needs to know about it.
#[derive(Debug)]
pub struct FunctionDecl<'s> {
    pub name: &'s str,
    pub signature: Rc<Signature>,
    pub linkage: Linkage,
    pub layout: CallLayout,
    pub loc: SourceLoc,
    /// Present for internal functions.
    pub frame: Option<FrameId>,
    pub start: LabelId,
    pub epilogue: LabelId,
    pub params: Vec<ValueId>,
    /// Hidden parameter holding the caller's return buffer.
    pub return_pointer: Option<ValueId>,
    pub body: Option<Vec<Op<'s>>>,
}

impl FunctionDecl<'_> {
    pub fn is_external(&self) -> bool {
        matches!(self.linkage, Linkage::External { .. })
    }

    pub fn is_defined(&self) -> bool {
        self.body.is_some()
    }
}
