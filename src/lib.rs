//! vmgen - register-allocating backend for a small register VM.
//!
//! vmgen takes typed mid-level operations (arithmetic, assignment, calls,
//! address-of, dereference, branches), assigns every value a register, a
//! frame slot, a static-segment slot or a code-segment constant, and lowers
//! the operations into VM instructions. A two-pass assembler then turns the
//! instruction list into a byte-exact bytecode image.
//!
//! # Primary Usage
//!
//! ```ignore
//! use bumpalo::Bump;
//! use vmgen::core::{CodegenOptions, CompilationSession, Signature, Type};
//! use vmgen::ir::{BinaryOp, Linkage, Module};
//!
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let mut module = Module::new(&session, CodegenOptions::default(), "main.src");
//!
//! let main = module.declare_function("main", Signature::new(vec![], Type::i64()), Linkage::Internal, 1)?;
//! module.set_entry(main, 1)?;
//! let mut f = module.define_function(main, &[], 1)?;
//! let x = f.variable(Type::i64(), "x")?;
//! let five = f.constant(Type::i64(), 5)?;
//! f.assign(x, five)?;
//! let one = f.constant(Type::i64(), 1)?;
//! f.binary_to_self(BinaryOp::Add, x, one)?;
//! f.ret(Some(x))?;
//! f.finish()?;
//!
//! let program = module.finish()?;
//! let image = program.assemble()?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - types, value handles, positions, register file, session
//! - [`codegen`] - allocation policies and value movement
//! - [`ir`] - mid-level operations and the module builder
//! - [`lower`] - lowering rules from operations to VM instructions
//! - [`vm`] - instruction set, calling convention, assembler, disassembler

pub mod codegen;
pub mod core;
pub mod ir;
pub mod lower;
pub mod vm;

pub use crate::core::{
    // Errors
    CompileError, CompileResult, Diagnostics, SourceLoc, Warning,
    // Session management
    CompilationSession, SessionStats, CodegenOptions,
    // Values and storage
    Position, StackSlot, Storage, Type, ValueId, ValueStore,
    // Register allocation
    AsmReg, RegBank, RegisterFile,
};
pub use crate::codegen::CodegenContext;
pub use crate::ir::{FunctionBuilder, LoweredProgram, Module};
pub use crate::vm::{AssembledImage, Assembler, Instr, LabelId};
