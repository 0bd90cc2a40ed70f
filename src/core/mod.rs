// This module gathers the data model shared by every stage of vmgen: semantic types and
// struct layouts, the closed set of storage positions a value can occupy, the value handles
// the allocator reasons about, the register file that records which value owns each
// register of the VM's two banks, the arena-backed compilation session with its statistics,
// the code generation options, and the error types. Nothing in here emits code; the
// allocation policies and the lowering rules live in `codegen` and `lower`.

//! Core data model for the vmgen backend.
//!
//! # Key Components
//!
//! - `types`: semantic types, sizes, register banks, struct layouts
//! - `position`: where a value currently lives
//! - `value`: value handles with reference counts and named-variable homes
//! - `register_file`: per-bank register ownership and locks
//! - `session`: arena for interned strings plus statistics
//! - `options`: switches read from the environment
//! - `error`: user-facing and internal compile errors

pub mod error;
pub mod options;
pub mod position;
pub mod register_file;
pub mod session;
pub mod types;
pub mod value;

pub use error::{CompileError, CompileResult, Diagnostics, SourceLoc, Warning};
pub use options::CodegenOptions;
pub use position::{ConstId, FrameId, Position, StackBase, StackSlot};
pub use register_file::{AsmReg, RegBank, RegBitSet, RegisterFile, NUM_BANKS, REGS_PER_BANK};
pub use session::{CompilationSession, SessionStats};
pub use types::{Field, Signature, StructLayout, Type, TypeKind, WORD_SIZE};
pub use value::{NamedData, Storage, Value, ValueId, ValueKind, ValueStore};
