//! Register allocation and value movement shared by all lowering rules.
//!
//! [`CodegenContext`] carries the whole mutable state of a module being
//! lowered. The allocator policies live in `alloc`, the load/store/copy
//! primitives in `transfer`, and frame/static/code-segment storage in
//! `storage`.

mod alloc;
pub mod context;
pub mod storage;
mod transfer;

pub use context::{CodegenContext, RegisterLock};
pub use storage::{ConstantPool, FrameError, Frames, StaticSegment};
