// This module provides arena-based compilation session management using the bumpalo crate.
// CompilationSession owns the arena that every interned string of a module lives in (value
// descriptions, variable and function names, comment text, debug marker names) so that
// values, low-level instructions and assembled markers can all borrow `&'arena str` without
// reference counting. It also gathers SessionStats: how many functions were lowered, how
// many mid-level operations of each kind went through the lowering rules, how many
// registers were handed out and how many spills were emitted, and the size of the final
// image. Statistics sit behind a RefCell so lowering code can record them through a shared
// reference to the session.

//! Arena-based compilation session management.
//!
//! All strings handed to the backend are interned in the session arena and
//! share its lifetime.

use bumpalo::Bump;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::collections::HashMap as StdHashMap;
use std::fmt;

/// Arena-based compilation session.
pub struct CompilationSession<'arena> {
    /// Arena allocator for compilation objects.
    arena: &'arena Bump,

    /// Session statistics for debugging and tuning.
    stats: RefCell<SessionStats>,

    /// String interning for efficient storage. The std map may dangle on drop,
    /// which lets the session be borrowed for its own arena lifetime.
    interned_strings: RefCell<StdHashMap<String, &'arena str>>,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new compilation session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            interned_strings: RefCell::new(StdHashMap::new()),
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Copy a byte blob into the arena.
    pub fn alloc_bytes(&self, bytes: &[u8]) -> &'arena [u8] {
        self.arena.alloc_slice_copy(bytes)
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some(&interned) = strings.get(s) {
            return interned;
        }

        let interned = self.arena.alloc_str(s);
        strings.insert(s.to_string(), interned);
        interned
    }

    /// Record that a function body was lowered.
    pub fn record_function_lowered(&self, name: &str, instructions: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.functions_lowered += 1;
        if stats.largest_function_instructions < instructions {
            stats.largest_function_instructions = instructions;
            stats.largest_function_name = name.to_string();
        }
    }

    /// Record one mid-level operation going through lowering.
    pub fn record_operation_lowered(&self, kind: &str) {
        let mut stats = self.stats.borrow_mut();
        stats.operations_lowered += 1;
        *stats.operation_counts.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub fn record_register_allocated(&self) {
        self.stats.borrow_mut().registers_allocated += 1;
    }

    pub fn record_spill_generated(&self) {
        self.stats.borrow_mut().spills_generated += 1;
    }

    pub fn record_call(&self, callee: &str) {
        self.stats.borrow_mut().calls_lowered += 1;
        log::trace!("call site lowered: {callee}");
    }

    pub fn record_image_size(&self, bytes: usize) {
        self.stats.borrow_mut().code_size = bytes;
    }

    /// Snapshot of the statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub functions_lowered: usize,

    /// Mid-level operations lowered, all kinds.
    pub operations_lowered: usize,

    /// Count of each operation kind.
    pub operation_counts: HashMap<String, usize>,

    pub largest_function_instructions: usize,
    pub largest_function_name: String,

    pub registers_allocated: usize,
    pub spills_generated: usize,
    pub calls_lowered: usize,

    /// Size of the assembled image in bytes.
    pub code_size: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Functions lowered: {}", self.functions_lowered)?;
        writeln!(f, "  Operations lowered: {}", self.operations_lowered)?;
        writeln!(f, "  Code size: {} bytes", self.code_size)?;
        writeln!(f, "  Registers allocated: {}", self.registers_allocated)?;
        writeln!(f, "  Spills generated: {}", self.spills_generated)?;
        writeln!(f, "  Calls lowered: {}", self.calls_lowered)?;

        if !self.largest_function_name.is_empty() {
            writeln!(
                f,
                "  Largest function: {} ({} instructions)",
                self.largest_function_name, self.largest_function_instructions
            )?;
        }

        if !self.operation_counts.is_empty() {
            writeln!(f, "  Operation breakdown:")?;
            let mut sorted: Vec<_> = self.operation_counts.iter().collect();
            sorted.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

            for (kind, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {kind}: {count}")?;
            }
        }

        Ok(())
    }
}
