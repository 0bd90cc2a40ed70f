// This module defines CodegenContext, the single mutable object threaded through every
// lowering call. It owns the values of the module, the register file of both banks, the
// growing frame counters, the static segment, the code-segment constant pool and the
// low-level instruction list being produced, so that lowering has no hidden or global
// state. Register ownership changes only through bind_register/unbind_register, which keep
// the register file and the value positions in step and emit debug location markers for
// named variables. RegisterLock is the scoped reservation guard: it dereferences to the
// context, marks registers locked as they are added, and restores every saved flag in
// reverse order when dropped, including on early `?` returns. check_invariants verifies
// the bookkeeping rules after each lowered operation when verification is enabled.

//! Shared lowering state and register lock guards.

use super::storage::{ConstantPool, FrameError, Frames, StaticSegment};
use crate::core::{
    AsmReg, CodegenOptions, CompilationSession, CompileError, CompileResult, FrameId, Position,
    RegisterFile, SourceLoc, StackBase, StackSlot, ValueId, ValueStore,
};
use crate::internal;
use crate::vm::Instr;
use hashbrown::HashMap;
use std::ops::{Deref, DerefMut};

/// Mutable state shared by all lowering rules of a module.
pub struct CodegenContext<'s> {
    session: &'s CompilationSession<'s>,
    pub options: CodegenOptions,
    pub values: ValueStore<'s>,
    pub regs: RegisterFile,
    pub frames: Frames,
    pub statics: StaticSegment,
    pub constants: ConstantPool<'s>,
    instrs: Vec<Instr<'s>>,
    current_frame: Option<FrameId>,
    /// Source location of the operation being lowered.
    loc: SourceLoc,
}

impl<'s> CodegenContext<'s> {
    pub fn new(
        session: &'s CompilationSession<'s>,
        options: CodegenOptions,
        values: ValueStore<'s>,
        frames: Frames,
        statics: StaticSegment,
        constants: ConstantPool<'s>,
    ) -> Self {
        Self {
            session,
            options,
            values,
            regs: RegisterFile::new(),
            frames,
            statics,
            constants,
            instrs: Vec::new(),
            current_frame: None,
            loc: SourceLoc::builtin(),
        }
    }

    pub fn session(&self) -> &'s CompilationSession<'s> {
        self.session
    }

    pub fn emit(&mut self, instr: Instr<'s>) {
        log::trace!("emit {instr}");
        self.instrs.push(instr);
    }

    /// Emit a comment marker when comments are enabled.
    pub fn comment(&mut self, text: &str) {
        if self.options.emit_comments {
            let text = self.session.intern_str(text);
            self.emit(Instr::Comment(text));
        }
    }

    pub fn instructions(&self) -> &[Instr<'s>] {
        &self.instrs
    }

    pub fn instruction_count(&self) -> usize {
        self.instrs.len()
    }

    pub fn current_frame(&self) -> CompileResult<FrameId> {
        self.current_frame
            .ok_or_else(|| internal!("stack slot requested outside of a function"))
    }

    pub fn enter_frame(&mut self, frame: FrameId) {
        self.current_frame = Some(frame);
    }

    pub fn leave_frame(&mut self) {
        self.current_frame = None;
    }

    pub fn set_location(&mut self, loc: &SourceLoc) {
        self.loc = loc.clone();
    }

    /// A brand-new slot at the end of the current frame.
    pub fn allocate_stack_slot(&mut self, size: u64) -> CompileResult<StackSlot> {
        let frame = self.current_frame()?;
        self.frames
            .allocate_spill_slot(frame, size)
            .map_err(|err| match err {
                FrameError::TooLarge(_) => CompileError::user(
                    &self.loc,
                    format!("{size} more bytes do not fit in the stack frame"),
                ),
                FrameError::UnknownFrame(_) => internal!("{err}"),
            })
    }

    /// Record that named value `v` now lives at `position`.
    pub fn debug_location(&mut self, v: ValueId) {
        if !self.options.emit_debug_locations {
            return;
        }
        let value = self.values.get(v);
        let (Some(named), Some(position)) = (value.named(), value.position()) else {
            return;
        };
        let frame = match position {
            Position::Stack(StackSlot {
                base: StackBase::Frame(frame),
                ..
            }) => Some(frame),
            _ => None,
        };
        let name = named.name;
        self.emit(Instr::DebugLocation {
            name,
            position,
            frame,
        });
    }

    /// Make `v` the owner of the empty register `reg`.
    pub fn bind_register(&mut self, reg: AsmReg, v: ValueId) -> CompileResult<()> {
        let ty_bank = self.values.get(v).ty.bank();
        if ty_bank != reg.bank {
            return Err(internal!(
                "{v} ({}) bound to {reg} of the wrong bank",
                self.values.description(v)
            ));
        }
        if let Some(current) = self.values.get(v).register() {
            return Err(internal!("{v} bound to {reg} while still owning {current}"));
        }
        self.regs.bind(reg, v)?;
        self.values.get_mut(v).set_position(Some(Position::Register(reg)));
        self.values.touch(v);
        self.session.record_register_allocated();
        log::trace!("bind {reg} <- {v} ({})", self.values.description(v));
        self.debug_location(v);
        Ok(())
    }

    /// Release `reg` without emitting code.
    ///
    /// Named values fall back to their home (which must be current, i.e.
    /// not dirty); everything else loses its position.
    pub fn unbind_register(&mut self, reg: AsmReg) -> CompileResult<ValueId> {
        let v = self
            .regs
            .occupant(reg)
            .ok_or_else(|| internal!("register {reg} released while empty"))?;
        let value = self.values.get(v);
        if value.position() != Some(Position::Register(reg)) {
            return Err(internal!(
                "{reg} held {v} but the value claims {:?}",
                value.position()
            ));
        }
        if value.is_dirty() {
            return Err(internal!("dirty {v} ({}) dropped from {reg}", value.description));
        }
        let home = value.home();
        self.regs.unbind(reg)?;
        self.values.get_mut(v).set_position(home);
        log::trace!("unbind {reg} -> {v}");
        if home.is_some() {
            self.debug_location(v);
        }
        Ok(v)
    }

    /// Open an empty lock scope.
    pub fn lock_scope(&mut self) -> RegisterLock<'_, 's> {
        RegisterLock {
            ctx: self,
            saved: Vec::new(),
        }
    }

    /// Lock one register for the lifetime of the returned guard.
    pub fn lock_register(&mut self, reg: AsmReg) -> RegisterLock<'_, 's> {
        let mut guard = self.lock_scope();
        guard.lock(reg);
        guard
    }

    /// Check the allocator invariants, returning the first violation.
    pub fn check_invariants(&self) -> CompileResult<()> {
        for (reg, v) in self.regs.all_occupied() {
            let value = self.values.get(v);
            if value.position() != Some(Position::Register(reg)) {
                return Err(internal!(
                    "{reg} holds {v} but {v} reports {:?}",
                    value.position()
                ));
            }
            if value.ty.bank() != reg.bank {
                return Err(internal!("{v} of type {} sits in {reg}", value.ty));
            }
        }

        let mut seen: HashMap<Position, ValueId> = HashMap::new();
        for (v, value) in self.values.iter() {
            let Some(position) = value.position() else {
                continue;
            };
            if let Position::Register(reg) = position {
                if self.regs.occupant(reg) != Some(v) {
                    return Err(internal!("{v} claims {reg}, which it does not own"));
                }
            } else if value.is_unnamed() && value.remaining_references() == 0 {
                // Dead temporaries keep a stale slot.
                continue;
            }
            if let Some(other) = seen.insert(position, v) {
                return Err(internal!("{other} and {v} both report {position}"));
            }
        }
        Ok(())
    }

    /// Hand back everything the assembler needs.
    pub fn into_parts(self) -> (Vec<Instr<'s>>, Frames, StaticSegment, ConstantPool<'s>) {
        (self.instrs, self.frames, self.statics, self.constants)
    }
}

/// Scoped register reservation.
///
/// Registers added with [`RegisterLock::lock`] cannot be handed out or
/// evicted until the guard is dropped, at which point each one gets back
/// the locked flag it had before. Guards nest through `Deref`.
pub struct RegisterLock<'c, 's> {
    ctx: &'c mut CodegenContext<'s>,
    saved: Vec<(AsmReg, bool)>,
}

impl<'c, 's> RegisterLock<'c, 's> {
    pub fn lock(&mut self, reg: AsmReg) {
        let previous = self.ctx.regs.set_locked(reg, true);
        self.saved.push((reg, previous));
    }
}

impl<'s> Deref for RegisterLock<'_, 's> {
    type Target = CodegenContext<'s>;

    fn deref(&self) -> &Self::Target {
        self.ctx
    }
}

impl<'s> DerefMut for RegisterLock<'_, 's> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.ctx
    }
}

impl Drop for RegisterLock<'_, '_> {
    fn drop(&mut self) {
        for (reg, previous) in self.saved.drain(..).rev() {
            self.ctx.regs.set_locked(reg, previous);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Storage, Type};
    use bumpalo::Bump;

    fn context<'s>(session: &'s CompilationSession<'s>) -> CodegenContext<'s> {
        CodegenContext::new(
            session,
            CodegenOptions::default(),
            ValueStore::new(),
            Frames::new(),
            StaticSegment::default(),
            ConstantPool::new(),
        )
    }

    #[test]
    fn test_lock_guard_restores_on_drop() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut ctx = context(&session);
        let r1 = AsmReg::int(1);
        let r2 = AsmReg::int(2);
        {
            let mut outer = ctx.lock_register(r1);
            assert!(outer.regs.is_locked(r1));
            {
                let mut inner = outer.lock_register(r1);
                inner.lock(r2);
                assert!(inner.regs.is_locked(r2));
            }
            // The inner guard restores r1 to locked, not unlocked.
            assert!(outer.regs.is_locked(r1));
            assert!(!outer.regs.is_locked(r2));
        }
        assert!(!ctx.regs.is_locked(r1));
    }

    #[test]
    fn test_lock_guard_restores_on_error_path() {
        fn failing(ctx: &mut CodegenContext<'_>) -> CompileResult<()> {
            let mut scope = ctx.lock_scope();
            scope.lock(AsmReg::float(3));
            scope.current_frame()?;
            Ok(())
        }
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut ctx = context(&session);
        assert!(failing(&mut ctx).is_err());
        assert!(!ctx.regs.is_locked(AsmReg::float(3)));
    }

    #[test]
    fn test_bind_unbind_keeps_positions_in_step() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut ctx = context(&session);
        let t = ctx.values.create_temporary(Type::u32(), "t");
        let reg = AsmReg::int(4);
        ctx.bind_register(reg, t).unwrap();
        assert_eq!(ctx.values.get(t).position(), Some(Position::Register(reg)));
        ctx.check_invariants().unwrap();

        // Wrong bank is a bookkeeping error.
        let f = ctx.values.create_temporary(Type::f64(), "f");
        assert!(ctx.bind_register(AsmReg::int(5), f).unwrap_err().is_internal());

        assert_eq!(ctx.unbind_register(reg).unwrap(), t);
        assert_eq!(ctx.values.get(t).position(), None);
        ctx.check_invariants().unwrap();
    }

    #[test]
    fn test_dirty_named_cannot_be_dropped() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut ctx = context(&session);
        let a = ctx.values.create_named(Type::u64(), "a", Storage::Auto);
        let reg = AsmReg::int(0);
        ctx.bind_register(reg, a).unwrap();
        ctx.values.get_mut(a).named_mut().unwrap().dirty = true;
        assert!(ctx.unbind_register(reg).unwrap_err().is_internal());
    }

    #[test]
    fn test_invariant_check_detects_stale_register_claim() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut ctx = context(&session);
        let t = ctx.values.create_temporary(Type::u64(), "t");
        ctx.values
            .get_mut(t)
            .set_position(Some(Position::Register(AsmReg::int(7))));
        assert!(ctx.check_invariants().unwrap_err().is_internal());
    }
}
