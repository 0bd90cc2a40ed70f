// This module implements the greedy register allocation policies on top of the register
// file bookkeeping. get_free_register searches a bank in a fixed order, skipping locked
// registers: an empty register, then a register whose unnamed occupant has no references
// left (dropped without code), then a register holding a clean copy of a named variable
// that already has a home (bookkeeping only), and finally the least recently touched
// occupant, which is evicted through free_used_register. Eviction never loses data:
// constants are rematerialised later, named variables are written back to their home
// (chosen once, in the code segment for read-only data, in the static segment for statics,
// in the current frame otherwise), and live temporaries are stored into a brand-new stack
// slot every time because they have no home. The module also provides the bulk operations
// used at calls and control-flow joins: flushing dirty named values, spilling everything,
// and dropping every register copy.

//! Register allocation and eviction policies.

use super::context::CodegenContext;
use crate::core::{AsmReg, CompileResult, Position, RegBank, Storage, ValueId, ValueKind, WORD_SIZE};
use crate::internal;

impl<'s> CodegenContext<'s> {
    /// Find a register of `bank` that may be overwritten, evicting if needed.
    ///
    /// The returned register is empty and unlocked; callers that allocate
    /// again before binding it must lock it first.
    pub fn get_free_register(&mut self, bank: RegBank) -> CompileResult<AsmReg> {
        if let Some(reg) = self.regs.free_registers(bank).next() {
            return Ok(reg);
        }

        let candidates: Vec<(AsmReg, ValueId)> = self
            .regs
            .occupied(bank)
            .filter(|(reg, _)| !self.regs.is_locked(*reg))
            .collect();
        if candidates.is_empty() {
            return Err(internal!("every {bank:?} register is locked"));
        }

        for &(reg, v) in &candidates {
            let value = self.values.get(v);
            if !value.is_named() && value.remaining_references() == 0 {
                log::debug!("reusing {reg}: {v} ({}) is dead", value.description);
                self.unbind_register(reg)?;
                return Ok(reg);
            }
        }

        for &(reg, v) in &candidates {
            let value = self.values.get(v);
            if value.is_named() && value.home().is_some() && !value.is_dirty() {
                log::debug!("reusing {reg}: {v} ({}) is clean", value.description);
                self.unbind_register(reg)?;
                return Ok(reg);
            }
        }

        let (reg, v) = candidates
            .iter()
            .copied()
            .min_by_key(|(reg, v)| (self.values.get(*v).last_touched(), *reg))
            .ok_or_else(|| internal!("no eviction candidate in {bank:?}"))?;
        log::debug!("evicting {v} ({}) from {reg}", self.values.description(v));
        self.free_used_register(reg)?;
        Ok(reg)
    }

    /// Empty `reg`, preserving its occupant's value elsewhere when it is still needed.
    pub fn free_used_register(&mut self, reg: AsmReg) -> CompileResult<()> {
        let v = self
            .regs
            .occupant(reg)
            .ok_or_else(|| internal!("{reg} believed occupied but is empty"))?;
        let value = self.values.get(v);
        let needs_store = match &value.kind {
            ValueKind::Constant(_) => false,
            ValueKind::Named(named) => named.home().is_none() || named.dirty,
            ValueKind::Temporary | ValueKind::Reference => value.remaining_references() > 0,
        };
        let named = value.is_named();
        if !needs_store {
            self.unbind_register(reg)?;
        } else if named {
            self.write_back_named(v, reg)?;
            self.unbind_register(reg)?;
        } else {
            self.spill_unnamed(v, reg)?;
        }
        Ok(())
    }

    /// Empty `reg`, preferring a move into another free register over a spill.
    pub fn free_register(&mut self, reg: AsmReg) -> CompileResult<()> {
        if self.regs.is_empty(reg) {
            return Ok(());
        }
        let other = self.regs.free_registers(reg.bank).find(|r| *r != reg);
        match other {
            Some(other) => self.move_binding(reg, other),
            None => self.free_used_register(reg),
        }
    }

    /// Move the occupant of `from` into the empty register `to`.
    pub fn move_binding(&mut self, from: AsmReg, to: AsmReg) -> CompileResult<()> {
        let v = self
            .regs
            .occupant(from)
            .ok_or_else(|| internal!("{from} believed occupied but is empty"))?;
        self.emit(crate::vm::Instr::Mov { dst: to, src: from });
        self.regs.unbind(from)?;
        self.regs.bind(to, v)?;
        self.values.get_mut(v).set_position(Some(Position::Register(to)));
        self.values.touch(v);
        log::trace!("moved {v} from {from} to {to}");
        self.debug_location(v);
        Ok(())
    }

    /// The home of named value `v`, choosing it now if it has none yet.
    pub fn ensure_home(&mut self, v: ValueId) -> CompileResult<Position> {
        let value = self.values.get(v);
        let named = value
            .named()
            .ok_or_else(|| internal!("{v} ({}) is not a named value", value.description))?;
        if let Some(home) = named.home() {
            return Ok(home);
        }

        let size = value.ty.size();
        let align = value.ty.align();
        let read_only = value.ty.is_const || named.storage == Storage::ReadOnly;
        let storage = named.storage;

        let home = if read_only {
            let padded = size.max(1).div_ceil(WORD_SIZE) * WORD_SIZE;
            let bytes = self.session().alloc_bytes(&vec![0u8; padded as usize]);
            Position::CodeConstant(self.constants.push_unique(bytes))
        } else if storage == Storage::Static {
            Position::Static(self.statics.allocate(size, align))
        } else {
            Position::Stack(self.allocate_stack_slot(size)?)
        };

        let value = self.values.get(v);
        if let Some(named) = value.named() {
            named.set_home(home)?;
        }
        log::debug!("home of {v} ({}) is {home}", value.description);
        Ok(home)
    }

    /// Store a dirty named value from `reg` into its home; the binding stays.
    fn write_back_named(&mut self, v: ValueId, reg: AsmReg) -> CompileResult<()> {
        let home = self.ensure_home(v)?;
        let ty = self.values.get(v).ty.clone();
        self.store_register(reg, home, &ty)?;
        if let Some(named) = self.values.get_mut(v).named_mut() {
            named.dirty = false;
        }
        self.session().record_spill_generated();
        log::debug!("wrote back {v} ({}) to {home}", self.values.description(v));
        Ok(())
    }

    /// Store a live temporary into a fresh slot and release its register.
    pub fn spill_unnamed(&mut self, v: ValueId, reg: AsmReg) -> CompileResult<()> {
        let ty = self.values.get(v).ty.clone();
        let slot = self.allocate_stack_slot(ty.size())?;
        let target = Position::Stack(slot);
        self.store_register(reg, target, &ty)?;
        self.regs.unbind(reg)?;
        self.values.get_mut(v).set_position(Some(target));
        self.session().record_spill_generated();
        log::debug!("spilled {v} ({}) to {target}", self.values.description(v));
        Ok(())
    }

    /// Write `v` back to its home if its register copy is dirty.
    pub fn flush_named(&mut self, v: ValueId) -> CompileResult<()> {
        let value = self.values.get(v);
        if !value.is_dirty() {
            return Ok(());
        }
        let reg = value
            .register()
            .ok_or_else(|| internal!("dirty {v} is not in a register"))?;
        let mut scope = self.lock_register(reg);
        scope.write_back_named(v, reg)
    }

    /// Write back every dirty named value, keeping the register copies.
    pub fn flush_dirty_named(&mut self) -> CompileResult<()> {
        for (_, v) in self.regs.all_occupied() {
            self.flush_named(v)?;
        }
        Ok(())
    }

    /// Flush and unbind named values whose address has escaped.
    pub fn release_address_taken(&mut self) -> CompileResult<()> {
        for (reg, v) in self.regs.all_occupied() {
            let escaped = self
                .values
                .get(v)
                .named()
                .is_some_and(|named| named.address_taken);
            if escaped {
                self.flush_named(v)?;
                self.unbind_register(reg)?;
            }
        }
        Ok(())
    }

    /// Empty every register, storing whatever is still needed.
    pub fn spill_all(&mut self) -> CompileResult<()> {
        for (reg, v) in self.regs.all_occupied() {
            // An earlier eviction may already have emptied it.
            if self.regs.occupant(reg) == Some(v) {
                self.free_used_register(reg)?;
            }
        }
        Ok(())
    }

    /// Drop every register copy at a control-flow join.
    ///
    /// Dirty named values must have been flushed. With `strict`, a temporary
    /// that is still referenced is a bookkeeping error.
    pub fn drop_all_registers(&mut self, strict: bool) -> CompileResult<()> {
        for (reg, v) in self.regs.all_occupied() {
            let value = self.values.get(v);
            if strict && value.is_unnamed() && value.remaining_references() > 0 {
                return Err(internal!(
                    "{v} ({}) is still referenced in {reg} at a label",
                    value.description
                ));
            }
            self.unbind_register(reg)?;
        }
        Ok(())
    }
}
