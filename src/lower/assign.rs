// Lowering of assignment to a named variable. When the right-hand side is an unnamed value
// sitting in a register with no use after this one, and it has the target's register
// class and size, the target simply adopts that register: the temporary is unbound, any
// stale register copy of the target is released, and the register is rebound to the target
// and marked dirty, so no instruction is emitted beyond an optional re-canonicalisation.
// Every other case copies. Word-sized targets receive the value in their own register (or a
// fresh one) through the casting copy; wider targets are copied straight into their home.
// A right-hand side that is not in a register is always copied, never moved.

use super::FunctionLowerer;
use crate::core::{CompileResult, Position, ValueId};
use crate::internal;
use crate::vm::{Cond, Instr};

impl<'a, 's> FunctionLowerer<'a, 's> {
    pub(super) fn lower_assign(&mut self, target: ValueId, value: ValueId) -> CompileResult<()> {
        let target_value = self.ctx.values.get(target);
        let named = target_value
            .named()
            .ok_or_else(|| internal!("assignment to unnamed {target}"))?;
        let address_taken = named.address_taken;
        let target_ty = target_value.ty.clone();

        let source = self.ctx.values.get(value);
        let source_ty = source.ty.clone();
        let adoptable = source.is_unnamed()
            && source.remaining_references() == 1
            && source_ty.bank() == target_ty.bank()
            && source_ty.size() == target_ty.size()
            && target_ty.fits_register()
            && !address_taken;

        if let (true, Some(reg)) = (adoptable, source.register()) {
            log::trace!("{target} adopts {reg} from {value}");
            self.ctx.values.consume(value)?;
            self.ctx.unbind_register(reg)?;
            if let Some(old) = self.ctx.values.get(target).register() {
                if let Some(named) = self.ctx.values.get_mut(target).named_mut() {
                    named.dirty = false;
                }
                self.ctx.unbind_register(old)?;
            }
            if target_ty.is_bool() && !source_ty.is_bool() {
                self.ctx.emit(Instr::CmpImm {
                    lhs: reg,
                    imm: 0,
                    cond: Cond::Ne,
                });
            } else if source_ty.unqualified() != target_ty.unqualified() {
                self.ctx.normalize(reg, &target_ty);
            }
            self.ctx.bind_register(reg, target)?;
            self.mark_dirty(target);
            return Ok(());
        }

        if target_ty.fits_register() {
            let mut scope = self.ctx.lock_scope();
            if let Some(current) = scope.values.get(value).register() {
                scope.lock(current);
            }
            let existing = scope.values.get(target).register();
            let reg = match existing {
                Some(reg) => reg,
                None => scope.get_free_register(target_ty.bank())?,
            };
            scope.lock(reg);
            scope.copy_value_to_position_with_cast(value, Position::Register(reg), &target_ty)?;
            scope.values.consume(value)?;
            if existing.is_none() {
                scope.bind_register(reg, target)?;
            }
            drop(scope);
            self.mark_dirty(target);
            return Ok(());
        }

        let home = self.ctx.ensure_home(target)?;
        self.ctx.copy_value_to_position_with_cast(value, home, &target_ty)?;
        self.ctx.values.consume(value)?;
        self.ctx.values.get_mut(target).set_position(Some(home));
        self.ctx.values.touch(target);
        self.ctx.debug_location(target);
        Ok(())
    }
}
