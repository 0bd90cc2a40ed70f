// Lowering of labels, jumps and conditional branches. A label is a join point reached from
// places with different register contents, so before it every dirty variable is written
// back and every register copy is forgotten; a temporary that is still needed at that point
// could not survive the join and is reported as an internal error. Jumps do the same before
// leaving. Branches only flush: the fall-through path keeps its register copies, while the
// target starts from memory. A branch may also spill everything first, which is how the
// front end keeps temporaries alive across a join.

use super::FunctionLowerer;
use crate::core::{CompileResult, ValueId};
use crate::vm::{Instr, LabelId};

impl<'a, 's> FunctionLowerer<'a, 's> {
    pub(super) fn lower_label(&mut self, label: LabelId) -> CompileResult<()> {
        self.ctx.flush_dirty_named()?;
        self.ctx.drop_all_registers(true)?;
        self.ctx.emit(Instr::Label(label));
        Ok(())
    }

    pub(super) fn lower_jump(&mut self, label: LabelId) -> CompileResult<()> {
        self.ctx.flush_dirty_named()?;
        self.ctx.drop_all_registers(true)?;
        self.ctx.emit(Instr::Jump(label));
        Ok(())
    }

    pub(super) fn lower_branch(
        &mut self,
        cond: ValueId,
        target: LabelId,
        jump_if: bool,
        spill_all: bool,
    ) -> CompileResult<()> {
        let reg = self.ctx.move_value_to_any_register(cond)?;
        let mut scope = self.ctx.lock_register(reg);
        scope.flush_dirty_named()?;
        if spill_all {
            scope.spill_all()?;
        }
        scope.emit(Instr::JumpIf {
            reg,
            target,
            when_nonzero: jump_if,
        });
        Ok(())
    }
}
