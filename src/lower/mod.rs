// This module is the lowering driver. It walks every defined function of a module in
// declaration order and turns its mid-level operations into low-level instructions against
// one shared CodegenContext. Each function gets a prologue (start label and frame
// reservation), register parameters bound to their convention registers, the lowered body,
// and an epilogue that releases the frame and returns. After every operation the driver
// releases register copies of variables whose address escaped, records per-kind
// statistics, and, when verification is on, checks the allocator invariants so that a
// bookkeeping slip is reported at the operation that caused it. The individual rules live
// in the submodules, one per family of operations. The optional entry stub reserves the
// static segment, calls the entry function and halts.

//! Lowering of mid-level operations to VM instructions.

mod arith;
mod assign;
mod call;
mod control;
mod memory;

use crate::codegen::CodegenContext;
use crate::core::{AsmReg, CompileResult, Storage, ValueId};
use crate::internal;
use crate::ir::{FuncId, FunctionDecl, MidInstr, Op};
use crate::vm::{ArgLocation, Instr, StackAmount};
use std::ops::Range;

/// Lower every function; returns the instruction range of each defined one.
pub fn lower_module<'s>(
    ctx: &mut CodegenContext<'s>,
    functions: &[FunctionDecl<'s>],
    entry: Option<FuncId>,
) -> CompileResult<Vec<Option<Range<usize>>>> {
    if let Some(entry) = entry {
        let decl = functions
            .get(entry.0 as usize)
            .ok_or_else(|| internal!("entry {entry} is not declared"))?;
        log::debug!("entry stub calls {}", decl.name);
        ctx.emit(Instr::StackAdjust(StackAmount::StaticSegment));
        ctx.emit(Instr::Call(decl.start));
        ctx.emit(Instr::Halt);
    }

    let mut ranges = Vec::with_capacity(functions.len());
    for decl in functions {
        if decl.is_external() {
            ranges.push(None);
            continue;
        }
        let mut lowerer = FunctionLowerer {
            ctx: &mut *ctx,
            functions,
            decl,
        };
        ranges.push(Some(lowerer.lower()?));
    }
    Ok(ranges)
}

/// Lowering state for one function body.
pub(crate) struct FunctionLowerer<'a, 's> {
    ctx: &'a mut CodegenContext<'s>,
    functions: &'a [FunctionDecl<'s>],
    decl: &'a FunctionDecl<'s>,
}

impl<'a, 's> FunctionLowerer<'a, 's> {
    fn lower(&mut self) -> CompileResult<Range<usize>> {
        let decl = self.decl;
        let frame = decl
            .frame
            .ok_or_else(|| internal!("`{}` has no frame", decl.name))?;
        let body = decl
            .body
            .as_ref()
            .ok_or_else(|| internal!("`{}` has no body", decl.name))?;
        if let Some((reg, v)) = self.ctx.regs.all_occupied().first() {
            return Err(internal!("{reg} still holds {v} at the start of `{}`", decl.name));
        }

        log::info!("lowering {} ({} operations)", decl.name, body.len());
        let first = self.ctx.instruction_count();
        self.ctx.enter_frame(frame);
        self.prologue()?;

        for (index, op) in body.iter().enumerate() {
            let is_last = index + 1 == body.len();
            if let Err(err) = self.lower_op(op, is_last) {
                log::error!("{}: failed to lower `{}`: {err}", op.loc, op.instr);
                return Err(err);
            }
        }
        if !matches!(body.last(), Some(Op { instr: MidInstr::Return(_), .. })) {
            retire_registers(self.ctx)?;
        }

        self.ctx.emit(Instr::Label(decl.epilogue));
        self.ctx.emit(Instr::StackAdjust(StackAmount::FrameLeave(frame)));
        self.ctx.emit(Instr::Ret);
        self.ctx.leave_frame();

        let end = self.ctx.instruction_count();
        self.ctx.session().record_function_lowered(decl.name, end - first);
        Ok(first..end)
    }

    fn prologue(&mut self) -> CompileResult<()> {
        let decl = self.decl;
        let frame = self.ctx.current_frame()?;
        self.ctx.emit(Instr::Label(decl.start));
        self.ctx.comment(&format!("{}: {}", decl.name, decl.signature));
        self.ctx.emit(Instr::StackAdjust(StackAmount::FrameEnter(frame)));

        for (&param, location) in decl.params.iter().zip(decl.layout.args.iter()) {
            // Stack parameters already sit in their homes.
            if let ArgLocation::Register(reg) = *location {
                self.ctx.bind_register(reg, param)?;
                self.mark_dirty(param);
            }
        }
        Ok(())
    }

    fn lower_op(&mut self, op: &Op<'s>, is_last: bool) -> CompileResult<()> {
        if self.ctx.options.emit_comments && !matches!(op.instr, MidInstr::Comment(_)) {
            self.ctx.comment(&op.instr.to_string());
        }
        log::trace!("{}: {}", op.loc, op.instr);
        self.ctx.set_location(&op.loc);

        match &op.instr {
            MidInstr::Binary {
                op,
                lhs,
                rhs,
                result,
                to_self,
            } => self.lower_binary(*op, *lhs, *rhs, *result, *to_self)?,
            MidInstr::Compare {
                cond,
                lhs,
                rhs,
                result,
            } => self.lower_compare(*cond, *lhs, *rhs, *result)?,
            MidInstr::Unary {
                op,
                operand,
                result,
            } => self.lower_unary(*op, *operand, *result)?,
            MidInstr::Convert { value, result } => self.lower_convert(*value, *result)?,
            MidInstr::Assign { target, value } => self.lower_assign(*target, *value)?,
            MidInstr::Call {
                callee,
                args,
                result,
            } => self.lower_call(*callee, args, *result)?,
            MidInstr::AddressOf { value, result } => self.lower_address_of(*value, *result)?,
            MidInstr::Dereference { pointer, result } => {
                self.lower_dereference(*pointer, *result)?
            }
            MidInstr::Store { pointer, value } => self.lower_store(*pointer, *value)?,
            MidInstr::Member {
                pointer,
                offset,
                result,
            } => self.lower_member(*pointer, *offset, *result)?,
            MidInstr::FunctionAddress { func, result } => {
                self.lower_function_address(*func, *result)?
            }
            MidInstr::Label(label) => self.lower_label(*label)?,
            MidInstr::Jump(label) => self.lower_jump(*label)?,
            MidInstr::Branch {
                cond,
                target,
                jump_if,
                spill_all,
            } => self.lower_branch(*cond, *target, *jump_if, *spill_all)?,
            MidInstr::Return(value) => self.lower_return(*value, is_last)?,
            MidInstr::Comment(text) => self.ctx.comment(text),
        }

        self.ctx.session().record_operation_lowered(op.instr.kind());
        self.ctx.release_address_taken()?;
        if self.ctx.options.verify {
            self.ctx.check_invariants()?;
        }
        Ok(())
    }

    fn function(&self, func: FuncId) -> CompileResult<&'a FunctionDecl<'s>> {
        self.functions
            .get(func.0 as usize)
            .ok_or_else(|| internal!("call to undeclared {func}"))
    }

    fn mark_dirty(&mut self, v: ValueId) {
        if let Some(named) = self.ctx.values.get_mut(v).named_mut() {
            named.dirty = true;
        }
        self.ctx.values.touch(v);
    }

    /// Register holding named value `v`, loading and binding it if needed.
    fn named_register(&mut self, v: ValueId) -> CompileResult<AsmReg> {
        if let Some(reg) = self.ctx.values.get(v).register() {
            self.ctx.values.touch(v);
            return Ok(reg);
        }
        let bank = self.ctx.values.get(v).ty.bank();
        let reg = self.ctx.get_free_register(bank)?;
        self.ctx.load_value(reg, v)?;
        self.ctx.bind_register(reg, v)?;
        Ok(reg)
    }
}

/// Drop every register on the way out of a function.
///
/// Frame-local variables die with the frame, so only statics are written back.
pub(super) fn retire_registers(ctx: &mut CodegenContext<'_>) -> CompileResult<()> {
    for (_, v) in ctx.regs.all_occupied() {
        let value = ctx.values.get(v);
        let Some(named) = value.named() else {
            continue;
        };
        if !named.dirty {
            continue;
        }
        if named.storage == Storage::Auto {
            if let Some(named) = ctx.values.get_mut(v).named_mut() {
                named.dirty = false;
            }
        } else {
            ctx.flush_named(v)?;
        }
    }
    ctx.drop_all_registers(false)
}
