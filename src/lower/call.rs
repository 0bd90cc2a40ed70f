// Lowering of calls and returns. Internal calls follow the VM convention computed from the
// callee's signature: every live register is spilled first since the callee may clobber
// any of them, a return buffer is reserved in the caller's frame when the result does not
// fit a register and its address is written into the callee's return pointer slot, and the
// arguments are placed back to front, stack arguments straight into the outgoing area and
// register arguments into their convention registers, which stay locked until the call is
// emitted. After the call every register copy is forgotten and the result is bound to r0 or
// f0. External calls instead marshal their arguments on the stack for the host: handle,
// return tag, a zero terminator and then (value, tag) pairs back to front, so the host pops
// pairs until it reaches the terminator. Returns move the result into the return register,
// or copy it through the hidden return pointer, and leave through the epilogue.

use super::{retire_registers, FunctionLowerer};
use crate::core::{AsmReg, CompileResult, Position, RegBank, Signature, StackSlot, Type, ValueId};
use crate::internal;
use crate::ir::{Callee, FunctionDecl, Linkage};
use crate::vm::{ArgLocation, CallLayout, Instr, ReturnLocation, RETURN_POINTER_OFFSET};
use std::rc::Rc;

/// Tag pushed with each external call argument.
fn external_arg_tag(ty: &Type) -> u64 {
    if ty.is_pointer() {
        3
    } else if ty.is_float() {
        2
    } else {
        1
    }
}

impl<'a, 's> FunctionLowerer<'a, 's> {
    pub(super) fn lower_call(
        &mut self,
        callee: Callee,
        args: &[ValueId],
        result: Option<ValueId>,
    ) -> CompileResult<()> {
        let (signature, layout, direct) = match callee {
            Callee::Direct(func) => {
                let decl = self.function(func)?;
                if let Linkage::External { handle } = decl.linkage {
                    return self.lower_external_call(decl, handle, args, result);
                }
                (decl.signature.clone(), decl.layout.clone(), Some(decl))
            }
            Callee::Indirect(pointer) => {
                let ty = self.ctx.values.get(pointer).ty.clone();
                let signature = ty
                    .signature()
                    .cloned()
                    .ok_or_else(|| internal!("indirect call through {ty}"))?;
                let layout = CallLayout::for_signature(&signature);
                (signature, layout, None)
            }
        };
        if args.len() != layout.args.len() {
            return Err(internal!(
                "call with {} arguments to a {}-parameter signature",
                args.len(),
                layout.args.len()
            ));
        }

        self.ctx.spill_all()?;
        let buffer = self.reserve_return_buffer(&signature, &layout)?;

        let mut scope = self.ctx.lock_scope();
        for ((&arg, location), param_ty) in args
            .iter()
            .zip(layout.args.iter())
            .zip(signature.params.iter())
            .rev()
        {
            match *location {
                ArgLocation::Stack(offset) => {
                    let slot = Position::Stack(StackSlot::outgoing(offset));
                    scope.copy_value_to_position_with_cast(arg, slot, param_ty)?;
                }
                ArgLocation::Register(reg) => {
                    scope.copy_value_to_position_with_cast(arg, Position::Register(reg), param_ty)?;
                    scope.lock(reg);
                }
            }
            scope.values.consume(arg)?;
        }

        match (callee, direct) {
            (Callee::Direct(_), Some(decl)) => {
                scope.emit(Instr::Call(decl.start));
                scope.session().record_call(decl.name);
            }
            (Callee::Direct(func), None) => return Err(internal!("{func} vanished during lowering")),
            (Callee::Indirect(pointer), _) => {
                let reg = scope.copy_value_to_any_register(pointer)?;
                scope.lock(reg);
                scope.values.consume(pointer)?;
                scope.emit(Instr::CallPtr(reg));
                scope.session().record_call("indirect");
            }
        }
        drop(scope);

        self.ctx.drop_all_registers(false)?;
        let Some(result) = result else {
            return Ok(());
        };
        match (layout.ret, buffer) {
            (ReturnLocation::Register(reg), _) => self.ctx.bind_register(reg, result),
            (ReturnLocation::Memory, Some(slot)) => {
                self.ctx
                    .values
                    .get_mut(result)
                    .set_position(Some(Position::Stack(slot)));
                Ok(())
            }
            _ => Err(internal!("call result {result} has nowhere to go")),
        }
    }

    /// Reserve the caller-side buffer for a wide result and pass its address.
    fn reserve_return_buffer(
        &mut self,
        signature: &Rc<Signature>,
        layout: &CallLayout,
    ) -> CompileResult<Option<StackSlot>> {
        if layout.ret != ReturnLocation::Memory {
            return Ok(None);
        }
        let slot = self.ctx.allocate_stack_slot(signature.ret.size())?;
        let reg = self.ctx.get_free_register(RegBank::Int)?;
        self.ctx.emit(Instr::LeaStack { dst: reg, slot });
        self.ctx.emit(Instr::StoreStack {
            src: reg,
            slot: StackSlot::outgoing(RETURN_POINTER_OFFSET),
            size: 8,
        });
        Ok(Some(slot))
    }

    fn lower_external_call(
        &mut self,
        decl: &FunctionDecl<'s>,
        handle: u64,
        args: &[ValueId],
        result: Option<ValueId>,
    ) -> CompileResult<()> {
        let params = &decl.signature.params;
        if args.len() != params.len() {
            return Err(internal!("external call to `{}` with wrong arity", decl.name));
        }
        self.ctx.spill_all()?;

        let mut scope = self.ctx.lock_scope();
        let mut loaded: Vec<(AsmReg, u64)> = Vec::with_capacity(args.len());
        for (&arg, param_ty) in args.iter().zip(params.iter()) {
            if let Some(current) = scope.values.get(arg).register() {
                scope.lock(current);
            }
            let reg = scope.get_free_register(param_ty.bank())?;
            scope.lock(reg);
            scope.copy_value_to_position_with_cast(arg, Position::Register(reg), param_ty)?;
            scope.values.consume(arg)?;
            loaded.push((reg, external_arg_tag(param_ty)));
        }

        let float_result = decl.signature.ret.is_float();
        scope.emit(Instr::PushImm(handle));
        scope.emit(Instr::PushImm(float_result as u64));
        scope.emit(Instr::PushImm(0));
        for &(reg, tag) in loaded.iter().rev() {
            scope.emit(Instr::Push(reg));
            scope.emit(Instr::PushImm(tag));
        }
        let dst = if float_result {
            AsmReg::float(0)
        } else {
            AsmReg::int(0)
        };
        scope.emit(Instr::CallExternal { dst });
        scope.session().record_call(decl.name);
        drop(scope);

        self.ctx.drop_all_registers(false)?;
        match result {
            Some(result) => self.ctx.bind_register(dst, result),
            None => Ok(()),
        }
    }

    pub(super) fn lower_return(&mut self, value: Option<ValueId>, is_last: bool) -> CompileResult<()> {
        let decl = self.decl;
        let ret_ty = decl.signature.ret.clone();
        let mut scope = self.ctx.lock_scope();

        match (value, decl.layout.ret) {
            (None, _) => {}
            (Some(v), ReturnLocation::Register(reg)) => {
                if scope.values.get(v).register() != Some(reg) {
                    scope.free_register(reg)?;
                }
                scope.lock(reg);
                if let Some(current) = scope.values.get(v).register() {
                    scope.lock(current);
                }
                scope.copy_value_to_position_with_cast(v, Position::Register(reg), &ret_ty)?;
                scope.values.consume(v)?;
            }
            (Some(v), ReturnLocation::Memory) => {
                let return_pointer = decl
                    .return_pointer
                    .ok_or_else(|| internal!("`{}` has no return pointer", decl.name))?;
                let source = scope.stable_position(v)?;
                scope.values.consume(v)?;
                let dst = scope.copy_value_to_any_register(return_pointer)?;
                scope.lock(dst);
                let src = scope.get_free_register(RegBank::Int)?;
                scope.lock(src);
                scope.load_address(src, source)?;
                scope.emit(Instr::CopyMem {
                    dst,
                    src,
                    size: ret_ty.size(),
                });
            }
            (Some(v), ReturnLocation::Void) => {
                return Err(internal!("{v} returned from void `{}`", decl.name));
            }
        }

        // The return register stays locked while statics are written back.
        retire_registers(&mut scope)?;
        drop(scope);
        if !is_last {
            self.ctx.emit(Instr::Jump(decl.epilogue));
        }
        Ok(())
    }
}
