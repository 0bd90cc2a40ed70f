// Lowering of the operations that work with addresses: taking the address of a value,
// loading and storing through pointers, field addressing and function addresses. Taking an
// address pins the operand to a stable memory position first and marks named operands as
// escaped, which makes the driver drop their register copies at the end of every later
// operation. Loads of values up to a word are one pointer load into a fresh register; wider
// values are copied in 8-byte chunks into a new frame slot, advancing a private copy of the
// pointer between chunks. Stores of wide values are a single block copy.

use super::FunctionLowerer;
use crate::core::{CompileResult, Position, RegBank, ValueId, WORD_SIZE};
use crate::internal;
use crate::ir::FuncId;
use crate::vm::{AluOp, Imm, Instr, RuntimeParameter};

impl<'a, 's> FunctionLowerer<'a, 's> {
    pub(super) fn lower_address_of(&mut self, value: ValueId, result: ValueId) -> CompileResult<()> {
        if let Some(named) = self.ctx.values.get_mut(value).named_mut() {
            named.address_taken = true;
        }
        let position = self.ctx.stable_position(value)?;
        self.ctx.values.consume(value)?;
        let dst = self.ctx.get_free_register(RegBank::Int)?;
        self.ctx.load_address(dst, position)?;
        self.ctx.bind_register(dst, result)
    }

    pub(super) fn lower_dereference(&mut self, pointer: ValueId, result: ValueId) -> CompileResult<()> {
        let pointee = self.ctx.values.get(result).ty.clone();
        let mut scope = self.ctx.lock_scope();

        if pointee.fits_register() {
            let ptr = scope.move_value_to_any_register(pointer)?;
            scope.lock(ptr);
            let dst = scope.get_free_register(pointee.bank())?;
            scope.emit(Instr::LoadPtr {
                dst,
                ptr,
                size: pointee.size() as u8,
            });
            scope.normalize(dst, &pointee);
            return scope.bind_register(dst, result);
        }

        let size = pointee.size();
        let slot = scope.allocate_stack_slot(size)?;
        let ptr = scope.take_value_register(pointer)?;
        scope.lock(ptr);
        let chunk = scope.get_free_register(RegBank::Int)?;
        scope.lock(chunk);
        let chunks = size.div_ceil(WORD_SIZE) as u32;
        log::trace!("copying {size} bytes through {ptr} in {chunks} chunks");
        for i in 0..chunks {
            if i > 0 {
                scope.emit(Instr::AluImm {
                    op: AluOp::Add,
                    dst: ptr,
                    imm: Imm::Value(WORD_SIZE),
                });
            }
            scope.emit(Instr::LoadPtr {
                dst: chunk,
                ptr,
                size: WORD_SIZE as u8,
            });
            scope.emit(Instr::StoreStack {
                src: chunk,
                slot: slot.advanced(i * WORD_SIZE as u32),
                size: WORD_SIZE as u8,
            });
        }
        scope
            .values
            .get_mut(result)
            .set_position(Some(Position::Stack(slot)));
        Ok(())
    }

    pub(super) fn lower_store(&mut self, pointer: ValueId, value: ValueId) -> CompileResult<()> {
        let pointer_ty = self.ctx.values.get(pointer).ty.clone();
        let pointee = pointer_ty
            .pointee()
            .cloned()
            .ok_or_else(|| internal!("store through {pointer_ty}"))?;
        let value_ty = self.ctx.values.get(value).ty.clone();
        let mut scope = self.ctx.lock_scope();

        if pointee.fits_register() {
            let ptr = scope.move_value_to_any_register(pointer)?;
            scope.lock(ptr);
            let src = if value_ty.unqualified() == pointee.unqualified() {
                scope.move_value_to_any_register(value)?
            } else {
                if let Some(current) = scope.values.get(value).register() {
                    scope.lock(current);
                }
                let reg = scope.get_free_register(pointee.bank())?;
                scope.lock(reg);
                scope.copy_value_to_position_with_cast(value, Position::Register(reg), &pointee)?;
                scope.values.consume(value)?;
                reg
            };
            scope.lock(src);
            scope.emit(Instr::StorePtr {
                ptr,
                src,
                size: pointee.size() as u8,
            });
            return Ok(());
        }

        let source = scope.stable_position(value)?;
        scope.values.consume(value)?;
        let ptr = scope.move_value_to_any_register(pointer)?;
        scope.lock(ptr);
        let src = scope.get_free_register(RegBank::Int)?;
        scope.lock(src);
        scope.load_address(src, source)?;
        scope.emit(Instr::CopyMem {
            dst: ptr,
            src,
            size: pointee.size(),
        });
        Ok(())
    }

    pub(super) fn lower_member(&mut self, pointer: ValueId, offset: u64, result: ValueId) -> CompileResult<()> {
        let dst = self.ctx.take_value_register(pointer)?;
        let mut scope = self.ctx.lock_register(dst);
        if offset != 0 {
            scope.emit(Instr::AluImm {
                op: AluOp::Add,
                dst,
                imm: Imm::Value(offset),
            });
        }
        scope.bind_register(dst, result)
    }

    pub(super) fn lower_function_address(&mut self, func: FuncId, result: ValueId) -> CompileResult<()> {
        let start = self.function(func)?.start;
        let dst = self.ctx.get_free_register(RegBank::Int)?;
        self.ctx.emit(Instr::RuntimeParam {
            dst,
            param: RuntimeParameter::CodeBase,
        });
        self.ctx.emit(Instr::AluImm {
            op: AluOp::Add,
            dst,
            imm: Imm::LabelAddress(start),
        });
        self.ctx.bind_register(dst, result)
    }
}
