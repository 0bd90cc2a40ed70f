// Lowering rules for arithmetic, comparisons, unary operators and explicit conversions.
// Integer rules compute into a register they are allowed to clobber: the left operand's own
// register when this is its last use, a fresh copy otherwise, or, for in-place updates of a
// named variable, the variable's register, which is then marked dirty. A constant right
// operand is folded into the immediate form of the ALU opcode and a constant left operand
// of a commutative operator is swapped to the right first. Pointer arithmetic scales the
// integer side by the pointee size and pointer differences divide by it. Results narrower
// than a word are brought back into canonical form. Float rules work the same way on the
// float bank, which has no immediate forms.

use super::FunctionLowerer;
use crate::core::{CompileError, CompileResult, RegBank, Type, ValueId};
use crate::internal;
use crate::ir::{BinaryOp, CompareOp, UnaryOp};
use crate::vm::{AluOp, Cond, Imm, Instr};

impl<'a, 's> FunctionLowerer<'a, 's> {
    fn value_type(&self, v: ValueId) -> Type {
        self.ctx.values.get(v).ty.clone()
    }

    pub(super) fn lower_binary(
        &mut self,
        op: BinaryOp,
        lhs: ValueId,
        rhs: ValueId,
        result: ValueId,
        to_self: bool,
    ) -> CompileResult<()> {
        let lhs_ty = self.value_type(lhs);
        let rhs_ty = self.value_type(rhs);
        let result_ty = self.value_type(result);
        if lhs_ty.is_float() {
            return self.lower_float_binary(op, lhs, rhs, result, to_self);
        }

        // Integer + pointer is computed as pointer + integer.
        let (lhs, rhs, lhs_ty, rhs_ty) = if !to_self && rhs_ty.is_pointer() && !lhs_ty.is_pointer() {
            (rhs, lhs, rhs_ty, lhs_ty)
        } else {
            (lhs, rhs, lhs_ty, rhs_ty)
        };
        let pointer_difference = lhs_ty.is_pointer() && rhs_ty.is_pointer();
        let scale = lhs_ty.pointee().map_or(1, |pointee| pointee.size().max(1));
        let (lhs, rhs) = {
            let values = &self.ctx.values;
            let swap = !to_self
                && scale == 1
                && op.is_commutative()
                && values.get(lhs).is_constant()
                && !values.get(rhs).is_constant();
            if swap {
                (rhs, lhs)
            } else {
                (lhs, rhs)
            }
        };
        let alu = op.alu_op(result_ty.is_signed());

        let dst = if to_self {
            self.named_register(lhs)?
        } else {
            self.ctx.take_value_register(lhs)?
        };
        let mut scope = self.ctx.lock_register(dst);

        if let Some(bits) = scope.values.get(rhs).constant_bits() {
            scope.values.consume(rhs)?;
            let imm = if pointer_difference {
                bits
            } else {
                bits.wrapping_mul(scale)
            };
            scope.emit(Instr::AluImm {
                op: alu,
                dst,
                imm: Imm::Value(imm),
            });
        } else {
            let src = if scale > 1 && !pointer_difference {
                let src = scope.take_value_register(rhs)?;
                scope.lock(src);
                scope.emit(Instr::AluImm {
                    op: AluOp::Mul,
                    dst: src,
                    imm: Imm::Value(scale),
                });
                src
            } else {
                let src = scope.move_value_to_any_register(rhs)?;
                scope.lock(src);
                src
            };
            scope.emit(Instr::Alu { op: alu, dst, src });
        }

        if pointer_difference && scale > 1 {
            scope.emit(Instr::AluImm {
                op: AluOp::DivS,
                dst,
                imm: Imm::Value(scale),
            });
        }
        scope.normalize(dst, &result_ty);

        if to_self {
            drop(scope);
            self.mark_dirty(lhs);
            Ok(())
        } else {
            scope.bind_register(dst, result)
        }
    }

    fn lower_float_binary(
        &mut self,
        op: BinaryOp,
        lhs: ValueId,
        rhs: ValueId,
        result: ValueId,
        to_self: bool,
    ) -> CompileResult<()> {
        let fop = op
            .float_op()
            .ok_or_else(|| internal!("{} reached float lowering", op.mnemonic()))?;
        let dst = if to_self {
            self.named_register(lhs)?
        } else {
            self.ctx.take_value_register(lhs)?
        };
        let mut scope = self.ctx.lock_register(dst);
        let src = scope.move_value_to_any_register(rhs)?;
        scope.lock(src);
        scope.emit(Instr::FAlu { op: fop, dst, src });
        let result_ty = scope.values.get(result).ty.clone();
        scope.narrow_float(dst, &result_ty);

        if to_self {
            drop(scope);
            self.mark_dirty(lhs);
            Ok(())
        } else {
            scope.bind_register(dst, result)
        }
    }

    pub(super) fn lower_compare(
        &mut self,
        cond: CompareOp,
        lhs: ValueId,
        rhs: ValueId,
        result: ValueId,
    ) -> CompileResult<()> {
        let lhs_ty = self.value_type(lhs);
        let mut scope = self.ctx.lock_scope();

        if lhs_ty.is_float() {
            let a = scope.move_value_to_any_register(lhs)?;
            scope.lock(a);
            let b = scope.move_value_to_any_register(rhs)?;
            scope.lock(b);
            let dst = scope.get_free_register(RegBank::Int)?;
            scope.emit(Instr::FCmp {
                dst,
                lhs: a,
                rhs: b,
                cond: cond.cond(true),
            });
            return scope.bind_register(dst, result);
        }

        let mut cond = cond.cond(lhs_ty.is_signed());
        let (lhs, rhs) = {
            let values = &scope.values;
            if values.get(lhs).is_constant() && !values.get(rhs).is_constant() {
                cond = cond.swapped();
                (rhs, lhs)
            } else {
                (lhs, rhs)
            }
        };

        let dst = scope.take_value_register(lhs)?;
        scope.lock(dst);
        if let Some(bits) = scope.values.get(rhs).constant_bits() {
            scope.values.consume(rhs)?;
            scope.emit(Instr::CmpImm {
                lhs: dst,
                imm: bits,
                cond,
            });
        } else {
            let src = scope.move_value_to_any_register(rhs)?;
            scope.lock(src);
            scope.emit(Instr::Cmp {
                lhs: dst,
                rhs: src,
                cond,
            });
        }
        scope.bind_register(dst, result)
    }

    pub(super) fn lower_unary(
        &mut self,
        op: UnaryOp,
        operand: ValueId,
        result: ValueId,
    ) -> CompileResult<()> {
        let ty = self.value_type(operand);
        let result_ty = self.value_type(result);
        let mut scope = self.ctx.lock_scope();

        match op {
            UnaryOp::LogicalNot if ty.is_float() => {
                let src = scope.move_value_to_any_register(operand)?;
                scope.lock(src);
                let zero = scope.get_free_register(RegBank::Float)?;
                scope.lock(zero);
                scope.load_constant(zero, 0f64.to_bits());
                let dst = scope.get_free_register(RegBank::Int)?;
                scope.emit(Instr::FCmp {
                    dst,
                    lhs: src,
                    rhs: zero,
                    cond: Cond::Eq,
                });
                scope.bind_register(dst, result)
            }
            UnaryOp::LogicalNot => {
                let dst = scope.take_value_register(operand)?;
                scope.lock(dst);
                scope.emit(Instr::CmpImm {
                    lhs: dst,
                    imm: 0,
                    cond: Cond::Eq,
                });
                scope.bind_register(dst, result)
            }
            UnaryOp::Neg | UnaryOp::BitNot => {
                let dst = scope.take_value_register(operand)?;
                scope.lock(dst);
                scope.emit(match (op, ty.is_float()) {
                    (UnaryOp::Neg, true) => Instr::FNeg(dst),
                    (UnaryOp::Neg, false) => Instr::Neg(dst),
                    _ => Instr::Not(dst),
                });
                scope.normalize(dst, &result_ty);
                scope.bind_register(dst, result)
            }
        }
    }

    pub(super) fn lower_convert(&mut self, value: ValueId, result: ValueId) -> CompileResult<()> {
        let from = self.value_type(value);
        let to = self.value_type(result);
        let int_class = |ty: &Type| ty.is_integer() || ty.is_pointer();
        if (from.is_float() && to.is_pointer()) || (from.is_pointer() && to.is_float()) {
            return Err(CompileError::unsupported(format!(
                "conversion from {from} to {to}"
            )));
        }
        if !from.is_scalar() || !to.is_scalar() {
            return Err(CompileError::unsupported(format!(
                "conversion from {from} to {to}"
            )));
        }

        let mut scope = self.ctx.lock_scope();
        match (from.is_float(), to.is_float()) {
            (false, false) if int_class(&from) && int_class(&to) => {
                let dst = scope.take_value_register(value)?;
                scope.lock(dst);
                if to.is_bool() && !from.is_bool() {
                    scope.emit(Instr::CmpImm {
                        lhs: dst,
                        imm: 0,
                        cond: Cond::Ne,
                    });
                } else if to.size() < from.size() || to.is_signed() != from.is_signed() {
                    scope.normalize(dst, &to);
                }
                scope.bind_register(dst, result)
            }
            (false, true) => {
                let src = scope.move_value_to_any_register(value)?;
                scope.lock(src);
                let dst = scope.get_free_register(RegBank::Float)?;
                scope.emit(Instr::IntToFloat {
                    dst,
                    src,
                    signed: from.is_signed(),
                });
                scope.narrow_float(dst, &to);
                scope.bind_register(dst, result)
            }
            (true, false) => {
                let src = scope.move_value_to_any_register(value)?;
                scope.lock(src);
                let dst = scope.get_free_register(RegBank::Int)?;
                if to.is_bool() {
                    let zero = scope.get_free_register(RegBank::Float)?;
                    scope.lock(zero);
                    scope.load_constant(zero, 0f64.to_bits());
                    scope.emit(Instr::FCmp {
                        dst,
                        lhs: src,
                        rhs: zero,
                        cond: Cond::Ne,
                    });
                } else {
                    scope.emit(Instr::FloatToInt {
                        dst,
                        src,
                        signed: to.is_signed(),
                    });
                    scope.normalize(dst, &to);
                }
                scope.bind_register(dst, result)
            }
            (true, true) => {
                let dst = scope.take_value_register(value)?;
                if to.size() < from.size() {
                    scope.narrow_float(dst, &to);
                }
                scope.bind_register(dst, result)
            }
            (false, false) => Err(internal!("conversion from {from} to {to} reached lowering")),
        }
    }
}
