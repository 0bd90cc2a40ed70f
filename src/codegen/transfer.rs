// This module moves values between registers, frame slots, the static segment and the code
// segment. The primitives at the bottom (load_from, store_register, load_address,
// copy_memory) know how to reach each kind of position: frame and outgoing slots are
// addressed directly by the VM's stack instructions, while static and code-segment
// positions need a scratch pointer built from a runtime base address plus an offset. Above
// them sit the value-level operations the lowering rules use. move_value_to_any_register,
// copy_value_to_any_register and take_value_register differ only in what happens to
// ownership of the register. copy_value_to_position writes a value into a given position
// without consuming it, and the cast variant additionally coerces between scalar widths
// and decays arrays to pointers. Integer values loaded from memory are canonicalised
// immediately with Mask or SignExtend, so a register always holds the full 64-bit form of
// its value.

//! Loads, stores and copies between value positions.

use super::context::CodegenContext;
use crate::core::{AsmReg, CompileError, CompileResult, Position, RegBank, Type, ValueId};
use crate::internal;
use crate::vm::{AluOp, Cond, Imm, Instr, RuntimeParameter};

impl<'s> CodegenContext<'s> {
    /// Bring a narrow integer-bank register into canonical form for `ty`.
    pub fn normalize(&mut self, reg: AsmReg, ty: &Type) {
        if reg.bank != RegBank::Int {
            return;
        }
        let size = ty.size();
        if size == 0 || size >= 8 {
            return;
        }
        let size = size as u8;
        if ty.is_signed() {
            self.emit(Instr::SignExtend { reg, size });
        } else {
            self.emit(Instr::Mask { reg, size });
        }
    }

    /// Round a float register to the precision of `ty`. Float registers hold
    /// doubles, so only single-precision targets need it.
    pub fn narrow_float(&mut self, reg: AsmReg, ty: &Type) {
        if reg.bank == RegBank::Float && ty.is_float() && ty.size() == 4 {
            self.emit(Instr::FNarrow(reg));
        }
    }

    /// Compute the address of a memory position into `dst`.
    pub fn load_address(&mut self, dst: AsmReg, position: Position) -> CompileResult<()> {
        match position {
            Position::Stack(slot) => self.emit(Instr::LeaStack { dst, slot }),
            Position::Static(offset) => {
                self.emit(Instr::RuntimeParam {
                    dst,
                    param: RuntimeParameter::StackBase,
                });
                self.emit(Instr::AluImm {
                    op: AluOp::Add,
                    dst,
                    imm: Imm::Value(offset),
                });
            }
            Position::CodeConstant(id) => {
                self.emit(Instr::RuntimeParam {
                    dst,
                    param: RuntimeParameter::CodeBase,
                });
                self.emit(Instr::AluImm {
                    op: AluOp::Add,
                    dst,
                    imm: Imm::ConstantAddress(id),
                });
            }
            Position::Register(reg) => {
                return Err(internal!("address of register {reg} requested"));
            }
        }
        Ok(())
    }

    /// Load a value of type `ty` stored at `position` into `dst`.
    pub fn load_from(&mut self, dst: AsmReg, position: Position, ty: &Type) -> CompileResult<()> {
        let size = ty.size() as u8;
        match position {
            Position::Register(src) => {
                if src != dst {
                    self.emit(Instr::Mov { dst, src });
                }
                return Ok(());
            }
            Position::Stack(slot) => self.emit(Instr::LoadStack { dst, slot, size }),
            Position::Static(_) | Position::CodeConstant(_) => {
                let mut scope = self.lock_register(dst);
                let ptr = scope.get_free_register(RegBank::Int)?;
                scope.load_address(ptr, position)?;
                scope.emit(Instr::LoadPtr { dst, ptr, size });
            }
        }
        self.normalize(dst, ty);
        Ok(())
    }

    /// Store `src` into `target` as a value of type `ty`.
    pub fn store_register(&mut self, src: AsmReg, target: Position, ty: &Type) -> CompileResult<()> {
        let size = ty.size() as u8;
        match target {
            Position::Register(dst) => {
                if src != dst {
                    self.emit(Instr::Mov { dst, src });
                }
            }
            Position::Stack(slot) => self.emit(Instr::StoreStack { src, slot, size }),
            Position::Static(_) | Position::CodeConstant(_) => {
                let mut scope = self.lock_register(src);
                let ptr = scope.get_free_register(RegBank::Int)?;
                scope.load_address(ptr, target)?;
                scope.emit(Instr::StorePtr { ptr, src, size });
            }
        }
        Ok(())
    }

    /// Materialise constant bits in `dst`, reusing a register that already holds them.
    pub fn load_constant(&mut self, dst: AsmReg, bits: u64) {
        let holder = self.regs.occupied(dst.bank).find(|(_, v)| {
            let value = self.values.get(*v);
            value.constant_bits() == Some(bits)
        });
        match holder {
            Some((reg, v)) => {
                self.values.touch(v);
                if reg != dst {
                    self.emit(Instr::Mov { dst, src: reg });
                }
            }
            None => self.emit(Instr::MovImm {
                dst,
                imm: Imm::Value(bits),
            }),
        }
    }

    /// Put a copy of `v` into `dst` without changing any binding.
    pub fn load_value(&mut self, dst: AsmReg, v: ValueId) -> CompileResult<()> {
        let value = self.values.get(v);
        if let Some(bits) = value.constant_bits() {
            self.load_constant(dst, bits);
            return Ok(());
        }
        let ty = value.ty.clone();
        let description = value.description;
        match value.position() {
            Some(Position::Register(src)) => {
                if src != dst {
                    self.emit(Instr::Mov { dst, src });
                }
            }
            Some(position) => {
                if !ty.fits_register() {
                    return Err(internal!("{v} ({description}) of type {ty} loaded into {dst}"));
                }
                self.load_from(dst, position, &ty)?;
            }
            None => return Err(internal!("{v} ({description}) has no location")),
        }
        self.values.touch(v);
        Ok(())
    }

    /// Copy `size_of(ty)` bytes between two memory positions.
    pub fn copy_memory(&mut self, dst: Position, src: Position, ty: &Type) -> CompileResult<()> {
        if dst.is_register() || src.is_register() {
            return Err(internal!("memory copy between {src} and {dst}"));
        }
        let size = ty.size();
        if let (Position::Stack(d), Position::Stack(s)) = (dst, src) {
            self.emit(Instr::CopyStack {
                dst: d,
                src: s,
                size,
            });
            return Ok(());
        }

        let mut scope = self.lock_scope();
        if ty.fits_register() && !dst.same_kind(&src) {
            let reg = scope.get_free_register(ty.bank())?;
            scope.lock(reg);
            scope.load_from(reg, src, ty)?;
            return scope.store_register(reg, dst, ty);
        }
        let dst_ptr = scope.get_free_register(RegBank::Int)?;
        scope.lock(dst_ptr);
        scope.load_address(dst_ptr, dst)?;
        let src_ptr = scope.get_free_register(RegBank::Int)?;
        scope.lock(src_ptr);
        scope.load_address(src_ptr, src)?;
        scope.emit(Instr::CopyMem {
            dst: dst_ptr,
            src: src_ptr,
            size,
        });
        Ok(())
    }

    /// Bind `v` to a register, consuming one reference.
    pub fn move_value_to_any_register(&mut self, v: ValueId) -> CompileResult<AsmReg> {
        if let Some(reg) = self.values.get(v).register() {
            self.values.touch(v);
            self.values.consume(v)?;
            return Ok(reg);
        }
        let bank = self.values.get(v).ty.bank();
        let reg = self.get_free_register(bank)?;
        self.load_value(reg, v)?;
        self.bind_register(reg, v)?;
        self.values.consume(v)?;
        Ok(reg)
    }

    /// Load a duplicate of `v` into a fresh register owned by nobody.
    ///
    /// The caller must lock the result before allocating again.
    pub fn copy_value_to_any_register(&mut self, v: ValueId) -> CompileResult<AsmReg> {
        let bank = self.values.get(v).ty.bank();
        let mut scope = self.lock_scope();
        if let Some(current) = scope.values.get(v).register() {
            scope.lock(current);
        }
        let reg = scope.get_free_register(bank)?;
        scope.load_value(reg, v)?;
        Ok(reg)
    }

    /// A register holding `v` that the caller may overwrite, consuming one reference.
    ///
    /// The last use of an unnamed value hands over its own register;
    /// otherwise a copy is made. The result is unbound; lock it.
    pub fn take_value_register(&mut self, v: ValueId) -> CompileResult<AsmReg> {
        let value = self.values.get(v);
        if let Some(reg) = value.register() {
            if !value.is_named() && value.remaining_references() == 1 {
                self.values.consume(v)?;
                self.unbind_register(reg)?;
                return Ok(reg);
            }
        }
        let reg = self.copy_value_to_any_register(v)?;
        self.values.consume(v)?;
        Ok(reg)
    }

    /// A memory position holding the current contents of `v`.
    ///
    /// Named values get their home and are written back; unnamed values
    /// living in a register are spilled.
    pub fn stable_position(&mut self, v: ValueId) -> CompileResult<Position> {
        let value = self.values.get(v);
        if value.is_named() {
            let home = self.ensure_home(v)?;
            self.flush_named(v)?;
            return Ok(home);
        }
        if value.is_constant() {
            return Err(internal!("constant {v} has no address"));
        }
        match value.position() {
            Some(Position::Register(reg)) => {
                self.spill_unnamed(v, reg)?;
                self.values
                    .get(v)
                    .position()
                    .ok_or_else(|| internal!("{v} lost its position while spilling"))
            }
            Some(position) => Ok(position),
            None => Err(internal!("{v} ({}) has no location", value.description)),
        }
    }

    /// Write `v` into `target` as a value of type `ty`, leaving `v` untouched.
    pub fn copy_value_to_position(
        &mut self,
        v: ValueId,
        target: Position,
        ty: &Type,
    ) -> CompileResult<()> {
        if let Position::Register(dst) = target {
            return self.load_value(dst, v);
        }
        let value = self.values.get(v);
        let bank = value.ty.bank();
        let description = value.description;
        match (value.constant_bits(), value.position()) {
            (Some(bits), _) => {
                let mut scope = self.lock_scope();
                let reg = scope.get_free_register(bank)?;
                scope.lock(reg);
                scope.load_constant(reg, bits);
                scope.store_register(reg, target, ty)
            }
            (None, Some(Position::Register(src))) => {
                self.values.touch(v);
                self.store_register(src, target, ty)
            }
            (None, Some(source)) if source == target => Ok(()),
            (None, Some(source)) => self.copy_memory(target, source, ty),
            (None, None) => Err(internal!("{v} ({description}) has no location")),
        }
    }

    /// Copy `v` into `target` and consume one reference.
    pub fn move_value_to_position(
        &mut self,
        v: ValueId,
        target: Position,
        ty: &Type,
    ) -> CompileResult<()> {
        self.copy_value_to_position(v, target, ty)?;
        self.values.consume(v)?;
        Ok(())
    }

    /// Like [`copy_value_to_position`](Self::copy_value_to_position), coercing to `target_ty`.
    pub fn copy_value_to_position_with_cast(
        &mut self,
        v: ValueId,
        target: Position,
        target_ty: &Type,
    ) -> CompileResult<()> {
        let source_ty = self.values.get(v).ty.clone();
        if source_ty.is_array() && target_ty.is_pointer() {
            return self.decay_to_position(v, target);
        }

        let scalar = source_ty.is_scalar() && target_ty.is_scalar();
        if scalar && source_ty.bank() != target_ty.bank() {
            return Err(CompileError::unsupported(format!(
                "implicit reinterpretation of {source_ty} as {target_ty}"
            )));
        }
        if !scalar && source_ty.size() != target_ty.size() {
            return Err(CompileError::unsupported(format!(
                "implicit conversion from {source_ty} to {target_ty}"
            )));
        }

        let to_bool = target_ty.is_bool() && !source_ty.is_bool();
        let retyped = scalar
            && target_ty.bank() == RegBank::Int
            && source_ty.unqualified() != target_ty.unqualified();
        let same_width = source_ty.size() == target_ty.size();
        if !to_bool && (!scalar || (same_width && !(retyped && target.is_register()))) {
            return self.copy_value_to_position(v, target, target_ty);
        }

        // Widths or canonical forms differ: go through a register.
        let mut scope = self.lock_scope();
        if let Some(current) = scope.values.get(v).register() {
            scope.lock(current);
        }
        let reg = match target {
            Position::Register(dst) => dst,
            _ => scope.get_free_register(target_ty.bank())?,
        };
        scope.lock(reg);
        scope.load_value(reg, v)?;
        if to_bool {
            scope.emit(Instr::CmpImm {
                lhs: reg,
                imm: 0,
                cond: Cond::Ne,
            });
        } else if source_ty.is_float() {
            // A 4-byte float store rounds by itself.
            if target.is_register() && source_ty.size() > target_ty.size() {
                scope.narrow_float(reg, target_ty);
            }
        } else if source_ty.size() > target_ty.size() || target.is_register() {
            scope.normalize(reg, target_ty);
        }
        scope.store_register(reg, target, target_ty)
    }

    /// Write the address of array `v` into `target`.
    fn decay_to_position(&mut self, v: ValueId, target: Position) -> CompileResult<()> {
        let home = self.stable_position(v)?;
        let mut scope = self.lock_scope();
        let reg = match target {
            Position::Register(dst) => dst,
            _ => scope.get_free_register(RegBank::Int)?,
        };
        scope.lock(reg);
        scope.load_address(reg, home)?;
        scope.store_register(reg, target, &Type::u64())
    }
}
