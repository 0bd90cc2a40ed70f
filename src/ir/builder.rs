// This module is the front-end facing construction API. A Module collects function
// declarations, module-level statics and read-only data for one compilation unit; a
// FunctionBuilder appends the mid-level operations of one function body. Every builder call
// validates its operands the way a type checker's last line of defence would: operand
// types must be compatible, values must be initialized before they are read, calls must
// match the callee's arity and parameter types, and labels must be placed exactly once.
// Violations are reported as user-facing errors carrying the current source location, and
// questionable but legal constructs (implicit narrowing, mismatched pointee types) become
// warnings. Each operand use is counted on the value as the operation is recorded, which
// is what lets the allocator discard temporaries at their last use. Module::finish hands
// everything to the lowering driver and returns a LoweredProgram that can be assembled
// any number of times.

//! Module and function builders.

use super::{
    BinaryOp, Callee, CompareOp, FuncId, FunctionDecl, Linkage, MidInstr, Op, UnaryOp,
};
use crate::codegen::{CodegenContext, ConstantPool, Frames, StaticSegment};
use crate::core::{
    CodegenOptions, CompilationSession, CompileError, CompileResult, Diagnostics, Position,
    Signature, SourceLoc, StackSlot, Storage, Type, ValueId, ValueStore, Warning, WORD_SIZE,
};
use crate::internal;
use crate::lower;
use crate::vm::{
    ArgClass, ArgLocation, AssembledImage, Assembler, CallLayout, FrameLayout, Instr, LabelId,
    ReturnLocation, RETURN_POINTER_OFFSET,
};
use hashbrown::{HashMap, HashSet};
use std::ops::Range;
use std::rc::Rc;
use std::sync::Arc;

/// Registers per bank an external call may use for its arguments.
const MAX_EXTERNAL_ARGS_PER_BANK: usize = 12;

/// Bring `bits` into the canonical register form of an integer-class `ty`.
fn canonical_bits(bits: u64, ty: &Type) -> u64 {
    if ty.is_bool() {
        return (bits != 0) as u64;
    }
    let size = ty.size();
    if size == 0 || size >= WORD_SIZE {
        return bits;
    }
    let shift = 64 - size * 8;
    if ty.is_signed() {
        (((bits << shift) as i64) >> shift) as u64
    } else {
        (bits << shift) >> shift
    }
}

/// Whether integer constant `bits` of type `from` is representable in `to`.
fn constant_fits(bits: u64, from: &Type, to: &Type) -> bool {
    let widen = |bits: u64, ty: &Type| {
        if ty.is_signed() {
            bits as i64 as i128
        } else {
            bits as i128
        }
    };
    widen(canonical_bits(bits, to), to) == widen(bits, from)
}

/// One compilation unit under construction.
pub struct Module<'s> {
    session: &'s CompilationSession<'s>,
    options: CodegenOptions,
    file: Arc<str>,
    values: ValueStore<'s>,
    functions: Vec<FunctionDecl<'s>>,
    names: HashMap<&'s str, FuncId>,
    frames: Frames,
    statics: StaticSegment,
    constants: ConstantPool<'s>,
    next_label: u32,
    entry: Option<FuncId>,
    diagnostics: Diagnostics,
}

impl<'s> Module<'s> {
    pub fn new(session: &'s CompilationSession<'s>, options: CodegenOptions, file: &str) -> Self {
        let diagnostics = Diagnostics::new(options.warnings_as_errors);
        Self {
            session,
            options,
            file: Arc::from(file),
            values: ValueStore::new(),
            functions: Vec::new(),
            names: HashMap::new(),
            frames: Frames::new(),
            statics: StaticSegment::default(),
            constants: ConstantPool::new(),
            next_label: 0,
            entry: None,
            diagnostics,
        }
    }

    pub fn session(&self) -> &'s CompilationSession<'s> {
        self.session
    }

    pub fn options(&self) -> &CodegenOptions {
        &self.options
    }

    /// Location `line` of this module's source file.
    pub fn loc(&self, line: u32) -> SourceLoc {
        SourceLoc::new(self.file.clone(), line)
    }

    pub fn values(&self) -> &ValueStore<'s> {
        &self.values
    }

    pub fn function(&self, func: FuncId) -> Option<&FunctionDecl<'s>> {
        self.functions.get(func.0 as usize)
    }

    pub fn warnings(&self) -> &[Warning] {
        self.diagnostics.warnings()
    }

    fn new_label(&mut self) -> LabelId {
        let label = LabelId(self.next_label);
        self.next_label += 1;
        label
    }

    fn decl(&self, func: FuncId) -> CompileResult<&FunctionDecl<'s>> {
        self.functions
            .get(func.0 as usize)
            .ok_or_else(|| internal!("unknown function {func}"))
    }

    /// Declare a function so it can be called before (or without) a body.
    pub fn declare_function(
        &mut self,
        name: &str,
        signature: Signature,
        linkage: Linkage,
        line: u32,
    ) -> CompileResult<FuncId> {
        let loc = self.loc(line);
        if self.names.contains_key(name) {
            return Err(CompileError::user(
                &loc,
                format!("function `{name}` is already declared"),
            ));
        }
        for param in &signature.params {
            if param.is_void() || param.is_function() {
                return Err(CompileError::user(
                    &loc,
                    format!("parameter of `{name}` cannot have type {param}"),
                ));
            }
        }
        if signature.ret.is_function() || signature.ret.is_array() {
            return Err(CompileError::user(
                &loc,
                format!("`{name}` cannot return {}", signature.ret),
            ));
        }
        if matches!(linkage, Linkage::External { .. }) {
            Self::check_external_signature(name, &signature, &loc)?;
        }

        let name = self.session.intern_str(name);
        let layout = CallLayout::for_signature(&signature);
        let frame = match linkage {
            Linkage::Internal => Some(self.frames.new_frame(layout.param_area_end)),
            Linkage::External { .. } => None,
        };
        let start = self.new_label();
        let epilogue = self.new_label();
        let id = FuncId(self.functions.len() as u32);
        log::debug!("declared {name}: {signature} as {id}");
        self.functions.push(FunctionDecl {
            name,
            signature: Rc::new(signature),
            linkage,
            layout,
            loc,
            frame,
            start,
            epilogue,
            params: Vec::new(),
            return_pointer: None,
            body: None,
        });
        self.names.insert(name, id);
        Ok(id)
    }

    fn check_external_signature(
        name: &str,
        signature: &Signature,
        loc: &SourceLoc,
    ) -> CompileResult<()> {
        let mut ints = 0;
        let mut floats = 0;
        for param in &signature.params {
            match ArgClass::of(param) {
                ArgClass::Integer => ints += 1,
                ArgClass::Float => floats += 1,
                ArgClass::Memory => {
                    return Err(CompileError::user(
                        loc,
                        format!("external function `{name}` cannot take {param} by value"),
                    ))
                }
            }
        }
        if ints > MAX_EXTERNAL_ARGS_PER_BANK || floats > MAX_EXTERNAL_ARGS_PER_BANK {
            return Err(CompileError::user(
                loc,
                format!("too many arguments for external function `{name}`"),
            ));
        }
        if !signature.ret.is_void() && ArgClass::of(&signature.ret) == ArgClass::Memory {
            return Err(CompileError::user(
                loc,
                format!("external function `{name}` cannot return {}", signature.ret),
            ));
        }
        Ok(())
    }

    pub fn lookup_function(&self, name: &str) -> Option<FuncId> {
        self.names.get(name).copied()
    }

    /// Declare a module-level static variable. Statics start zeroed.
    pub fn declare_static(&mut self, name: &str, ty: Type, line: u32) -> CompileResult<ValueId> {
        let loc = self.loc(line);
        self.new_static(name, ty, &loc)
    }

    fn new_static(&mut self, name: &str, ty: Type, loc: &SourceLoc) -> CompileResult<ValueId> {
        if ty.is_void() || ty.is_function() {
            return Err(CompileError::user(
                loc,
                format!("static `{name}` cannot have type {ty}"),
            ));
        }
        let name = self.session.intern_str(name);
        let offset = self.statics.allocate(ty.size(), ty.align());
        let v = self.values.create_named(ty, name, Storage::Static);
        let home = Position::Static(offset);
        let value = self.values.get_mut(v);
        if let Some(named) = value.named() {
            named.set_home(home)?;
        }
        value.set_position(Some(home));
        value.initialized = true;
        log::debug!("static {name} at offset {offset}");
        Ok(v)
    }

    /// Make `func` the function called by the image's entry stub.
    pub fn set_entry(&mut self, func: FuncId, line: u32) -> CompileResult<()> {
        let loc = self.loc(line);
        let decl = self.decl(func)?;
        if decl.is_external() {
            return Err(CompileError::user(
                &loc,
                format!("external function `{}` cannot be the entry point", decl.name),
            ));
        }
        if !decl.signature.params.is_empty() {
            return Err(CompileError::user(
                &loc,
                format!("entry function `{}` cannot take parameters", decl.name),
            ));
        }
        self.entry = Some(func);
        Ok(())
    }

    /// Start the body of a declared internal function.
    pub fn define_function(
        &mut self,
        func: FuncId,
        param_names: &[&str],
        line: u32,
    ) -> CompileResult<FunctionBuilder<'_, 's>> {
        let loc = self.loc(line);
        let decl = self.decl(func)?;
        if decl.is_external() {
            return Err(CompileError::user(
                &loc,
                format!("external function `{}` cannot have a body", decl.name),
            ));
        }
        if decl.is_defined() {
            return Err(CompileError::user(
                &loc,
                format!("function `{}` is already defined", decl.name),
            ));
        }
        if param_names.len() != decl.signature.params.len() {
            return Err(CompileError::user(
                &loc,
                format!(
                    "`{}` declares {} parameters but {} names were given",
                    decl.name,
                    decl.signature.params.len(),
                    param_names.len()
                ),
            ));
        }
        let frame = decl
            .frame
            .ok_or_else(|| internal!("internal function {func} has no frame"))?;
        let signature = decl.signature.clone();
        let layout = decl.layout.clone();

        let mut params = Vec::with_capacity(param_names.len());
        for ((name, ty), location) in param_names
            .iter()
            .zip(signature.params.iter())
            .zip(layout.args.iter())
        {
            let name = self.session.intern_str(name);
            let v = self.values.create_named(ty.clone(), name, Storage::Auto);
            let value = self.values.get_mut(v);
            value.initialized = true;
            if let ArgLocation::Stack(offset) = location {
                let home = Position::Stack(StackSlot::frame(frame, *offset));
                if let Some(named) = value.named() {
                    named.set_home(home)?;
                }
                value.set_position(Some(home));
            }
            params.push(v);
        }

        let return_pointer = if layout.ret == ReturnLocation::Memory {
            let name = self.session.intern_str("return buffer");
            let ty = Type::pointer_to(signature.ret.clone());
            let v = self.values.create_named(ty, name, Storage::Auto);
            let home = Position::Stack(StackSlot::frame(frame, RETURN_POINTER_OFFSET));
            let value = self.values.get_mut(v);
            if let Some(named) = value.named() {
                named.set_home(home)?;
            }
            value.set_position(Some(home));
            value.initialized = true;
            Some(v)
        } else {
            None
        };

        let decl = &mut self.functions[func.0 as usize];
        decl.params = params;
        decl.return_pointer = return_pointer;
        log::info!("defining {}", decl.name);

        Ok(FunctionBuilder {
            module: self,
            func,
            signature,
            ops: Vec::new(),
            loc,
            placed_labels: HashSet::new(),
            used_labels: Vec::new(),
        })
    }

    /// Lower every function. Fails if an internal function was declared but never defined.
    pub fn finish(self) -> CompileResult<LoweredProgram<'s>> {
        for decl in &self.functions {
            if !decl.is_external() && !decl.is_defined() {
                return Err(CompileError::user(
                    &decl.loc,
                    format!("function `{}` is declared but never defined", decl.name),
                ));
            }
        }

        let Module {
            session,
            options,
            values,
            functions,
            frames,
            statics,
            constants,
            entry,
            diagnostics,
            ..
        } = self;
        let optimize = options.optimize;
        let mut ctx = CodegenContext::new(session, options, values, frames, statics, constants);
        let ranges = lower::lower_module(&mut ctx, &functions, entry)?;
        let (instrs, frames, statics, constants) = ctx.into_parts();

        let functions = functions
            .iter()
            .zip(ranges)
            .filter_map(|(decl, range)| {
                range.map(|range| LoweredFunction {
                    name: decl.name,
                    start: decl.start,
                    instructions: range,
                })
            })
            .collect();

        Ok(LoweredProgram {
            session,
            instrs,
            layout: FrameLayout {
                frame_sizes: frames.into_sizes(),
                static_size: statics.size(),
            },
            blobs: constants.blobs(),
            functions,
            optimize,
            warnings: diagnostics.warnings().to_vec(),
        })
    }
}

/// Appends the operations of one function body.
pub struct FunctionBuilder<'m, 's> {
    module: &'m mut Module<'s>,
    func: FuncId,
    signature: Rc<Signature>,
    ops: Vec<Op<'s>>,
    loc: SourceLoc,
    placed_labels: HashSet<LabelId>,
    used_labels: Vec<(LabelId, SourceLoc)>,
}

impl<'m, 's> FunctionBuilder<'m, 's> {
    /// Set the source line attached to subsequent operations.
    pub fn at(&mut self, line: u32) -> &mut Self {
        self.loc = self.module.loc(line);
        self
    }

    pub fn func(&self) -> FuncId {
        self.func
    }

    pub fn values(&self) -> &ValueStore<'s> {
        &self.module.values
    }

    fn user(&self, message: impl Into<String>) -> CompileError {
        CompileError::user(&self.loc, message)
    }

    fn warn(&mut self, message: impl Into<String>) -> CompileResult<()> {
        self.module.diagnostics.warn(&self.loc, message)
    }

    fn push(&mut self, instr: MidInstr<'s>) {
        for operand in instr.operands() {
            self.module.values.note_use(operand);
        }
        log::trace!("{}: {instr}", self.loc);
        self.ops.push(Op {
            instr,
            loc: self.loc.clone(),
        });
    }

    fn check_value(&self, v: ValueId) -> CompileResult<()> {
        if (v.0 as usize) < self.module.values.len() {
            Ok(())
        } else {
            Err(internal!("unknown value {v}"))
        }
    }

    /// Type of an operand that is about to be read.
    fn read(&self, v: ValueId) -> CompileResult<Type> {
        self.check_value(v)?;
        let value = self.module.values.get(v);
        if !value.initialized {
            return Err(self.user(format!(
                "`{}` is used before it is initialized",
                value.description
            )));
        }
        Ok(value.ty.clone())
    }

    fn temporary(&mut self, ty: Type, description: &str) -> ValueId {
        let description = self.module.session.intern_str(description);
        self.module.values.create_temporary(ty, description)
    }

    /// Warn when `value` of type `from` is implicitly narrowed or retyped into `to`.
    fn check_implicit(&mut self, value: ValueId, from: &Type, to: &Type, what: &str) -> CompileResult<()> {
        if from.is_integer() && to.is_integer() && from.size() > to.size() {
            let bits = self.module.values.get(value).constant_bits();
            if !bits.is_some_and(|bits| constant_fits(bits, from, to)) {
                return self.warn(format!("implicit narrowing from {from} to {to} in {what}"));
            }
        }
        if let (Some(a), Some(b)) = (from.pointee(), to.pointee()) {
            if a.unqualified() != b.unqualified() && !a.is_void() && !b.is_void() {
                return self.warn(format!("pointee types differ ({from} vs {to}) in {what}"));
            }
        }
        Ok(())
    }

    /// The `index`th parameter of the function.
    pub fn param(&self, index: usize) -> CompileResult<ValueId> {
        self.module.functions[self.func.0 as usize]
            .params
            .get(index)
            .copied()
            .ok_or_else(|| self.user(format!("parameter {index} does not exist")))
    }

    /// Integer, bool or pointer constant.
    pub fn constant(&mut self, ty: Type, value: i64) -> CompileResult<ValueId> {
        if !(ty.is_integer() || ty.is_pointer()) {
            return Err(self.user(format!("{ty} cannot hold the integer {value}")));
        }
        let bits = canonical_bits(value as u64, &ty);
        let description = self.module.session.intern_str(&value.to_string());
        Ok(self.module.values.create_constant(ty, bits, description))
    }

    pub fn float_constant(&mut self, ty: Type, value: f64) -> CompileResult<ValueId> {
        if !ty.is_float() {
            return Err(self.user(format!("{ty} cannot hold the float {value}")));
        }
        let value = if ty.size() == 4 {
            value as f32 as f64
        } else {
            value
        };
        let description = self.module.session.intern_str(&value.to_string());
        Ok(self
            .module
            .values
            .create_constant(ty, value.to_bits(), description))
    }

    /// A local variable, uninitialized until first assigned.
    pub fn variable(&mut self, ty: Type, name: &str) -> CompileResult<ValueId> {
        if ty.is_void() || ty.is_function() {
            return Err(self.user(format!("variable `{name}` cannot have type {ty}")));
        }
        let name = self.module.session.intern_str(name);
        Ok(self.module.values.create_named(ty, name, Storage::Auto))
    }

    /// A function-local static: zeroed once, kept across calls.
    pub fn static_variable(&mut self, ty: Type, name: &str) -> CompileResult<ValueId> {
        let loc = self.loc.clone();
        self.module.new_static(name, ty, &loc)
    }

    /// Read-only array data living in the code segment.
    pub fn data(&mut self, element: Type, bytes: &[u8]) -> CompileResult<ValueId> {
        let element_size = element.size();
        if element_size == 0 || bytes.len() as u64 % element_size != 0 {
            return Err(self.user(format!(
                "{} bytes of data do not form an array of {element}",
                bytes.len()
            )));
        }
        let len = bytes.len() as u64 / element_size;
        let ty = Type::array_of(element.constant(), len);

        let mut padded = bytes.to_vec();
        padded.resize((bytes.len().max(1)).div_ceil(8) * 8, 0);
        let blob = self.module.session.alloc_bytes(&padded);
        let id = self.module.constants.push_unique(blob);

        let name = self.module.session.intern_str("data");
        let v = self.module.values.create_named(ty, name, Storage::ReadOnly);
        let home = Position::CodeConstant(id);
        let value = self.module.values.get_mut(v);
        if let Some(named) = value.named() {
            named.set_home(home)?;
        }
        value.set_position(Some(home));
        value.initialized = true;
        Ok(v)
    }

    fn binary_type(&self, op: BinaryOp, lhs: &Type, rhs: &Type, rhs_value: ValueId) -> CompileResult<Type> {
        let invalid = || {
            self.user(format!(
                "invalid operands to {}: {lhs} and {rhs}",
                op.mnemonic()
            ))
        };
        if !lhs.is_scalar() || !rhs.is_scalar() {
            return Err(invalid());
        }
        if lhs.is_float() != rhs.is_float() {
            return Err(self.user(format!(
                "cannot mix {lhs} and {rhs} in {}; convert explicitly",
                op.mnemonic()
            )));
        }
        if lhs.is_float() {
            if op.float_op().is_none() {
                return Err(self.user(format!("{} is not defined for floats", op.mnemonic())));
            }
            let wider = if rhs.size() > lhs.size() { rhs } else { lhs };
            return Ok(wider.unqualified());
        }

        match (lhs.pointee(), rhs.pointee()) {
            (Some(a), Some(b)) => {
                if op != BinaryOp::Sub {
                    return Err(invalid());
                }
                if a.unqualified() != b.unqualified() || a.size() == 0 {
                    return Err(self.user(format!("cannot subtract {rhs} from {lhs}")));
                }
                return Ok(Type::i64());
            }
            (Some(pointee), None) | (None, Some(pointee)) => {
                let pointer_left = lhs.is_pointer();
                if !(op == BinaryOp::Add || (op == BinaryOp::Sub && pointer_left)) {
                    return Err(invalid());
                }
                if pointee.size() == 0 {
                    return Err(self.user(format!("arithmetic on {}", if pointer_left { lhs } else { rhs })));
                }
                return Ok(if pointer_left { lhs } else { rhs }.unqualified());
            }
            (None, None) => {}
        }

        if op.is_division() && self.module.values.get(rhs_value).constant_bits() == Some(0) {
            return Err(self.user("division by zero"));
        }
        if op.is_shift() {
            return Ok(lhs.unqualified());
        }
        if op.is_bitwise() && lhs.is_bool() && rhs.is_bool() {
            return Ok(Type::bool());
        }
        let promote = |ty: &Type| if ty.is_bool() { Type::u8() } else { ty.unqualified() };
        Ok(if rhs.size() > lhs.size() {
            promote(rhs)
        } else {
            promote(lhs)
        })
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: ValueId, rhs: ValueId) -> CompileResult<ValueId> {
        let lt = self.read(lhs)?;
        let rt = self.read(rhs)?;
        let ty = self.binary_type(op, &lt, &rt, rhs)?;
        let result = self.temporary(ty, op.mnemonic());
        // Integer + pointer keeps the pointer on the left.
        let (lhs, rhs) = if rt.is_pointer() && !lt.is_pointer() {
            (rhs, lhs)
        } else {
            (lhs, rhs)
        };
        self.push(MidInstr::Binary {
            op,
            lhs,
            rhs,
            result,
            to_self: false,
        });
        Ok(result)
    }

    /// `target op= rhs` on a named variable, updated in place.
    pub fn binary_to_self(&mut self, op: BinaryOp, target: ValueId, rhs: ValueId) -> CompileResult<()> {
        let tt = self.read(target)?;
        let rt = self.read(rhs)?;
        let (name, storage) = match self.module.values.get(target).named() {
            Some(named) => (named.name, named.storage),
            None => return Err(self.user("left side of a compound assignment is not a variable")),
        };
        if tt.is_const || storage == Storage::ReadOnly {
            return Err(self.user(format!("cannot assign to const `{name}`")));
        }
        if rt.is_pointer() && !tt.is_pointer() {
            return Err(self.user(format!("cannot add {rt} to `{name}` of type {tt}")));
        }
        let ty = self.binary_type(op, &tt, &rt, rhs)?;
        self.check_implicit(rhs, &ty, &tt, &format!("update of `{name}`"))?;
        self.push(MidInstr::Binary {
            op,
            lhs: target,
            rhs,
            result: target,
            to_self: true,
        });
        Ok(())
    }

    pub fn compare(&mut self, cond: CompareOp, lhs: ValueId, rhs: ValueId) -> CompileResult<ValueId> {
        let lt = self.read(lhs)?;
        let rt = self.read(rhs)?;
        let comparable = (lt.is_integer() && rt.is_integer())
            || (lt.is_float() && rt.is_float())
            || (lt.is_pointer() && rt.is_pointer());
        if !comparable {
            return Err(self.user(format!("cannot compare {lt} with {rt}")));
        }
        self.check_implicit(rhs, &rt, &lt, "comparison")?;
        let result = self.temporary(Type::bool(), cond.mnemonic());
        self.push(MidInstr::Compare {
            cond,
            lhs,
            rhs,
            result,
        });
        Ok(result)
    }

    pub fn unary(&mut self, op: UnaryOp, operand: ValueId) -> CompileResult<ValueId> {
        let ty = self.read(operand)?;
        let result_ty = match op {
            UnaryOp::Neg if (ty.is_integer() && !ty.is_bool()) || ty.is_float() => ty.unqualified(),
            UnaryOp::BitNot if ty.is_integer() && !ty.is_bool() => ty.unqualified(),
            UnaryOp::LogicalNot if ty.is_scalar() => Type::bool(),
            _ => {
                return Err(self.user(format!(
                    "{} is not defined for {ty}",
                    op.mnemonic()
                )))
            }
        };
        let result = self.temporary(result_ty, op.mnemonic());
        self.push(MidInstr::Unary {
            op,
            operand,
            result,
        });
        Ok(result)
    }

    /// Explicit conversion between scalar types.
    pub fn convert(&mut self, value: ValueId, ty: Type) -> CompileResult<ValueId> {
        let from = self.read(value)?;
        if !from.is_scalar() || !ty.is_scalar() {
            return Err(self.user(format!("cannot convert {from} to {ty}")));
        }
        let result = self.temporary(ty.unqualified(), "convert");
        self.push(MidInstr::Convert { value, result });
        Ok(result)
    }

    pub fn assign(&mut self, target: ValueId, value: ValueId) -> CompileResult<()> {
        self.check_value(target)?;
        let vt = self.read(value)?;
        let target_value = self.module.values.get(target);
        let tt = target_value.ty.clone();
        let initialized = target_value.initialized;
        let Some(named) = target_value.named() else {
            return Err(self.user("assignment target is not a variable"));
        };
        let name = named.name;
        if named.storage == Storage::ReadOnly || (tt.is_const && initialized) {
            return Err(self.user(format!("cannot assign to const `{name}`")));
        }
        if !vt.assignable_to(&tt) {
            return Err(self.user(format!(
                "cannot assign {vt} to `{name}` of type {tt}"
            )));
        }
        self.check_implicit(value, &vt, &tt, &format!("assignment to `{name}`"))?;
        self.push(MidInstr::Assign { target, value });
        self.module.values.get_mut(target).initialized = true;
        Ok(())
    }

    fn check_arguments(&mut self, name: &str, signature: &Signature, args: &[ValueId]) -> CompileResult<()> {
        if args.len() != signature.params.len() {
            return Err(self.user(format!(
                "`{name}` expects {} arguments, got {}",
                signature.params.len(),
                args.len()
            )));
        }
        for (i, (arg, param)) in args.iter().zip(signature.params.iter()).enumerate() {
            let ty = self.read(*arg)?;
            if !ty.assignable_to(param) {
                return Err(self.user(format!(
                    "argument {} of `{name}` has type {ty}, expected {param}",
                    i + 1
                )));
            }
            self.check_implicit(*arg, &ty, param, &format!("argument {} of `{name}`", i + 1))?;
        }
        Ok(())
    }

    /// Call a declared function. Returns the result value unless it returns void.
    pub fn call(&mut self, func: FuncId, args: &[ValueId]) -> CompileResult<Option<ValueId>> {
        let decl = self.module.decl(func)?;
        let name = decl.name;
        let signature = decl.signature.clone();
        self.check_arguments(name, &signature, args)?;
        let result = signature
            .returns_value()
            .then(|| self.temporary(signature.ret.unqualified(), name));
        self.push(MidInstr::Call {
            callee: Callee::Direct(func),
            args: args.to_vec(),
            result,
        });
        Ok(result)
    }

    /// Call through a function pointer.
    pub fn call_indirect(&mut self, pointer: ValueId, args: &[ValueId]) -> CompileResult<Option<ValueId>> {
        let ty = self.read(pointer)?;
        if ty.is_function() {
            return Err(CompileError::unsupported(format!(
                "call through a value of function type {ty}"
            )));
        }
        let signature = match (ty.is_pointer(), ty.signature()) {
            (true, Some(signature)) => signature.clone(),
            _ => return Err(self.user(format!("called value of type {ty} is not a function pointer"))),
        };
        self.check_arguments("function pointer", &signature, args)?;
        let result = signature
            .returns_value()
            .then(|| self.temporary(signature.ret.unqualified(), "indirect call"));
        self.push(MidInstr::Call {
            callee: Callee::Indirect(pointer),
            args: args.to_vec(),
            result,
        });
        Ok(result)
    }

    pub fn address_of(&mut self, value: ValueId) -> CompileResult<ValueId> {
        self.check_value(value)?;
        let operand = self.module.values.get(value);
        if operand.is_constant() {
            return Err(self.user(format!(
                "cannot take the address of the constant {}",
                operand.description
            )));
        }
        if !operand.is_named() && !operand.initialized {
            return Err(self.user("cannot take the address of an uninitialized temporary"));
        }
        let ty = Type::pointer_to(operand.ty.clone());
        let description = self
            .module
            .session
            .intern_str(&format!("&{}", operand.description));
        // The pointee may be written through the pointer.
        self.module.values.get_mut(value).initialized = true;
        let result = self.module.values.create_reference(ty, description);
        self.push(MidInstr::AddressOf { value, result });
        Ok(result)
    }

    pub fn dereference(&mut self, pointer: ValueId) -> CompileResult<ValueId> {
        let ty = self.read(pointer)?;
        let pointee = match ty.pointee() {
            Some(pointee) if !pointee.is_void() && !pointee.is_function() => pointee.clone(),
            _ => return Err(self.user(format!("cannot dereference {ty}"))),
        };
        let result = self.temporary(pointee, "deref");
        self.push(MidInstr::Dereference { pointer, result });
        Ok(result)
    }

    /// `*pointer = value`.
    pub fn store(&mut self, pointer: ValueId, value: ValueId) -> CompileResult<()> {
        let pt = self.read(pointer)?;
        let vt = self.read(value)?;
        let pointee = match pt.pointee() {
            Some(pointee) if !pointee.is_void() && !pointee.is_function() => pointee.clone(),
            _ => return Err(self.user(format!("cannot store through {pt}"))),
        };
        if pointee.is_const {
            return Err(self.user(format!("cannot store through {pt}")));
        }
        if !vt.assignable_to(&pointee) {
            return Err(self.user(format!("cannot store {vt} through {pt}")));
        }
        self.check_implicit(value, &vt, &pointee, "store")?;
        self.push(MidInstr::Store { pointer, value });
        Ok(())
    }

    /// Pointer to field `field` of the struct `pointer` points to.
    pub fn member(&mut self, pointer: ValueId, field: &str) -> CompileResult<ValueId> {
        let pt = self.read(pointer)?;
        let pointee = pt.pointee().cloned();
        let Some((layout, is_const)) = pointee
            .as_ref()
            .and_then(|p| p.struct_layout().map(|layout| (layout.clone(), p.is_const)))
        else {
            return Err(self.user(format!("{pt} does not point to a struct")));
        };
        let Some(found) = layout.field(field) else {
            return Err(self.user(format!(
                "struct {} has no field `{field}`",
                layout.name
            )));
        };
        let field_ty = if is_const {
            found.ty.clone().constant()
        } else {
            found.ty.clone()
        };
        let offset = found.offset;
        let result = self.temporary(Type::pointer_to(field_ty), field);
        self.push(MidInstr::Member {
            pointer,
            offset,
            result,
        });
        Ok(result)
    }

    pub fn function_address(&mut self, func: FuncId) -> CompileResult<ValueId> {
        let decl = self.module.decl(func)?;
        if decl.is_external() {
            return Err(self.user(format!(
                "cannot take the address of external function `{}`",
                decl.name
            )));
        }
        let name = decl.name;
        let ty = Type::pointer_to(Type::function((*decl.signature).clone()));
        let result = self.temporary(ty, name);
        self.push(MidInstr::FunctionAddress { func, result });
        Ok(result)
    }

    pub fn new_label(&mut self) -> LabelId {
        self.module.new_label()
    }

    pub fn place_label(&mut self, label: LabelId) -> CompileResult<()> {
        if !self.placed_labels.insert(label) {
            return Err(self.user(format!("label {label} is placed twice")));
        }
        self.push(MidInstr::Label(label));
        Ok(())
    }

    pub fn jump(&mut self, label: LabelId) {
        self.used_labels.push((label, self.loc.clone()));
        self.push(MidInstr::Jump(label));
    }

    /// Jump to `target` when `cond` is non-zero (`jump_if`) or zero.
    ///
    /// `spill_all` additionally empties every register before jumping.
    pub fn branch(&mut self, cond: ValueId, target: LabelId, jump_if: bool, spill_all: bool) -> CompileResult<()> {
        let ty = self.read(cond)?;
        if !(ty.is_integer() || ty.is_pointer()) {
            return Err(self.user(format!("branch condition cannot have type {ty}")));
        }
        self.used_labels.push((target, self.loc.clone()));
        self.push(MidInstr::Branch {
            cond,
            target,
            jump_if,
            spill_all,
        });
        Ok(())
    }

    pub fn ret(&mut self, value: Option<ValueId>) -> CompileResult<()> {
        let name = self.module.functions[self.func.0 as usize].name;
        let ret = self.signature.ret.clone();
        match value {
            Some(_) if ret.is_void() => {
                return Err(self.user(format!("`{name}` returns void")));
            }
            None if !ret.is_void() => {
                return Err(self.user(format!("`{name}` must return a value of type {ret}")));
            }
            Some(v) => {
                let ty = self.read(v)?;
                if !ty.assignable_to(&ret) {
                    return Err(self.user(format!(
                        "`{name}` returns {ret}, not {ty}"
                    )));
                }
                self.check_implicit(v, &ty, &ret, &format!("return from `{name}`"))?;
            }
            None => {}
        }
        self.push(MidInstr::Return(value));
        Ok(())
    }

    pub fn comment(&mut self, text: &str) {
        let text = self.module.session.intern_str(text);
        self.push(MidInstr::Comment(text));
    }

    /// Complete the body. Every label jumped to must have been placed.
    pub fn finish(self) -> CompileResult<()> {
        for (label, loc) in &self.used_labels {
            if !self.placed_labels.contains(label) {
                return Err(CompileError::user(
                    loc,
                    format!("label {label} is never placed"),
                ));
            }
        }
        let decl = &mut self.module.functions[self.func.0 as usize];
        log::info!("built {} with {} operations", decl.name, self.ops.len());
        decl.body = Some(self.ops);
        Ok(())
    }
}

/// A lowered function's place in the instruction stream.
#[derive(Debug, Clone)]
pub struct LoweredFunction<'s> {
    pub name: &'s str,
    pub start: LabelId,
    pub instructions: Range<usize>,
}

/// The low-level program of a module, ready for assembly.
pub struct LoweredProgram<'s> {
    session: &'s CompilationSession<'s>,
    pub instrs: Vec<Instr<'s>>,
    pub layout: FrameLayout,
    pub blobs: Vec<(crate::core::ConstId, &'s [u8])>,
    pub functions: Vec<LoweredFunction<'s>>,
    pub optimize: bool,
    pub warnings: Vec<Warning>,
}

impl<'s> LoweredProgram<'s> {
    /// Instructions of the function called `name`.
    pub fn function_instrs(&self, name: &str) -> Option<&[Instr<'s>]> {
        self.functions
            .iter()
            .find(|f| f.name == name)
            .map(|f| &self.instrs[f.instructions.clone()])
    }

    /// Assemble the image. Repeated calls produce identical bytes.
    pub fn assemble(&self) -> CompileResult<AssembledImage<'s>> {
        let image = Assembler::new(&self.layout, self.optimize).assemble(&self.instrs, &self.blobs)?;
        self.session.record_image_size(image.len());
        Ok(image)
    }
}
