//! Test lowering of pointer operations: loads, stores, field access,
//! statics and read-only data.

use bumpalo::Bump;
use vmgen::core::{
    AsmReg, CodegenOptions, CompilationSession, ConstId, FrameId, Signature, StackSlot,
    StructLayout, Type,
};
use vmgen::ir::{BinaryOp, Linkage, Module};
use vmgen::vm::{disassemble, AluOp, DecodedOperand, Imm, Instr, Opcode, RuntimeParameter};
use vmgen::{CompileError, LoweredProgram};

fn options() -> CodegenOptions {
    CodegenOptions {
        emit_debug_locations: false,
        emit_comments: false,
        verify: true,
        ..CodegenOptions::default()
    }
}

fn real_instrs<'s>(program: &LoweredProgram<'s>, name: &str) -> Vec<Instr<'s>> {
    program
        .function_instrs(name)
        .expect("function was lowered")
        .iter()
        .filter(|i| i.opcode().is_some())
        .cloned()
        .collect()
}

fn pair() -> Type {
    Type::structure(StructLayout::new(
        "Pair",
        vec![("a".to_string(), Type::u64()), ("b".to_string(), Type::u64())],
    ))
}

#[test]
fn test_word_load_is_single_instruction() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new(&session, options(), "load.v");

    // fn load(p: *u64) -> u64 { return *p; }
    let load = module
        .declare_function(
            "load",
            Signature::new(vec![Type::pointer_to(Type::u64())], Type::u64()),
            Linkage::Internal,
            1,
        )
        .unwrap();
    let mut f = module.define_function(load, &["p"], 1).unwrap();
    let p = f.param(0).unwrap();
    let value = f.at(2).dereference(p).unwrap();
    f.ret(Some(value)).unwrap();
    f.finish().unwrap();

    let program = module.finish().unwrap();
    let instrs = real_instrs(&program, "load");
    let loads: Vec<_> = instrs
        .iter()
        .filter(|i| matches!(i, Instr::LoadPtr { .. }))
        .collect();
    assert_eq!(loads.len(), 1);
    assert!(matches!(
        loads[0],
        Instr::LoadPtr { ptr, size: 8, .. } if *ptr == AsmReg::int(0)
    ));
    // No copy of the pointer and no canonicalisation of a full word.
    assert!(!instrs
        .iter()
        .any(|i| matches!(i, Instr::Mask { .. } | Instr::SignExtend { .. })));
}

#[test]
fn test_wide_load_copies_in_chunks() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new(&session, options(), "pair.v");

    // fn copy(p: *Pair) { q: Pair = *p; }
    let copy = module
        .declare_function(
            "copy",
            Signature::new(vec![Type::pointer_to(pair())], Type::void()),
            Linkage::Internal,
            1,
        )
        .unwrap();
    let mut f = module.define_function(copy, &["p"], 1).unwrap();
    let p = f.param(0).unwrap();
    let q = f.at(2).variable(pair(), "q").unwrap();
    let value = f.dereference(p).unwrap();
    f.assign(q, value).unwrap();
    f.ret(None).unwrap();
    f.finish().unwrap();

    let program = module.finish().unwrap();
    let instrs = real_instrs(&program, "copy");
    let (r0, r1, r2) = (AsmReg::int(0), AsmReg::int(1), AsmReg::int(2));
    let slot = StackSlot::frame(FrameId(0), 8);

    let start = instrs
        .iter()
        .position(|i| *i == Instr::Mov { dst: r1, src: r0 })
        .expect("pointer is copied before it is advanced");
    assert_eq!(
        &instrs[start + 1..start + 6],
        &[
            Instr::LoadPtr {
                dst: r2,
                ptr: r1,
                size: 8
            },
            Instr::StoreStack {
                src: r2,
                slot,
                size: 8
            },
            Instr::AluImm {
                op: AluOp::Add,
                dst: r1,
                imm: Imm::Value(8)
            },
            Instr::LoadPtr {
                dst: r2,
                ptr: r1,
                size: 8
            },
            Instr::StoreStack {
                src: r2,
                slot: slot.advanced(8),
                size: 8
            },
        ]
    );
    match &instrs[start + 6] {
        Instr::CopyStack { dst, src, size } => {
            assert_eq!(*src, slot);
            assert_ne!(*dst, slot);
            assert_eq!(*size, 16);
        }
        other => panic!("expected the assignment copy, got {other}"),
    }
}

#[test]
fn test_store_through_pointer() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new(&session, options(), "store.v");

    // fn set(p: *u32, v: u32) { *p = v; }
    let set = module
        .declare_function(
            "set",
            Signature::new(vec![Type::pointer_to(Type::u32()), Type::u32()], Type::void()),
            Linkage::Internal,
            1,
        )
        .unwrap();
    let mut f = module.define_function(set, &["p", "v"], 1).unwrap();
    let p = f.param(0).unwrap();
    let v = f.param(1).unwrap();
    f.at(2).store(p, v).unwrap();
    f.ret(None).unwrap();
    f.finish().unwrap();

    let program = module.finish().unwrap();
    let instrs = real_instrs(&program, "set");
    assert!(instrs.contains(&Instr::StorePtr {
        ptr: AsmReg::int(0),
        src: AsmReg::int(1),
        size: 4
    }));
}

#[test]
fn test_store_through_const_pointer_is_rejected() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new(&session, options(), "const.v");

    let set = module
        .declare_function(
            "set",
            Signature::new(vec![Type::pointer_to(Type::u32().constant())], Type::void()),
            Linkage::Internal,
            1,
        )
        .unwrap();
    let mut f = module.define_function(set, &["p"], 1).unwrap();
    let p = f.param(0).unwrap();
    let zero = f.constant(Type::u32(), 0).unwrap();
    let err = f.at(4).store(p, zero).unwrap_err();
    assert!(matches!(err, CompileError::User { .. }));
    assert_eq!(err.location().map(|loc| loc.line), Some(4));
}

#[test]
fn test_member_offsets_pointer() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new(&session, options(), "member.v");

    // fn second(p: *Pair) -> u64 { return p->b; }
    let second = module
        .declare_function(
            "second",
            Signature::new(vec![Type::pointer_to(pair())], Type::u64()),
            Linkage::Internal,
            1,
        )
        .unwrap();
    let mut f = module.define_function(second, &["p"], 1).unwrap();
    let p = f.param(0).unwrap();
    let field = f.at(2).member(p, "b").unwrap();
    let value = f.dereference(field).unwrap();
    f.ret(Some(value)).unwrap();
    f.finish().unwrap();

    let program = module.finish().unwrap();
    let instrs = real_instrs(&program, "second");
    let add = instrs
        .iter()
        .position(|i| {
            matches!(
                i,
                Instr::AluImm {
                    op: AluOp::Add,
                    imm: Imm::Value(8),
                    ..
                }
            )
        })
        .expect("field offset is added");
    let Instr::AluImm { dst: field_reg, .. } = instrs[add] else {
        unreachable!()
    };
    // The parameter itself is left alone.
    assert_ne!(field_reg, AsmReg::int(0));
    assert!(instrs[add + 1..].iter().any(|i| matches!(
        i,
        Instr::LoadPtr { ptr, size: 8, .. } if *ptr == field_reg
    )));

    // Unknown fields are reported.
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new(&session, options(), "member.v");
    let bad = module
        .declare_function(
            "bad",
            Signature::new(vec![Type::pointer_to(pair())], Type::void()),
            Linkage::Internal,
            1,
        )
        .unwrap();
    let mut f = module.define_function(bad, &["p"], 1).unwrap();
    let p = f.param(0).unwrap();
    let err = f.at(3).member(p, "c").unwrap_err();
    assert!(err.to_string().contains("no field `c`"), "{err}");
}

#[test]
fn test_static_is_written_back_on_exit() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new(&session, options(), "static.v");

    // static counter: u64; fn bump() { counter += 1; }
    let counter = module.declare_static("counter", Type::u64(), 1).unwrap();
    let bump = module
        .declare_function("bump", Signature::new(vec![], Type::void()), Linkage::Internal, 2)
        .unwrap();
    let mut f = module.define_function(bump, &[], 2).unwrap();
    let one = f.at(3).constant(Type::u64(), 1).unwrap();
    f.binary_to_self(BinaryOp::Add, counter, one).unwrap();
    f.ret(None).unwrap();
    f.finish().unwrap();

    let program = module.finish().unwrap();
    assert_eq!(program.layout.static_size, 8);

    let instrs = real_instrs(&program, "bump");
    let stack_base = |i: &Instr<'_>| {
        matches!(
            i,
            Instr::RuntimeParam {
                param: RuntimeParameter::StackBase,
                ..
            }
        )
    };
    let load = instrs
        .iter()
        .position(|i| matches!(i, Instr::LoadPtr { size: 8, .. }))
        .expect("counter is loaded");
    let store = instrs
        .iter()
        .position(|i| matches!(i, Instr::StorePtr { size: 8, .. }))
        .expect("counter is written back");
    assert!(load < store);
    assert!(instrs[..load].iter().any(stack_base));
    assert!(instrs[load..store].iter().any(stack_base));
    assert!(instrs[load..store].contains(&Instr::AluImm {
        op: AluOp::Add,
        dst: AsmReg::int(0),
        imm: Imm::Value(1)
    }));
}

#[test]
fn test_read_only_data_lives_after_code() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new(&session, options(), "data.v");

    // fn first() -> u8 { return *(&"hi!" as *u8); }
    let first = module
        .declare_function("first", Signature::new(vec![], Type::u8()), Linkage::Internal, 1)
        .unwrap();
    let mut f = module.define_function(first, &[], 1).unwrap();
    let text = f.at(2).data(Type::u8(), b"hi!").unwrap();

    // Read-only data cannot be assigned.
    let zero = f.constant(Type::u8(), 0).unwrap();
    let err = f.assign(text, zero).unwrap_err();
    assert!(matches!(err, CompileError::User { .. }));

    let address = f.address_of(text).unwrap();
    let bytes = f.convert(address, Type::pointer_to(Type::u8())).unwrap();
    let value = f.dereference(bytes).unwrap();
    f.ret(Some(value)).unwrap();
    f.finish().unwrap();

    let program = module.finish().unwrap();
    assert_eq!(program.blobs.len(), 1);
    assert_eq!(program.blobs[0].1, b"hi!\0\0\0\0\0");

    let instrs = real_instrs(&program, "first");
    let id = ConstId(0);
    let base = instrs
        .iter()
        .position(|i| {
            matches!(
                i,
                Instr::RuntimeParam {
                    param: RuntimeParameter::CodeBase,
                    ..
                }
            )
        })
        .expect("code base is read");
    assert!(matches!(
        instrs[base + 1],
        Instr::AluImm {
            op: AluOp::Add,
            imm: Imm::ConstantAddress(c),
            ..
        } if c == id
    ));
    assert!(instrs
        .iter()
        .any(|i| matches!(i, Instr::LoadPtr { size: 1, .. })));
    assert!(instrs.iter().any(|i| matches!(i, Instr::Mask { size: 1, .. })));

    let image = program.assemble().unwrap();
    let offset = image.constant_offset(id).expect("blob is laid out");
    assert_eq!(image.len(), offset + 8);
    assert_eq!(&image.code[offset..offset + 3], b"hi!");

    let decoded = disassemble(&image.code, offset).unwrap();
    assert!(decoded.iter().any(|d| d.opcode == Opcode::AddImm
        && d.operands.last() == Some(&DecodedOperand::Imm(offset as u64))));
}

#[test]
fn test_equal_data_literals_get_separate_homes() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new(&session, options(), "twice.v");

    // fn both() -> u8 { a = "hi"; b = "hi"; return *(&a as *u8) + *(&b as *u8); }
    let both = module
        .declare_function("both", Signature::new(vec![], Type::u8()), Linkage::Internal, 1)
        .unwrap();
    let mut f = module.define_function(both, &[], 1).unwrap();
    let a = f.at(2).data(Type::u8(), b"hi").unwrap();
    let b = f.at(3).data(Type::u8(), b"hi").unwrap();
    let mut loaded = Vec::new();
    for text in [a, b] {
        let address = f.address_of(text).unwrap();
        let bytes = f.convert(address, Type::pointer_to(Type::u8())).unwrap();
        loaded.push(f.dereference(bytes).unwrap());
    }
    let sum = f.at(4).binary(BinaryOp::Add, loaded[0], loaded[1]).unwrap();
    f.ret(Some(sum)).unwrap();
    f.finish().unwrap();

    let program = module.finish().unwrap();
    assert_eq!(program.blobs.len(), 2);
    let (first, second) = (program.blobs[0], program.blobs[1]);
    assert_ne!(first.0, second.0);
    assert_eq!(first.1, second.1);

    // Each literal is addressed through its own blob.
    let instrs = real_instrs(&program, "both");
    for id in [first.0, second.0] {
        assert!(instrs.iter().any(|i| matches!(
            i,
            Instr::AluImm {
                imm: Imm::ConstantAddress(c),
                ..
            } if *c == id
        )));
    }

    let image = program.assemble().unwrap();
    let a_offset = image.constant_offset(first.0).unwrap();
    let b_offset = image.constant_offset(second.0).unwrap();
    assert_eq!(b_offset, a_offset + 8);
    assert_eq!(image.len(), b_offset + 8);
}

#[test]
fn test_oversized_local_is_a_located_error() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new(&session, options(), "huge.v");

    // fn first() -> u8 { huge: [u8; 8 GiB]; return *(&huge as *u8); }
    let first = module
        .declare_function("first", Signature::new(vec![], Type::u8()), Linkage::Internal, 1)
        .unwrap();
    let mut f = module.define_function(first, &[], 1).unwrap();
    let huge = f
        .at(2)
        .variable(Type::array_of(Type::u8(), 1 << 33), "huge")
        .unwrap();
    let address = f.at(3).address_of(huge).unwrap();
    let bytes = f.convert(address, Type::pointer_to(Type::u8())).unwrap();
    let value = f.dereference(bytes).unwrap();
    f.ret(Some(value)).unwrap();
    f.finish().unwrap();

    let err = module.finish().map(|_| ()).unwrap_err();
    assert!(matches!(err, CompileError::User { .. }), "{err}");
    assert_eq!(err.location().map(|loc| loc.line), Some(3));
    assert!(err.to_string().contains("stack frame"), "{err}");
}
