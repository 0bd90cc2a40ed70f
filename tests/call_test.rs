//! Test call lowering: internal calls, wide returns, external calls
//! and calls through function pointers.

use bumpalo::Bump;
use vmgen::core::{
    AsmReg, CodegenOptions, CompilationSession, FrameId, Signature, StackSlot, StructLayout, Type,
};
use vmgen::ir::{BinaryOp, Linkage, Module};
use vmgen::vm::{disassemble, AluOp, DecodedOperand, Imm, Instr, Opcode, RuntimeParameter, StackAmount};
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

fn position_of(instrs: &[Instr<'_>], wanted: &Instr<'_>) -> usize {
    instrs
        .iter()
        .position(|i| i == wanted)
        .unwrap_or_else(|| panic!("{wanted} not found in {instrs:?}"))
}

#[test]
fn test_call_spills_and_places_arguments() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new(&session, options(), "call.v");

    // fn add3(a: i64, b: i32, c: i64) -> i64 { return a; }
    let add3 = module
        .declare_function(
            "add3",
            Signature::new(vec![Type::i64(), Type::i32(), Type::i64()], Type::i64()),
            Linkage::Internal,
            1,
        )
        .unwrap();
    let main = module
        .declare_function("main", Signature::new(vec![], Type::i64()), Linkage::Internal, 5)
        .unwrap();

    let mut f = module.define_function(add3, &["a", "b", "c"], 1).unwrap();
    let a = f.param(0).unwrap();
    f.at(2).ret(Some(a)).unwrap();
    f.finish().unwrap();

    // fn main() -> i64 { x: i64 = 1; r: i64 = add3(x, 2, 3); return r; }
    let mut f = module.define_function(main, &[], 5).unwrap();
    let x = f.at(6).variable(Type::i64(), "x").unwrap();
    let one = f.constant(Type::i64(), 1).unwrap();
    f.assign(x, one).unwrap();
    let two = f.at(7).constant(Type::i64(), 2).unwrap();
    let three = f.constant(Type::i64(), 3).unwrap();
    let r = f.call(add3, &[x, two, three]).unwrap().unwrap();
    f.at(8).ret(Some(r)).unwrap();
    f.finish().unwrap();

    let program = module.finish().unwrap();
    let start = program.functions[0].start;

    // The callee leaves `a` where it arrived.
    let frame0 = FrameId(0);
    assert_eq!(
        real_instrs(&program, "add3"),
        vec![
            Instr::StackAdjust(StackAmount::FrameEnter(frame0)),
            Instr::StackAdjust(StackAmount::FrameLeave(frame0)),
            Instr::Ret,
        ]
    );

    let frame1 = FrameId(1);
    let home = StackSlot::frame(frame1, 8);
    let (r0, r1, r2) = (AsmReg::int(0), AsmReg::int(1), AsmReg::int(2));
    let instrs = real_instrs(&program, "main");

    let init = position_of(&instrs, &Instr::MovImm { dst: r0, imm: Imm::Value(1) });
    let spill = position_of(&instrs, &Instr::StoreStack { src: r0, slot: home, size: 8 });
    let third = position_of(&instrs, &Instr::MovImm { dst: r2, imm: Imm::Value(3) });
    let second = position_of(&instrs, &Instr::MovImm { dst: r1, imm: Imm::Value(2) });
    let narrow = position_of(&instrs, &Instr::SignExtend { reg: r1, size: 4 });
    let reload = position_of(&instrs, &Instr::LoadStack { dst: r0, slot: home, size: 8 });
    let call = position_of(&instrs, &Instr::Call(start));

    // x is written back before the call, arguments go in back to front.
    assert!(init < spill);
    assert!(spill < third);
    assert!(third < second);
    assert!(second < narrow);
    assert!(narrow < reload);
    assert!(reload < call);
    assert_eq!(
        &instrs[call + 1..],
        &[
            Instr::StackAdjust(StackAmount::FrameLeave(frame1)),
            Instr::Ret,
        ]
    );

    let stats = session.stats();
    assert_eq!(stats.calls_lowered, 1);
    assert_eq!(stats.operation_counts.get("call"), Some(&1));
}

#[test]
fn test_call_displacement_reaches_callee() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new(&session, options(), "disp.v");

    let callee = module
        .declare_function("callee", Signature::new(vec![], Type::void()), Linkage::Internal, 1)
        .unwrap();
    let main = module
        .declare_function("main", Signature::new(vec![], Type::void()), Linkage::Internal, 3)
        .unwrap();

    let mut f = module.define_function(callee, &[], 1).unwrap();
    f.ret(None).unwrap();
    f.finish().unwrap();

    let mut f = module.define_function(main, &[], 3).unwrap();
    assert!(f.call(callee, &[]).unwrap().is_none());
    f.ret(None).unwrap();
    f.finish().unwrap();

    let program = module.finish().unwrap();
    let image = program.assemble().unwrap();
    let target = image
        .label_offset(program.functions[0].start)
        .expect("callee start is placed");

    let decoded = disassemble(&image.code, image.len()).unwrap();
    let calls: Vec<_> = decoded.iter().filter(|d| d.opcode == Opcode::Call).collect();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].branch_target(), Some(target));
}

#[test]
fn test_wide_return_goes_through_memory() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new(&session, options(), "pair.v");

    let layout = StructLayout::new(
        "Pair",
        vec![("a".to_string(), Type::u64()), ("b".to_string(), Type::u64())],
    );
    let pair = Type::structure(layout);

    // fn make(src: *Pair) -> Pair { return *src; }
    let make = module
        .declare_function(
            "make",
            Signature::new(vec![Type::pointer_to(pair.clone())], pair.clone()),
            Linkage::Internal,
            1,
        )
        .unwrap();
    let main = module
        .declare_function("main", Signature::new(vec![], Type::void()), Linkage::Internal, 4)
        .unwrap();
    let g = module.declare_static("g", pair.clone(), 4).unwrap();

    let mut f = module.define_function(make, &["src"], 1).unwrap();
    let src = f.param(0).unwrap();
    let value = f.at(2).dereference(src).unwrap();
    f.ret(Some(value)).unwrap();
    f.finish().unwrap();

    // fn main() { p: Pair = make(&g); }
    let mut f = module.define_function(main, &[], 4).unwrap();
    let p = f.at(5).variable(pair.clone(), "p").unwrap();
    let address = f.address_of(g).unwrap();
    let result = f.call(make, &[address]).unwrap().unwrap();
    f.assign(p, result).unwrap();
    f.ret(None).unwrap();
    f.finish().unwrap();

    let program = module.finish().unwrap();

    // Callee: two chunked loads, then a block copy through the return pointer.
    let callee = real_instrs(&program, "make");
    let loads = callee
        .iter()
        .filter(|i| matches!(i, Instr::LoadPtr { size: 8, .. }))
        .count();
    assert_eq!(loads, 2);
    assert!(callee.iter().any(|i| matches!(
        i,
        Instr::AluImm {
            op: AluOp::Add,
            imm: Imm::Value(8),
            ..
        }
    )));
    let return_pointer = StackSlot::frame(FrameId(0), 8);
    let read_pointer = callee
        .iter()
        .position(|i| matches!(i, Instr::LoadStack { slot, .. } if *slot == return_pointer))
        .expect("return pointer is read");
    let copy = callee
        .iter()
        .position(|i| matches!(i, Instr::CopyMem { size: 16, .. }))
        .expect("result is block-copied");
    assert!(read_pointer < copy);

    // Caller: the buffer address goes into the outgoing return pointer slot.
    let caller = real_instrs(&program, "main");
    assert!(caller.iter().any(|i| matches!(
        i,
        Instr::RuntimeParam {
            param: RuntimeParameter::StackBase,
            ..
        }
    )));
    let lea = caller
        .iter()
        .position(|i| matches!(i, Instr::LeaStack { .. }))
        .expect("buffer address is taken");
    match (&caller[lea], &caller[lea + 1]) {
        (Instr::LeaStack { dst, .. }, Instr::StoreStack { src, slot, size }) => {
            assert_eq!(dst, src);
            assert_eq!(*slot, StackSlot::outgoing(8));
            assert_eq!(*size, 8);
        }
        other => panic!("unexpected return buffer setup {other:?}"),
    }
    let call = position_of(&caller, &Instr::Call(program.functions[0].start));
    let copy = caller
        .iter()
        .position(|i| matches!(i, Instr::CopyStack { size: 16, .. }))
        .expect("result is copied into p");
    assert!(lea < call && call < copy);
}

#[test]
fn test_external_call_pushes_tagged_arguments() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new(&session, options(), "host.v");

    let print = module
        .declare_function(
            "print",
            Signature::new(vec![Type::i64(), Type::f64()], Type::void()),
            Linkage::External { handle: 7 },
            1,
        )
        .unwrap();
    let main = module
        .declare_function("main", Signature::new(vec![], Type::void()), Linkage::Internal, 2)
        .unwrap();

    let mut f = module.define_function(main, &[], 2).unwrap();
    let one = f.constant(Type::i64(), 1).unwrap();
    let half = f.float_constant(Type::f64(), 1.5).unwrap();
    assert!(f.call(print, &[one, half]).unwrap().is_none());
    f.ret(None).unwrap();
    f.finish().unwrap();

    let program = module.finish().unwrap();
    assert!(program.function_instrs("print").is_none());

    let (r0, f0) = (AsmReg::int(0), AsmReg::float(0));
    let frame = FrameId(0);
    assert_eq!(
        real_instrs(&program, "main"),
        vec![
            Instr::StackAdjust(StackAmount::FrameEnter(frame)),
            Instr::MovImm {
                dst: r0,
                imm: Imm::Value(1)
            },
            Instr::MovImm {
                dst: f0,
                imm: Imm::Value(1.5f64.to_bits())
            },
            Instr::PushImm(7),
            Instr::PushImm(0),
            Instr::PushImm(0),
            Instr::Push(f0),
            Instr::PushImm(2),
            Instr::Push(r0),
            Instr::PushImm(1),
            Instr::CallExternal { dst: r0 },
            Instr::StackAdjust(StackAmount::FrameLeave(frame)),
            Instr::Ret,
        ]
    );
}

#[test]
fn test_external_float_result_lands_in_f0() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new(&session, options(), "sqrt.v");

    let sqrt = module
        .declare_function(
            "sqrt",
            Signature::new(vec![Type::f64()], Type::f64()),
            Linkage::External { handle: 3 },
            1,
        )
        .unwrap();
    let main = module
        .declare_function("main", Signature::new(vec![], Type::f64()), Linkage::Internal, 2)
        .unwrap();

    let mut f = module.define_function(main, &[], 2).unwrap();
    let four = f.float_constant(Type::f64(), 4.0).unwrap();
    let root = f.call(sqrt, &[four]).unwrap().unwrap();
    f.ret(Some(root)).unwrap();
    f.finish().unwrap();

    let program = module.finish().unwrap();
    let instrs = real_instrs(&program, "main");
    let f0 = AsmReg::float(0);
    let call = position_of(&instrs, &Instr::CallExternal { dst: f0 });
    assert_eq!(
        &instrs[call - 5..call],
        &[
            Instr::PushImm(3),
            Instr::PushImm(1),
            Instr::PushImm(0),
            Instr::Push(f0),
            Instr::PushImm(2),
        ]
    );
    // The result is already in the return register.
    assert!(!instrs[call..].iter().any(|i| matches!(i, Instr::Mov { .. })));
}

#[test]
fn test_external_declaration_errors() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new(&session, options(), "bad.v");

    let layout = StructLayout::new(
        "Pair",
        vec![("a".to_string(), Type::u64()), ("b".to_string(), Type::u64())],
    );
    let err = module
        .declare_function(
            "take",
            Signature::new(vec![Type::structure(layout)], Type::void()),
            Linkage::External { handle: 1 },
            3,
        )
        .unwrap_err();
    assert!(matches!(err, CompileError::User { .. }));
    assert!(err.to_string().contains("bad.v:3"), "{err}");

    let many = vec![Type::i64(); 13];
    let err = module
        .declare_function(
            "wide",
            Signature::new(many, Type::void()),
            Linkage::External { handle: 2 },
            4,
        )
        .unwrap_err();
    assert!(matches!(err, CompileError::User { .. }));
}

#[test]
fn test_indirect_call_through_function_address() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new(&session, options(), "ptr.v");

    // fn inc(x: i64) -> i64 { return x + 1; }
    let inc = module
        .declare_function(
            "inc",
            Signature::new(vec![Type::i64()], Type::i64()),
            Linkage::Internal,
            1,
        )
        .unwrap();
    let main = module
        .declare_function("main", Signature::new(vec![], Type::i64()), Linkage::Internal, 3)
        .unwrap();

    let mut f = module.define_function(inc, &["x"], 1).unwrap();
    let x = f.param(0).unwrap();
    let one = f.constant(Type::i64(), 1).unwrap();
    let sum = f.binary(BinaryOp::Add, x, one).unwrap();
    f.ret(Some(sum)).unwrap();
    f.finish().unwrap();

    let mut f = module.define_function(main, &[], 3).unwrap();
    let fp = f.function_address(inc).unwrap();
    let arg = f.constant(Type::i64(), 41).unwrap();
    let r = f.call_indirect(fp, &[arg]).unwrap().unwrap();
    f.ret(Some(r)).unwrap();
    f.finish().unwrap();

    let program = module.finish().unwrap();
    let start = program.functions[0].start;
    let instrs = real_instrs(&program, "main");

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
            imm: Imm::LabelAddress(label),
            ..
        } if label == start
    ));
    assert!(instrs.iter().any(|i| matches!(i, Instr::CallPtr(_))));
    assert!(instrs
        .iter()
        .any(|i| *i == Instr::MovImm { dst: AsmReg::int(0), imm: Imm::Value(41) }));

    // The label address resolves to the callee's offset in the image.
    let image = program.assemble().unwrap();
    let target = image.label_offset(start).unwrap() as u64;
    let decoded = disassemble(&image.code, image.len()).unwrap();
    let add = decoded
        .iter()
        .find(|d| d.opcode == Opcode::AddImm && d.operands.last() == Some(&DecodedOperand::Imm(target)));
    assert!(add.is_some(), "no addi of {target} in image");
}

#[test]
fn test_function_pointer_cannot_be_dereferenced() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new(&session, options(), "fnty.v");

    let callback = Type::pointer_to(Type::function(Signature::new(vec![], Type::void())));
    let main = module
        .declare_function("main", Signature::new(vec![], Type::void()), Linkage::Internal, 1)
        .unwrap();
    let mut f = module.define_function(main, &[], 1).unwrap();
    let cb = f.at(2).variable(callback.clone(), "cb").unwrap();
    let null = f.constant(callback, 0).unwrap();
    f.assign(cb, null).unwrap();

    let err = f.at(3).dereference(cb).unwrap_err();
    assert!(matches!(err, CompileError::User { .. }));
    assert!(err.to_string().contains("fnty.v:3"), "{err}");

    // Calling through it is fine.
    assert!(f.call_indirect(cb, &[]).unwrap().is_none());
}

#[test]
fn test_overflow_arguments_use_the_stack() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new(&session, options(), "many.v");

    // fn last(a..g: i64) -> i64 { return g; }
    let params = vec![Type::i64(); 7];
    let last = module
        .declare_function("last", Signature::new(params, Type::i64()), Linkage::Internal, 1)
        .unwrap();
    let main = module
        .declare_function("main", Signature::new(vec![], Type::i64()), Linkage::Internal, 3)
        .unwrap();

    let mut f = module
        .define_function(last, &["a", "b", "c", "d", "e", "f", "g"], 1)
        .unwrap();
    let g = f.param(6).unwrap();
    f.ret(Some(g)).unwrap();
    f.finish().unwrap();

    let mut f = module.define_function(main, &[], 3).unwrap();
    let args: Vec<_> = (1..=7).map(|i| f.constant(Type::i64(), i).unwrap()).collect();
    let r = f.call(last, &args).unwrap().unwrap();
    f.ret(Some(r)).unwrap();
    f.finish().unwrap();

    let program = module.finish().unwrap();

    // The seventh argument is stored into the outgoing area past the header.
    let caller = real_instrs(&program, "main");
    assert!(caller.iter().any(|i| matches!(
        i,
        Instr::StoreStack { slot, size: 8, .. } if *slot == StackSlot::outgoing(8)
    )));
    for id in 0..6u8 {
        assert!(
            caller
                .iter()
                .any(|i| *i == Instr::MovImm { dst: AsmReg::int(id), imm: Imm::Value(id as u64 + 1) }),
            "argument {id} not in r{id}"
        );
    }

    // The callee reads it from its own frame.
    let callee = real_instrs(&program, "last");
    assert!(callee.iter().any(|i| matches!(
        i,
        Instr::LoadStack { dst, slot, .. } if *dst == AsmReg::int(0) && *slot == StackSlot::frame(FrameId(0), 8)
    )));
}
