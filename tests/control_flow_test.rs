//! Test labels, jumps and conditional branches, including the encoded
//! displacement of jumps in the assembled image.

use bumpalo::Bump;
use vmgen::core::{AsmReg, CodegenOptions, CompilationSession, FrameId, Signature, StackSlot, Type};
use vmgen::ir::{BinaryOp, CompareOp, Linkage, Module, UnaryOp};
use vmgen::vm::{disassemble, Cond, DecodedOperand, Imm, Instr, Opcode};
use vmgen::{CompileError, LoweredProgram};

fn options() -> CodegenOptions {
    CodegenOptions {
        emit_debug_locations: false,
        emit_comments: false,
        verify: true,
        ..CodegenOptions::default()
    }
}

fn all_instrs<'s>(program: &LoweredProgram<'s>, name: &str) -> Vec<Instr<'s>> {
    program
        .function_instrs(name)
        .expect("function was lowered")
        .to_vec()
}

#[test]
fn test_jump_writes_back_and_skips() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new(&session, options(), "jump.v");

    // fn main() -> i64 { x = 1; goto end; x = 2; end: return x; }
    let main = module
        .declare_function("main", Signature::new(vec![], Type::i64()), Linkage::Internal, 1)
        .unwrap();
    let mut f = module.define_function(main, &[], 1).unwrap();
    let x = f.at(2).variable(Type::i64(), "x").unwrap();
    let one = f.constant(Type::i64(), 1).unwrap();
    f.assign(x, one).unwrap();
    let end = f.new_label();
    f.at(3).jump(end);
    let two = f.at(4).constant(Type::i64(), 2).unwrap();
    f.assign(x, two).unwrap();
    f.at(5).place_label(end).unwrap();
    f.ret(Some(x)).unwrap();
    f.finish().unwrap();

    let program = module.finish().unwrap();
    let instrs = all_instrs(&program, "main");
    let r0 = AsmReg::int(0);
    let home = StackSlot::frame(FrameId(0), 8);

    let jump = instrs
        .iter()
        .position(|i| *i == Instr::Jump(end))
        .expect("jump is emitted");
    let label = instrs
        .iter()
        .position(|i| *i == Instr::Label(end))
        .expect("label is placed");
    let store = Instr::StoreStack {
        src: r0,
        slot: home,
        size: 8,
    };
    // Both paths into `end` leave x in its home.
    assert_eq!(instrs[jump - 1], store);
    assert_eq!(instrs[label - 1], store);
    assert_eq!(
        instrs[label + 1],
        Instr::LoadStack {
            dst: r0,
            slot: home,
            size: 8
        }
    );

    let image = program.assemble().unwrap();
    let target = image.label_offset(end).expect("label has an offset");
    let decoded = disassemble(&image.code, image.len()).unwrap();
    let jmp = decoded
        .iter()
        .find(|d| d.opcode == Opcode::Jmp)
        .expect("jmp is encoded");
    assert_eq!(jmp.branch_target(), Some(target));
    let rel = target as i64 - (jmp.offset + jmp.size()) as i64;
    assert_eq!(jmp.operands.last(), Some(&DecodedOperand::Imm(rel as u64)));
    assert!(rel > 0);
}

#[test]
fn test_branch_flushes_but_keeps_fallthrough_registers() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new(&session, options(), "abs.v");

    // fn abs(x: i64) -> i64 { if x < 0 goto neg; return x; neg: return -x; }
    let abs = module
        .declare_function(
            "abs",
            Signature::new(vec![Type::i64()], Type::i64()),
            Linkage::Internal,
            1,
        )
        .unwrap();
    let mut f = module.define_function(abs, &["x"], 1).unwrap();
    let x = f.param(0).unwrap();
    let zero = f.at(2).constant(Type::i64(), 0).unwrap();
    let negative = f.compare(CompareOp::Lt, x, zero).unwrap();
    let neg = f.new_label();
    f.branch(negative, neg, true, false).unwrap();
    f.at(3).ret(Some(x)).unwrap();
    f.at(4).place_label(neg).unwrap();
    let minus = f.unary(UnaryOp::Neg, x).unwrap();
    f.ret(Some(minus)).unwrap();
    f.finish().unwrap();

    let program = module.finish().unwrap();
    let instrs = all_instrs(&program, "abs");
    let (r0, r1) = (AsmReg::int(0), AsmReg::int(1));
    let home = StackSlot::frame(FrameId(0), 8);

    assert!(instrs.contains(&Instr::CmpImm {
        lhs: r1,
        imm: 0,
        cond: Cond::LtS
    }));
    let branch = instrs
        .iter()
        .position(|i| {
            *i == Instr::JumpIf {
                reg: r1,
                target: neg,
                when_nonzero: true,
            }
        })
        .expect("branch is emitted");
    assert_eq!(
        instrs[branch - 1],
        Instr::StoreStack {
            src: r0,
            slot: home,
            size: 8
        }
    );
    // x is still in r0 on the fall-through path: the early return only jumps.
    assert!(matches!(instrs[branch + 1], Instr::Jump(_)));

    let label = instrs
        .iter()
        .position(|i| *i == Instr::Label(neg))
        .expect("label is placed");
    assert_eq!(
        &instrs[label + 1..label + 3],
        &[
            Instr::LoadStack {
                dst: r0,
                slot: home,
                size: 8
            },
            Instr::Neg(r0),
        ]
    );

    let image = program.assemble().unwrap();
    let target = image.label_offset(neg).unwrap();
    let decoded = disassemble(&image.code, image.len()).unwrap();
    let jnz = decoded
        .iter()
        .find(|d| d.opcode == Opcode::Jnz)
        .expect("jnz is encoded");
    assert_eq!(jnz.branch_target(), Some(target));
}

fn live_across_branch<'s>(
    session: &'s CompilationSession<'s>,
    spill_all: bool,
) -> Result<Vec<Instr<'s>>, CompileError> {
    let mut module = Module::new(session, options(), "live.v");

    // fn f(x: i64) -> i64 { t = x + 1; if x > 0 goto done; done: return t; }
    let func = module
        .declare_function(
            "f",
            Signature::new(vec![Type::i64()], Type::i64()),
            Linkage::Internal,
            1,
        )
        .unwrap();
    let mut f = module.define_function(func, &["x"], 1).unwrap();
    let x = f.param(0).unwrap();
    let one = f.at(2).constant(Type::i64(), 1).unwrap();
    let t = f.binary(BinaryOp::Add, x, one).unwrap();
    let zero = f.at(3).constant(Type::i64(), 0).unwrap();
    let positive = f.compare(CompareOp::Gt, x, zero).unwrap();
    let done = f.new_label();
    f.branch(positive, done, true, spill_all).unwrap();
    f.at(4).place_label(done).unwrap();
    f.ret(Some(t)).unwrap();
    f.finish().unwrap();

    let program = module.finish()?;
    Ok(all_instrs(&program, "f"))
}

#[test]
fn test_temporary_across_label_needs_spill_all() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let err = live_across_branch(&session, false).unwrap_err();
    assert!(matches!(err, CompileError::Internal { .. }), "{err}");
    assert!(err.is_internal());

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let instrs = live_across_branch(&session, true).unwrap();
    let (r0, r1) = (AsmReg::int(0), AsmReg::int(1));
    let branch = instrs
        .iter()
        .position(|i| matches!(i, Instr::JumpIf { .. }))
        .expect("branch is emitted");
    let slot = instrs[..branch]
        .iter()
        .find_map(|i| match i {
            Instr::StoreStack { src, slot, .. } if *src == r1 => Some(*slot),
            _ => None,
        })
        .expect("t is spilled before the branch");
    assert!(instrs[branch + 1..].contains(&Instr::LoadStack {
        dst: r0,
        slot,
        size: 8
    }));
    assert!(instrs.contains(&Instr::AluImm {
        op: vmgen::vm::AluOp::Add,
        dst: r1,
        imm: Imm::Value(1)
    }));
}

#[test]
fn test_label_errors_are_reported() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new(&session, options(), "labels.v");

    let main = module
        .declare_function("main", Signature::new(vec![], Type::void()), Linkage::Internal, 1)
        .unwrap();
    let mut f = module.define_function(main, &[], 1).unwrap();
    let placed = f.new_label();
    f.at(2).place_label(placed).unwrap();
    let err = f.at(3).place_label(placed).unwrap_err();
    assert!(matches!(err, CompileError::User { .. }));

    let missing = f.new_label();
    f.at(4).jump(missing);
    f.ret(None).unwrap();
    let err = f.finish().unwrap_err();
    assert!(matches!(err, CompileError::User { .. }));
    assert_eq!(err.location().map(|loc| loc.line), Some(4));
    assert!(err.to_string().contains("never placed"), "{err}");
}
