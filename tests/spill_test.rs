//! Test register pressure: more live temporaries than registers.

use bumpalo::Bump;
use vmgen::core::{CodegenOptions, CompilationSession, Signature, Type};
use vmgen::ir::{BinaryOp, Linkage, Module};
use vmgen::vm::Instr;

fn options() -> CodegenOptions {
    CodegenOptions {
        emit_debug_locations: false,
        emit_comments: false,
        verify: true,
        ..CodegenOptions::default()
    }
}

#[test]
fn test_seventeen_live_temporaries_spill() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new(&session, options(), "pressure.v");

    // fn sum(n: u64) -> u64 { t1 = n + 1; ... t17 = n + 17; return t1 + ... + t17; }
    let sum = module
        .declare_function(
            "sum",
            Signature::new(vec![Type::u64()], Type::u64()),
            Linkage::Internal,
            1,
        )
        .unwrap();
    let mut f = module.define_function(sum, &["n"], 1).unwrap();
    let n = f.param(0).unwrap();
    let mut temps = Vec::new();
    for i in 1..=17 {
        let c = f.at(1 + i as u32).constant(Type::u64(), i).unwrap();
        temps.push(f.binary(BinaryOp::Add, n, c).unwrap());
    }
    let mut acc = f.at(20).binary(BinaryOp::Add, temps[0], temps[1]).unwrap();
    for &t in &temps[2..] {
        acc = f.binary(BinaryOp::Add, acc, t).unwrap();
    }
    f.ret(Some(acc)).unwrap();
    f.finish().unwrap();

    let program = module.finish().unwrap();
    let stats = session.stats();
    assert!(stats.spills_generated >= 1, "{stats}");
    assert_eq!(stats.operation_counts.get("binary"), Some(&33));

    // Something stored under pressure is read back later from the same slot.
    let instrs = program.function_instrs("sum").unwrap();
    let reloaded = instrs.iter().enumerate().any(|(i, instr)| match instr {
        Instr::StoreStack { slot, .. } => instrs[i + 1..]
            .iter()
            .any(|later| matches!(later, Instr::LoadStack { slot: s, .. } if s == slot)),
        _ => false,
    });
    assert!(reloaded);

    // Every addition still happens.
    let adds = instrs
        .iter()
        .filter(|i| matches!(i, Instr::Alu { .. } | Instr::AluImm { .. }))
        .count();
    assert!(adds >= 33);

    let image = program.assemble().unwrap();
    assert!(!image.is_empty());
}

#[test]
fn test_float_pressure_spills_float_bank() {
    let _ = env_logger::builder().is_test(true).try_init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new(&session, options(), "fpressure.v");

    let sum = module
        .declare_function(
            "fsum",
            Signature::new(vec![Type::f64()], Type::f64()),
            Linkage::Internal,
            1,
        )
        .unwrap();
    let mut f = module.define_function(sum, &["x"], 1).unwrap();
    let x = f.param(0).unwrap();
    let mut temps = Vec::new();
    for i in 1..=17 {
        let c = f.float_constant(Type::f64(), i as f64).unwrap();
        temps.push(f.binary(BinaryOp::Mul, x, c).unwrap());
    }
    let mut acc = f.binary(BinaryOp::Add, temps[0], temps[1]).unwrap();
    for &t in &temps[2..] {
        acc = f.binary(BinaryOp::Add, acc, t).unwrap();
    }
    f.ret(Some(acc)).unwrap();
    f.finish().unwrap();

    let program = module.finish().unwrap();
    let instrs = program.function_instrs("fsum").unwrap();
    let float_spills = instrs
        .iter()
        .filter(|i| matches!(i, Instr::StoreStack { src, .. } if src.is_float()))
        .count();
    assert!(float_spills >= 1);
    assert!(instrs
        .iter()
        .any(|i| matches!(i, Instr::LoadStack { dst, size: 8, .. } if dst.is_float())));
}
