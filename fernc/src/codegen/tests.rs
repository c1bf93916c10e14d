//! Unit tests for the lowering stages.
//!
//! Programs are assembled by hand through the SSA builder API and compiled
//! against the host target; assertions run over the printed IR.

use inkwell::context::Context;

use crate::span::Position;
use crate::ssa::{
    BinOp, Const, Field, Function, Global, InitValue, Instr, NamedTypeDef, Operand, Program,
    Signature, Type, TypeKind, UnOp,
};

use super::consts::{hashmap_hash, hashmap_top_hash};
use super::{Config, Session};

fn plain_sig(params: Vec<Type>, results: Vec<Type>) -> Signature {
    Signature { recv: None, params, results, needs_context: false }
}

fn int() -> Type {
    Type::int()
}

/// Compile a program against the host target and return the printed IR.
/// The module is verified first, so structural mistakes fail loudly.
fn compile(program: &Program) -> String {
    let context = Context::create();
    let mut session =
        Session::new(&context, "test", Config::default()).expect("host target available");
    session.compile(program).expect("compile");
    session.verify("IR construction").expect("verify");
    session.ir()
}

#[test]
fn add_function_signature_and_body() {
    let mut program = Program::default();
    let mut f = Function::new("add", "main.add", plain_sig(vec![int(), int()], vec![int()]));
    f.exported = true;
    let a = f.add_param("a", int(), Position::none());
    let b = f.add_param("b", int(), Position::none());
    let bb = f.new_block("entry");
    let sum = f.push_instr(
        bb,
        Instr::BinOp { op: BinOp::Add, x: Operand::Value(a), y: Operand::Value(b) },
        Some(int()),
    );
    f.push_instr(bb, Instr::Return { results: vec![Operand::Value(sum)] }, None);
    program.add_function(f);

    let ir = compile(&program);
    assert!(ir.contains("define i32 @main.add(i32"), "exported i32(i32,i32) signature:\n{}", ir);
    assert!(ir.contains("add i32"), "integer add body:\n{}", ir);
}

#[test]
fn named_struct_two_phase_and_zero_init() {
    let mut program = Program::default();
    program.named_types.push(NamedTypeDef {
        name: "main.Point".into(),
        underlying: Type::strukt(vec![
            Field { name: "x".into(), ty: int() },
            Field { name: "y".into(), ty: int() },
        ]),
        volatile: false,
    });
    program.add_global(Global {
        name: "origin".into(),
        link_name: "main.origin".into(),
        ty: Type::named("main.Point"),
        extern_linkage: false,
        initializer: None,
    });

    let ir = compile(&program);
    assert!(
        ir.contains("%main.Point = type { i32, i32 }"),
        "named aggregate declared with body:\n{}",
        ir
    );
    assert!(
        ir.contains("@main.origin = internal global %main.Point zeroinitializer"),
        "global zero-initialized:\n{}",
        ir
    );
}

#[test]
fn string_constants_are_interned() {
    let mut program = Program::default();
    let mut f =
        Function::new("greet", "main.greet", plain_sig(vec![], vec![Type::string()]));
    let bb = f.new_block("entry");
    f.push_instr(
        bb,
        Instr::Return { results: vec![Operand::Const(Const::str("hi"))] },
        None,
    );
    program.add_function(f);

    let ir = compile(&program);
    assert!(ir.contains("main.greet$string"), "interned string global:\n{}", ir);
    assert!(ir.contains("c\"hi\""), "string bytes:\n{}", ir);
    assert!(ir.contains("%runtime._string"), "string header type:\n{}", ir);
}

#[test]
fn constant_in_bounds_index_elides_the_check() {
    let mut program = Program::default();
    let mut f = Function::new("pick", "main.pick", plain_sig(vec![], vec![int()]));
    let bb = f.new_block("entry");
    let arr = f.push_instr(
        bb,
        Instr::Alloc { ty: Type::array(int(), 3), heap: false, comment: "arr".into() },
        Some(Type::pointer(Type::array(int(), 3))),
    );
    let elem = f.push_instr(
        bb,
        Instr::IndexAddr { x: Operand::Value(arr), index: Operand::Const(Const::int(int(), 1)) },
        Some(Type::pointer(int())),
    );
    let loaded = f.push_instr(
        bb,
        Instr::UnOp { op: UnOp::Deref, x: Operand::Value(elem) },
        Some(int()),
    );
    f.push_instr(bb, Instr::Return { results: vec![Operand::Value(loaded)] }, None);
    program.add_function(f);

    let ir = compile(&program);
    assert!(
        !ir.contains("lookupBoundsCheck"),
        "constant in-bounds access needs no check:\n{}",
        ir
    );
}

#[test]
fn make_map_declares_the_runtime_constructor() {
    let mut program = Program::default();
    let map_ty = Type::map(Type::string(), int());
    let mut f = Function::new("fresh", "main.fresh", plain_sig(vec![], vec![map_ty.clone()]));
    let bb = f.new_block("entry");
    let m = f.push_instr(bb, Instr::MakeMap, Some(map_ty));
    f.push_instr(bb, Instr::Return { results: vec![Operand::Value(m)] }, None);
    program.add_function(f);

    let ir = compile(&program);
    assert!(
        ir.contains("declare %runtime.hashmap* @runtime.hashmapMake(i8, i8)"),
        "hashmap constructor declared by name:\n{}",
        ir
    );
}

#[test]
fn shift_amount_is_normalized_to_operand_width() {
    let mut program = Program::default();
    let mut f = Function::new(
        "sh",
        "main.sh",
        plain_sig(vec![int(), Type::new(TypeKind::Uint64)], vec![int()]),
    );
    let x = f.add_param("x", int(), Position::none());
    let n = f.add_param("n", Type::new(TypeKind::Uint64), Position::none());
    let bb = f.new_block("entry");
    let shifted = f.push_instr(
        bb,
        Instr::BinOp { op: BinOp::Shl, x: Operand::Value(x), y: Operand::Value(n) },
        Some(int()),
    );
    f.push_instr(bb, Instr::Return { results: vec![Operand::Value(shifted)] }, None);
    program.add_function(f);

    let ir = compile(&program);
    // The wide amount is truncated before the shift; the result stays i32.
    assert!(ir.contains("trunc i64"), "amount truncated to operand width:\n{}", ir);
    assert!(ir.contains("shl i32"), "shift stays at operand width:\n{}", ir);
}

#[test]
fn multi_result_functions_return_a_struct() {
    let mut program = Program::default();
    let mut f =
        Function::new("pair", "main.pair", plain_sig(vec![], vec![int(), Type::bool()]));
    let bb = f.new_block("entry");
    f.push_instr(
        bb,
        Instr::Return {
            results: vec![
                Operand::Const(Const::int(int(), 4)),
                Operand::Const(Const::bool(true)),
            ],
        },
        None,
    );
    program.add_function(f);

    let ir = compile(&program);
    assert!(
        ir.contains("define internal { i32, i1 } @main.pair()"),
        "anonymous result struct:\n{}",
        ir
    );
}

#[test]
fn single_result_never_returns_a_struct() {
    let mut program = Program::default();
    let mut f = Function::new("one", "main.one", plain_sig(vec![], vec![int()]));
    let bb = f.new_block("entry");
    f.push_instr(
        bb,
        Instr::Return { results: vec![Operand::Const(Const::int(int(), 1))] },
        None,
    );
    program.add_function(f);

    let ir = compile(&program);
    assert!(ir.contains("define internal i32 @main.one()"), "scalar return:\n{}", ir);
}

#[test]
fn blocking_function_with_results_is_rejected() {
    let mut program = Program::default();
    let mut f = Function::new("bad", "main.bad", plain_sig(vec![], vec![int()]));
    f.blocking = true;
    let bb = f.new_block("entry");
    f.push_instr(
        bb,
        Instr::Return { results: vec![Operand::Const(Const::int(int(), 1))] },
        None,
    );
    program.add_function(f);

    let context = Context::create();
    let mut session = Session::new(&context, "test", Config::default()).unwrap();
    let err = session.compile(&program).unwrap_err();
    assert!(
        matches!(err, crate::diagnostics::CompileError::UnsupportedBlockingReturn(_)),
        "got {:?}",
        err
    );
}

#[test]
fn map_key_hash_matches_the_runtime() {
    // FNV-1a reference vectors.
    assert_eq!(hashmap_hash(b""), 2166136261);
    assert_eq!(hashmap_hash(b"a"), 0xe40c292c);
    assert_eq!(hashmap_hash(b"foobar"), 0xbf9cf968);
}

#[test]
fn top_hash_never_marks_a_slot_empty() {
    // Zero means an empty slot, so a zero high byte must be bumped.
    assert_eq!(hashmap_top_hash(0x00ff_ffff), 1);
    assert_eq!(hashmap_top_hash(0xab00_0000), 0xab);
}

#[test]
fn type_lowering_is_referentially_stable() {
    let mut program = Program::default();
    program.named_types.push(NamedTypeDef {
        name: "main.Node".into(),
        underlying: Type::strukt(vec![Field {
            name: "next".into(),
            ty: Type::pointer(Type::named("main.Node")),
        }]),
        volatile: false,
    });
    program.add_global(Global {
        name: "head".into(),
        link_name: "main.head".into(),
        ty: Type::named("main.Node"),
        extern_linkage: false,
        initializer: None,
    });

    // A self-referential named struct must resolve through the cache.
    let ir = compile(&program);
    assert!(
        ir.contains("%main.Node = type { %main.Node* }"),
        "pointer-cyclic named struct:\n{}",
        ir
    );
}

#[test]
fn param_expansion_decision_is_symmetric() {
    let context = Context::create();
    let session = Session::new(&context, "test", Config::default()).unwrap();

    let small = context.struct_type(
        &[context.i32_type().into(), context.i32_type().into()],
        false,
    );
    assert_eq!(session.expanded_param_types(small.into()).len(), 2);

    let big = context.struct_type(
        &[
            context.i32_type().into(),
            context.i32_type().into(),
            context.i32_type().into(),
            context.i32_type().into(),
        ],
        false,
    );
    let frags = session.expanded_param_types(big.into());
    assert_eq!(frags.len(), 1);
    assert_eq!(frags[0], big.into());
}

#[test]
fn volatile_pointee_marks_stores() {
    let mut program = Program::default();
    program.named_types.push(NamedTypeDef {
        name: "machine.Register".into(),
        underlying: Type::new(TypeKind::Uint32),
        volatile: true,
    });
    program.add_global(Global {
        name: "reg".into(),
        link_name: "machine.reg".into(),
        ty: Type::named("machine.Register"),
        extern_linkage: false,
        initializer: None,
    });
    let gid = crate::ssa::GlobalId(0);

    let mut f = Function::new("poke", "main.poke", plain_sig(vec![], vec![]));
    let bb = f.new_block("entry");
    f.push_instr(
        bb,
        Instr::Store {
            addr: Operand::Global(gid),
            val: Operand::Const(Const::uint(Type::named("machine.Register"), 1)),
        },
        None,
    );
    f.push_instr(bb, Instr::Return { results: vec![] }, None);
    program.add_function(f);

    let ir = compile(&program);
    assert!(ir.contains("store volatile i32"), "volatile register store:\n{}", ir);
}

#[test]
fn global_initializer_for_zero_of_type_matches_zero_value() {
    let mut program = Program::default();
    program.add_global(Global {
        name: "z".into(),
        link_name: "main.z".into(),
        ty: Type::slice(int()),
        extern_linkage: false,
        initializer: Some(InitValue::ZeroBasic(Type::slice(int()))),
    });
    let ir = compile(&program);
    assert!(
        ir.contains("@main.z = internal global { i32*, i32, i32 } zeroinitializer"),
        "zero slice equals zeroinitializer:\n{}",
        ir
    );
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    /// Structural types the front end can throw at the lowerer, bounded in
    /// depth so the strategy terminates.
    fn arb_type() -> impl Strategy<Value = Type> {
        let leaf = prop_oneof![
            Just(Type::bool()),
            Just(int()),
            Just(Type::new(TypeKind::Uint8)),
            Just(Type::new(TypeKind::Int64)),
            Just(Type::new(TypeKind::Float64)),
            Just(Type::string()),
            Just(Type::unsafe_pointer()),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                inner.clone().prop_map(Type::pointer),
                inner.clone().prop_map(Type::slice),
                (inner.clone(), 0u64..4).prop_map(|(t, n)| Type::array(t, n)),
                prop::collection::vec(inner, 0..4).prop_map(|tys| {
                    Type::strukt(
                        tys.into_iter()
                            .enumerate()
                            .map(|(i, ty)| Field { name: format!("f{}", i), ty })
                            .collect(),
                    )
                }),
            ]
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Lowering the same type twice yields structurally identical LLVM
        /// types, and the zero-value mirror produces a constant of exactly
        /// the lowered type.
        #[test]
        fn lowering_is_pure(ty in arb_type()) {
            let context = Context::create();
            let session = Session::new(&context, "prop", Config::default()).unwrap();
            let a = session.lower_type(&ty).unwrap();
            let b = session.lower_type(&ty).unwrap();
            prop_assert_eq!(a, b);

            let zero = session.zero_value(a).unwrap();
            prop_assert_eq!(zero.get_type(), a);
        }
    }
}
