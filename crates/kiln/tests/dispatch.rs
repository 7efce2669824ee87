//! Integration tests for JIT dispatch through the public facade.
//!
//! Every compiled path is checked against the interpreter, which is the
//! reference semantics.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use kiln::prelude::*;
use kiln::{
    default_registry, jit_with_loader, native_args, BitcodeIndex, NativeSymbols, ProviderLoader,
};

const ROWS: [[i64; 3]; 5] = [
    [0, 0, 0],
    [3, -4, 9],
    [i64::MAX, 1, NULL_SENTINEL],
    [NULL_SENTINEL, 7, -2],
    [-100, 0, 5],
];

fn eager() -> JitConfig {
    JitConfig::default().with_thresholds(
        CostThreshold::Always,
        CostThreshold::Never,
        CostThreshold::Never,
    )
}

fn inlining() -> JitConfig {
    JitConfig::default().with_thresholds(
        CostThreshold::Always,
        CostThreshold::Always,
        CostThreshold::Always,
    )
}

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("kiln-it-{name}-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn sample_expr() -> Expr {
    Expr::if_then_else(
        Expr::is_null(Expr::field(1, 2)),
        Expr::call("int8abs", vec![Expr::field(0, 1)]),
        Expr::call(
            "int8pl",
            vec![
                Expr::mul(Expr::field(0, 0), Expr::field(1, 1)),
                Expr::div(Expr::field(1, 2), Expr::field(0, 1)),
            ],
        ),
    )
}

/// Evaluates `state` on every pair of rows.
fn eval_grid(state: &ExprState, jit: &Jit, unit: &WorkUnit) -> Vec<i64> {
    let mut out = Vec::new();
    for a in &ROWS {
        for b in &ROWS {
            out.push(state.eval(jit, unit, &[a.as_slice(), b.as_slice()]).unwrap());
        }
    }
    out
}

#[test]
fn test_missing_provider_falls_back_to_interpreter() {
    let loader = Arc::new(ProviderLoader::new(default_registry()));
    let jit = jit_with_loader(
        eager().with_provider("llvm"),
        loader.clone(),
        NativeSymbols::with_builtins(),
    );
    let mut unit = WorkUnit::new("scan", 1.0);
    let mut state = ExprState::new("qual", sample_expr(), 2);

    assert!(!state.prepare(&jit, &mut unit).unwrap());
    assert!(unit.jit_context().is_none());
    assert!(loader.is_attempted());
    assert_eq!(state.eval(&jit, &unit, &[&[2, 3, 4], &[1, 1, 9]]).unwrap(), 5);
}

#[test]
fn test_compiled_results_match_interpreter() {
    let jit = kiln::jit_with_config(eager());
    let mut unit = WorkUnit::new("join", 10.0);
    let mut state = ExprState::new("qual", sample_expr(), 2);
    assert!(state.prepare(&jit, &mut unit).unwrap());

    let disabled = kiln::jit_with_config(JitConfig::disabled());
    let mut plain = WorkUnit::new("join", 10.0);
    let mut reference = ExprState::new("qual", sample_expr(), 2);
    assert!(!reference.prepare(&disabled, &mut plain).unwrap());

    assert_eq!(
        eval_grid(&state, &jit, &unit),
        eval_grid(&reference, &disabled, &plain)
    );
    assert_eq!(unit.jit_context().unwrap().function_count(), 1);
}

#[test]
fn test_inlined_code_matches_direct_calls() {
    let direct_jit = kiln::jit_with_config(eager());
    let inline_jit = kiln::jit_with_config(inlining());

    let mut direct_unit = WorkUnit::new("agg", 1.0);
    let mut inline_unit = WorkUnit::new("agg", 1.0);
    let mut direct = ExprState::new("sum", sample_expr(), 2);
    let mut inlined = ExprState::new("sum", sample_expr(), 2);
    direct.prepare(&direct_jit, &mut direct_unit).unwrap();
    inlined.prepare(&inline_jit, &mut inline_unit).unwrap();

    assert_eq!(
        eval_grid(&inlined, &inline_jit, &inline_unit),
        eval_grid(&direct, &direct_jit, &direct_unit)
    );

    let instr = inline_unit.jit_context().unwrap().instrumentation();
    assert_eq!(instr.inlined_calls, 2);
    let instr = direct_unit.jit_context().unwrap().instrumentation();
    assert_eq!(instr.inlined_calls, 0);
}

#[test]
fn test_deform_matches_interpreter() {
    let desc = TupleDesc::new(vec![
        AttrDesc::not_null("id", AttrType::Int8),
        AttrDesc::new("active", AttrType::Bool),
        AttrDesc::new("qty", AttrType::Int4),
        AttrDesc::new("code", AttrType::Int2),
    ]);
    let jit = kiln::jit_with_config(eager());
    let mut unit = WorkUnit::new("seqscan", 1.0);
    let mut state = DeformState::new("scan", desc.clone());
    assert!(state.prepare(&jit, &mut unit).unwrap());

    for values in [
        vec![Datum::Int(1), Datum::Bool(true), Datum::Int(-5), Datum::Int(12)],
        vec![Datum::Int(2), Datum::Null, Datum::Null, Datum::Int(-1)],
        vec![Datum::Int(i64::MAX), Datum::Bool(false), Datum::Int(7), Datum::Null],
    ] {
        let row = desc.form_row(&values);
        assert_eq!(state.deform(&unit, &row).unwrap(), desc.deform(&row));
    }
}

#[test]
fn test_release_falls_back_to_interpreter() {
    let jit = kiln::jit_with_config(eager());
    let mut unit = WorkUnit::new("sort", 1.0);
    let mut state = ExprState::new("key", Expr::add(Expr::field(0, 0), Expr::int(1)), 1);
    assert!(state.prepare(&jit, &mut unit).unwrap());
    assert_eq!(state.eval(&jit, &unit, &[&[41]]).unwrap(), 42);

    jit.release(&mut unit);
    assert!(jit.start(&mut unit).is_none());
    assert_eq!(state.eval(&jit, &unit, &[&[41]]).unwrap(), 42);
    unit.finish();
}

#[test]
fn test_short_rows_read_as_null() {
    let jit = kiln::jit_with_config(eager());
    let disabled = kiln::jit_with_config(JitConfig::disabled());
    let expr = Expr::if_then_else(
        Expr::is_null(Expr::field(0, 2)),
        Expr::field(0, 0),
        Expr::field(1, 1),
    );

    let mut unit = WorkUnit::new("outer", 1.0);
    let mut state = ExprState::new("coalesce", expr.clone(), 2);
    assert!(state.prepare(&jit, &mut unit).unwrap());
    let mut plain = WorkUnit::new("outer", 1.0);
    let mut reference = ExprState::new("coalesce", expr, 2);
    assert!(!reference.prepare(&disabled, &mut plain).unwrap());

    let inputs: [&[&[i64]]; 4] = [&[&[1]], &[&[1, 2, 3], &[4, 5]], &[&[7, 8, 9]], &[]];
    for rows in inputs {
        assert_eq!(
            state.eval(&jit, &unit, rows).unwrap(),
            reference.eval(&disabled, &plain, rows).unwrap(),
            "{rows:?}"
        );
    }
    assert_eq!(state.eval(&jit, &unit, &[&[1]]).unwrap(), 1);
}

#[test]
fn test_concurrent_units_are_independent() {
    let jit = kiln::jit_with_config(eager());

    std::thread::scope(|scope| {
        for t in 0..4i64 {
            let jit = &jit;
            scope.spawn(move || {
                let mut unit = WorkUnit::new(format!("worker-{t}"), 1.0);
                let mut state =
                    ExprState::new("plus", Expr::add(Expr::field(0, 0), Expr::int(t)), 1);
                assert!(state.prepare(jit, &mut unit).unwrap());
                for x in 0..50 {
                    assert_eq!(state.eval(jit, &unit, &[&[x]]).unwrap(), x + t);
                }
                let context = unit.jit_context().unwrap();
                assert_eq!(context.function_count(), 1);
                unit.finish();
            });
        }
    });
}

extern "C" fn geo_double(args: *const i64, nargs: usize) -> i64 {
    match unsafe { native_args(args, nargs) } {
        [v] if *v != NULL_SENTINEL => v.wrapping_mul(2),
        _ => NULL_SENTINEL,
    }
}

#[test]
fn test_extension_index_is_inlined() {
    let dir = temp_dir("extension");
    fs::write(
        BitcodeIndex::path_for(&dir, "geo"),
        r#"
        binary = "geo"

        [[functions]]
        name = "geo_double"
        params = 1
        body = { if = { cond = { is_null = { arg = 0 } }, then_expr = { literal = "null" }, else_expr = { mul = [{ arg = 0 }, { literal = { int = 2 } }] } } }
        "#,
    )
    .unwrap();

    let mut natives = NativeSymbols::with_builtins();
    natives.register("geo_double", 1, geo_double);
    let jit = jit_with_loader(
        inlining().with_bitcode_dir(&dir),
        kiln::global_loader(),
        natives,
    );

    let mut unit = WorkUnit::new("geo", 1.0);
    let expr = Expr::call_in("geo_double", "geo", vec![Expr::field(0, 0)]);
    let mut state = ExprState::new("double", expr, 1);
    assert!(state.prepare(&jit, &mut unit).unwrap());

    assert_eq!(state.eval(&jit, &unit, &[&[21]]).unwrap(), 42);
    assert_eq!(state.eval(&jit, &unit, &[&[NULL_SENTINEL]]).unwrap(), NULL_SENTINEL);
    let instr = unit.jit_context().unwrap().instrumentation();
    assert_eq!(instr.inlined_calls, 1);
}

#[test]
fn test_config_loaded_from_toml() {
    let dir = temp_dir("config");
    let path = dir.join("kiln.toml");
    fs::write(
        &path,
        r#"
        provider = "cranelift"
        above_cost = 1000
        optimize_above_cost = "never"
        inline_above_cost = "never"
        tuple_deforming = false
        "#,
    )
    .unwrap();

    let jit = kiln::jit_from_file(&path).unwrap();
    assert_eq!(jit.config().above_cost, CostThreshold::Above(1000.0));

    let mut cheap = WorkUnit::new("cheap", 10.0);
    let mut state = ExprState::new("e", Expr::int(7), 0);
    assert!(!state.prepare(&jit, &mut cheap).unwrap());
    assert_eq!(state.eval(&jit, &cheap, &[]).unwrap(), 7);

    let mut costly = WorkUnit::new("costly", 5000.0);
    assert!(state.prepare(&jit, &mut costly).unwrap());
    let desc = TupleDesc::new(vec![AttrDesc::new("a", AttrType::Int4)]);
    let mut deform = DeformState::new("scan", desc);
    assert!(!deform.prepare(&jit, &mut costly).unwrap());
    assert_eq!(state.eval(&jit, &costly, &[]).unwrap(), 7);
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = temp_dir("invalid");
    let path = dir.join("kiln.toml");
    fs::write(&path, "above_cost = 500\noptimize_above_cost = 100\n").unwrap();
    assert!(kiln::jit_from_file(&path).is_err());
}
