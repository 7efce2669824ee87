//! Tests for the dispatch facade.

use std::sync::Arc;

use kiln_config::{CostThreshold, JitConfig};
use kiln_core::{AttrDesc, AttrType, Expr, NativeSymbols, TupleDesc};

use super::*;
use crate::context::ContextState;
use crate::error::JitError;
use crate::provider::ProviderRegistry;
use crate::test_utils::{MockCounters, MockProvider, MOCK_EXPR_RESULT};

fn always() -> JitConfig {
    JitConfig::new().with_provider("mock").with_thresholds(
        CostThreshold::Always,
        CostThreshold::Never,
        CostThreshold::Never,
    )
}

fn jit_with(config: JitConfig, provider: MockProvider) -> (Jit, Arc<MockCounters>) {
    let (registry, counters) = provider.registry();
    let jit = Jit::new(
        config,
        Arc::new(ProviderLoader::new(registry)),
        Arc::new(NativeSymbols::with_builtins()),
        Arc::new(SymbolResolver::empty()),
    );
    (jit, counters)
}

fn qual() -> Expr {
    Expr::lt(Expr::field(0, 0), Expr::int(5))
}

#[test]
fn test_start_creates_one_context_per_unit() {
    let (jit, counters) = jit_with(always(), MockProvider::new());
    let mut unit = WorkUnit::new("q1", 1.0);
    let first = jit.start(&mut unit).unwrap().id();
    let second = jit.start(&mut unit).unwrap().id();
    assert_eq!(first, second);
    assert_eq!(MockCounters::get(&counters.contexts), 1);
}

#[test]
fn test_start_below_threshold_is_none() {
    let config = always().with_thresholds(
        CostThreshold::Above(100.0),
        CostThreshold::Never,
        CostThreshold::Never,
    );
    let (jit, counters) = jit_with(config, MockProvider::new());
    let mut unit = WorkUnit::new("cheap", 99.0);
    assert!(jit.start(&mut unit).is_none());
    assert_eq!(MockCounters::get(&counters.contexts), 0);
    assert!(!jit.loader().is_attempted());
}

#[test]
fn test_disabled_jit_never_starts() {
    let (jit, _) = jit_with(JitConfig::disabled().with_provider("mock"), MockProvider::new());
    let mut unit = WorkUnit::new("q", f64::MAX);
    assert!(jit.start(&mut unit).is_none());
}

#[test]
fn test_missing_provider_falls_back() {
    let jit = Jit::new(
        always().with_provider("llvm"),
        Arc::new(ProviderLoader::new(ProviderRegistry::new())),
        Arc::new(NativeSymbols::with_builtins()),
        Arc::new(SymbolResolver::empty()),
    );
    for _ in 0..3 {
        let mut unit = WorkUnit::new("q", 1e9);
        assert!(jit.start(&mut unit).is_none());
        assert_eq!(jit.compile_expr(&mut unit, "qual", &qual(), 1).unwrap(), None);
    }
}

#[test]
fn test_compile_expr_memoizes() {
    let (jit, counters) = jit_with(always(), MockProvider::new());
    let mut unit = WorkUnit::new("q", 1.0);
    let a = jit.compile_expr(&mut unit, "qual", &qual(), 1).unwrap().unwrap();
    let b = jit.compile_expr(&mut unit, "qual", &qual(), 1).unwrap().unwrap();
    assert_eq!(a, b);
    assert_eq!(MockCounters::get(&counters.defined), 1);

    let ctx = unit.jit_context().unwrap();
    assert_eq!(ctx.expr_fn(a).unwrap().call_rows(&[&[1]]), MOCK_EXPR_RESULT);
}

#[test]
fn test_feature_switches() {
    let mut config = always();
    config.expressions = false;
    let (jit, _) = jit_with(config, MockProvider::new());
    let mut unit = WorkUnit::new("q", 1.0);
    assert_eq!(jit.compile_expr(&mut unit, "qual", &qual(), 1).unwrap(), None);

    let desc = TupleDesc::new(vec![AttrDesc::not_null("a", AttrType::Int4)]);
    assert!(jit.compile_deform(&mut unit, "scan", &desc).unwrap().is_some());
}

#[test]
fn test_release_invalidates_handles() {
    let (jit, counters) = jit_with(always(), MockProvider::new());
    let mut unit = WorkUnit::new("q", 1.0);
    let handle = jit.compile_expr(&mut unit, "qual", &qual(), 1).unwrap().unwrap();
    jit.release(&mut unit);
    jit.release(&mut unit);

    let ctx = unit.jit_context().unwrap();
    assert_eq!(ctx.state(), ContextState::Released);
    assert!(matches!(ctx.expr_fn(handle), Err(JitError::ContextReleased(_))));
    assert!(jit.start(&mut unit).is_none());
    unit.finish();
    assert_eq!(MockCounters::get(&counters.released), 1);
}

#[test]
fn test_finish_releases_context() {
    let (jit, counters) = jit_with(always(), MockProvider::new());
    let mut unit = WorkUnit::new("q", 1.0);
    jit.compile_expr(&mut unit, "qual", &qual(), 1).unwrap();
    unit.finish();
    assert_eq!(MockCounters::get(&counters.released), 1);
}

#[test]
fn test_aborted_unit_releases_context() {
    let (jit, counters) = jit_with(always(), MockProvider::new());
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let mut unit = WorkUnit::new("q", 1.0);
        jit.compile_expr(&mut unit, "qual", &qual(), 1).unwrap();
        panic!("executor error");
    }));
    assert!(result.is_err());
    jit.reset_after_error();
    assert_eq!(MockCounters::get(&counters.released), 1);
}

#[test]
fn test_invalid_definition_is_an_error() {
    let (jit, _) = jit_with(always(), MockProvider::new());
    let mut unit = WorkUnit::new("q", 1.0);
    let bad = Expr::call("no_such_fn", vec![]);
    assert!(matches!(
        jit.compile_expr(&mut unit, "bad", &bad, 0),
        Err(JitError::Definition { .. })
    ));
}

#[test]
fn test_concurrent_units_are_independent() {
    let (jit, counters) = jit_with(always(), MockProvider::new());
    let ids: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let jit = &jit;
                s.spawn(move || {
                    let mut unit = WorkUnit::new(format!("worker-{i}"), 1.0);
                    let handle = jit.compile_expr(&mut unit, "qual", &qual(), 1).unwrap().unwrap();
                    let ctx = unit.jit_context().unwrap();
                    assert_eq!(ctx.expr_fn(handle).unwrap().call_rows(&[&[0]]), MOCK_EXPR_RESULT);
                    let id = ctx.id();
                    unit.finish();
                    id
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 4);
    assert_eq!(MockCounters::get(&counters.contexts), 4);
    assert_eq!(MockCounters::get(&counters.released), 4);
}
