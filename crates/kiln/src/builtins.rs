//! Inlinable bodies for the engine's builtin natives.

use kiln_config::DEFAULT_ENGINE_BINARY;
use kiln_core::Expr;
use kiln_jit::{BitcodeIndex, IndexedFunction};

/// Wraps `body` so that a `NULL` in any argument yields `NULL`.
fn strict(params: usize, body: Expr) -> Expr {
    let any_null = (1..params).fold(Expr::is_null(Expr::arg(0)), |acc, i| {
        Expr::or(acc, Expr::is_null(Expr::arg(i)))
    });
    Expr::if_then_else(any_null, Expr::null(), body)
}

fn binary(name: &str, op: fn(Expr, Expr) -> Expr) -> IndexedFunction {
    IndexedFunction::new(name, 2, strict(2, op(Expr::arg(0), Expr::arg(1))))
}

/// Index of the engine binary, used when no index file is configured.
///
/// Each body computes the same result as the native of the same name in
/// [`NativeSymbols::with_builtins`](kiln_core::NativeSymbols::with_builtins).
pub fn engine_index() -> BitcodeIndex {
    let mut index = BitcodeIndex::new(DEFAULT_ENGINE_BINARY);
    for function in [
        binary("int8pl", Expr::add),
        binary("int8mi", Expr::sub),
        binary("int8mul", Expr::mul),
        binary("int8div", Expr::div),
        binary("int8larger", Expr::max),
        binary("int8smaller", Expr::min),
        binary("int8eq", Expr::eq),
        binary("int8lt", Expr::lt),
        IndexedFunction::new("int8abs", 1, strict(1, Expr::abs(Expr::arg(0)))),
    ] {
        index.insert(function);
    }
    index
}
