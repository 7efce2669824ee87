//! Native engine functions callable from interpreted and compiled expressions.

use std::collections::HashMap;

use crate::datum::NULL_SENTINEL;

/// Uniform native calling convention: pointer to `nargs` argument slots.
///
/// Generated code spills call arguments to a stack array and passes its address, so a
/// single signature serves every arity.
pub type NativeFn = extern "C" fn(args: *const i64, nargs: usize) -> i64;

/// Reinterprets the raw argument pointer of a [`NativeFn`] as a slice.
///
/// # Safety
///
/// `args` must point to `nargs` initialized slots that stay valid for the call.
#[inline]
pub unsafe fn native_args<'a>(args: *const i64, nargs: usize) -> &'a [i64] {
    if nargs == 0 {
        return &[];
    }
    std::slice::from_raw_parts(args, nargs)
}

/// A registered native function.
#[derive(Debug, Clone, Copy)]
pub struct NativeFunction {
    pub func: NativeFn,
    pub arity: usize,
}

impl NativeFunction {
    /// Calls the function with `args`.
    #[inline]
    pub fn invoke(&self, args: &[i64]) -> i64 {
        debug_assert_eq!(args.len(), self.arity);
        (self.func)(args.as_ptr(), args.len())
    }

    /// Address of the entry point, for linking generated code against it.
    pub fn address(&self) -> *const u8 {
        self.func as *const u8
    }
}

/// Engine function table: symbol name to native implementation.
///
/// Every symbol an [`Expr::Call`](crate::Expr::Call) targets must be registered here,
/// even when a bitcode index provides an inlinable body for it, because inlining is
/// optional and a direct call is always the fallback.
#[derive(Debug, Clone, Default)]
pub struct NativeSymbols {
    functions: HashMap<String, NativeFunction>,
}

impl NativeSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table preloaded with the engine's integer builtins.
    pub fn with_builtins() -> Self {
        let mut symbols = Self::new();
        symbols.register("int8pl", 2, int8pl);
        symbols.register("int8mi", 2, int8mi);
        symbols.register("int8mul", 2, int8mul);
        symbols.register("int8div", 2, int8div);
        symbols.register("int8abs", 1, int8abs);
        symbols.register("int8larger", 2, int8larger);
        symbols.register("int8smaller", 2, int8smaller);
        symbols.register("int8eq", 2, int8eq);
        symbols.register("int8lt", 2, int8lt);
        symbols
    }

    /// Registers or replaces `symbol`.
    pub fn register(&mut self, symbol: impl Into<String>, arity: usize, func: NativeFn) {
        self.functions
            .insert(symbol.into(), NativeFunction { func, arity });
    }

    pub fn get(&self, symbol: &str) -> Option<&NativeFunction> {
        self.functions.get(symbol)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.functions.contains_key(symbol)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &NativeFunction)> {
        self.functions.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Builtins
// ---------------------------------------------------------------------------

fn strict2(args: *const i64, nargs: usize, op: impl FnOnce(i64, i64) -> i64) -> i64 {
    let args = unsafe { native_args(args, nargs) };
    match args {
        [a, b] if *a != NULL_SENTINEL && *b != NULL_SENTINEL => op(*a, *b),
        _ => NULL_SENTINEL,
    }
}

extern "C" fn int8pl(args: *const i64, nargs: usize) -> i64 {
    strict2(args, nargs, i64::wrapping_add)
}

extern "C" fn int8mi(args: *const i64, nargs: usize) -> i64 {
    strict2(args, nargs, i64::wrapping_sub)
}

extern "C" fn int8mul(args: *const i64, nargs: usize) -> i64 {
    strict2(args, nargs, i64::wrapping_mul)
}

extern "C" fn int8div(args: *const i64, nargs: usize) -> i64 {
    strict2(args, nargs, |a, b| a.checked_div(b).unwrap_or(NULL_SENTINEL))
}

extern "C" fn int8abs(args: *const i64, nargs: usize) -> i64 {
    let args = unsafe { native_args(args, nargs) };
    match args {
        [a] if *a != NULL_SENTINEL => a.wrapping_abs(),
        _ => NULL_SENTINEL,
    }
}

extern "C" fn int8larger(args: *const i64, nargs: usize) -> i64 {
    strict2(args, nargs, i64::max)
}

extern "C" fn int8smaller(args: *const i64, nargs: usize) -> i64 {
    strict2(args, nargs, i64::min)
}

extern "C" fn int8eq(args: *const i64, nargs: usize) -> i64 {
    strict2(args, nargs, |a, b| (a == b) as i64)
}

extern "C" fn int8lt(args: *const i64, nargs: usize) -> i64 {
    strict2(args, nargs, |a, b| (a < b) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_registered() {
        let natives = NativeSymbols::with_builtins();
        assert!(natives.contains("int8pl"));
        assert_eq!(natives.get("int8abs").map(|f| f.arity), Some(1));
        assert!(!natives.contains("int4pl"));
    }

    #[test]
    fn test_invoke() {
        let natives = NativeSymbols::with_builtins();
        let pl = natives.get("int8pl").unwrap();
        assert_eq!(pl.invoke(&[2, 40]), 42);
        assert_eq!(pl.invoke(&[NULL_SENTINEL, 1]), NULL_SENTINEL);
        let div = natives.get("int8div").unwrap();
        assert_eq!(div.invoke(&[7, 0]), NULL_SENTINEL);
        assert_eq!(div.invoke(&[7, 2]), 3);
    }
}
