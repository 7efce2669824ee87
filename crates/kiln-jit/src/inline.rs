//! Expression-level inlining of resolvable calls.
//!
//! A call is replaced by the callee's body, with the call arguments substituted for
//! its parameters, when the body fits the remaining budget. The budget halves at
//! every nesting level, so deep call chains stay bounded. A function never inlines
//! into itself, directly or indirectly.

use kiln_core::Expr;

use crate::index::IndexedFunction;
use crate::resolver::SymbolResolver;

/// Default budget, in expression nodes, for an inlined body.
pub const DEFAULT_INLINE_COST_LIMIT: usize = 150;

pub struct Inliner<'a> {
    resolver: &'a SymbolResolver,
    budget: usize,
    stack: Vec<String>,
    inlined: usize,
}

impl<'a> Inliner<'a> {
    pub fn new(resolver: &'a SymbolResolver, budget: usize) -> Self {
        Self {
            resolver,
            budget,
            stack: Vec::new(),
            inlined: 0,
        }
    }

    /// Returns `expr` with every eligible call inlined.
    pub fn inline(&mut self, expr: &Expr) -> Expr {
        self.inline_within(expr, self.budget)
    }

    /// Number of calls inlined so far.
    pub fn inlined_calls(&self) -> usize {
        self.inlined
    }

    fn inline_within(&mut self, expr: &Expr, budget: usize) -> Expr {
        let Expr::Call {
            symbol,
            binary,
            args,
        } = expr
        else {
            return expr.map_children(|child| self.inline_within(child, budget));
        };

        let args: Vec<Expr> = args
            .iter()
            .map(|arg| self.inline_within(arg, budget))
            .collect();

        let direct = |args: Vec<Expr>| Expr::Call {
            symbol: symbol.clone(),
            binary: binary.clone(),
            args,
        };
        let Some(callee) = self.candidate(symbol, binary.as_deref(), args.len(), budget) else {
            return direct(args);
        };

        let inlined_before = self.inlined;
        self.stack.push(symbol.clone());
        let body = self.inline_within(&callee.body, budget / 2);
        self.stack.pop();

        // Substitution must not duplicate a call argument, counting uses in the
        // body as expanded by nested inlining.
        let duplicates_call = args
            .iter()
            .enumerate()
            .any(|(i, arg)| arg.contains_call() && arg_uses(&body, i) > 1);
        if duplicates_call {
            self.inlined = inlined_before;
            return direct(args);
        }
        self.inlined += 1;
        body.substitute_args(&args)
    }

    fn candidate(
        &self,
        symbol: &str,
        binary: Option<&str>,
        nargs: usize,
        budget: usize,
    ) -> Option<std::sync::Arc<IndexedFunction>> {
        if self.stack.iter().any(|s| s == symbol) {
            return None;
        }
        let callee = self.resolver.resolve(symbol, binary)?;
        if callee.params != nargs
            || callee.cost() > budget
            || callee.body.validate_body(callee.params).is_err()
        {
            return None;
        }
        Some(callee)
    }
}

fn arg_uses(body: &Expr, index: usize) -> usize {
    if let Expr::Arg(i) = body {
        return usize::from(*i == index);
    }
    let mut uses = 0;
    body.for_each_child(|child| uses += arg_uses(child, index));
    uses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::BitcodeIndex;

    fn resolver() -> SymbolResolver {
        let index = BitcodeIndex::new("kiln")
            .with_function(IndexedFunction::new(
                "int8pl",
                2,
                Expr::add(Expr::arg(0), Expr::arg(1)),
            ))
            .with_function(IndexedFunction::new(
                "twice",
                1,
                Expr::call("int8pl", vec![Expr::arg(0), Expr::arg(0)]),
            ))
            .with_function(IndexedFunction::new(
                "loop_a",
                1,
                Expr::call("loop_b", vec![Expr::arg(0)]),
            ))
            .with_function(IndexedFunction::new(
                "loop_b",
                1,
                Expr::call("loop_a", vec![Expr::arg(0)]),
            ))
            .with_function(IndexedFunction::new(
                "dbl",
                1,
                Expr::add(Expr::arg(0), Expr::arg(0)),
            ))
            .with_function(IndexedFunction::new(
                "wrap",
                1,
                Expr::call("dbl", vec![Expr::arg(0)]),
            ));
        SymbolResolver::new(index, None)
    }

    #[test]
    fn test_inlines_simple_call() {
        let resolver = resolver();
        let mut inliner = Inliner::new(&resolver, DEFAULT_INLINE_COST_LIMIT);
        let expr = Expr::call("int8pl", vec![Expr::field(0, 0), Expr::int(1)]);
        assert_eq!(
            inliner.inline(&expr),
            Expr::add(Expr::field(0, 0), Expr::int(1))
        );
        assert_eq!(inliner.inlined_calls(), 1);
    }

    #[test]
    fn test_inlines_nested_bodies() {
        let resolver = resolver();
        let mut inliner = Inliner::new(&resolver, DEFAULT_INLINE_COST_LIMIT);
        let expr = Expr::call("twice", vec![Expr::field(0, 1)]);
        assert_eq!(
            inliner.inline(&expr),
            Expr::add(Expr::field(0, 1), Expr::field(0, 1))
        );
        assert_eq!(inliner.inlined_calls(), 2);
    }

    #[test]
    fn test_budget_limits_inlining() {
        let resolver = resolver();
        let mut inliner = Inliner::new(&resolver, 2);
        let expr = Expr::call("int8pl", vec![Expr::int(1), Expr::int(2)]);
        assert_eq!(inliner.inline(&expr), expr);
        assert_eq!(inliner.inlined_calls(), 0);
    }

    #[test]
    fn test_budget_decays_with_depth() {
        let resolver = resolver();
        // Enough for `twice` (3 nodes) but not for its callee at half budget.
        let mut inliner = Inliner::new(&resolver, 4);
        let expr = Expr::call("twice", vec![Expr::int(5)]);
        assert_eq!(
            inliner.inline(&expr),
            Expr::call("int8pl", vec![Expr::int(5), Expr::int(5)])
        );
    }

    #[test]
    fn test_recursion_is_not_inlined_forever() {
        let resolver = resolver();
        let mut inliner = Inliner::new(&resolver, 1 << 20);
        let out = inliner.inline(&Expr::call("loop_a", vec![Expr::int(1)]));
        assert!(out.contains_call());
        assert_eq!(inliner.inlined_calls(), 2);
    }

    #[test]
    fn test_does_not_duplicate_call_arguments() {
        let resolver = resolver();
        let mut inliner = Inliner::new(&resolver, DEFAULT_INLINE_COST_LIMIT);
        let opaque = Expr::call("unindexed", vec![]);
        let out = inliner.inline(&Expr::call("twice", vec![opaque.clone()]));
        assert_eq!(out, Expr::call("twice", vec![opaque]));
    }

    #[test]
    fn test_nested_body_does_not_duplicate_call_arguments() {
        let resolver = resolver();
        let mut inliner = Inliner::new(&resolver, DEFAULT_INLINE_COST_LIMIT);
        let counted = Expr::call("counted", vec![]);
        let expr = Expr::call("wrap", vec![counted.clone()]);
        let out = inliner.inline(&expr);
        assert_eq!(out, expr);
        assert_eq!(call_count(&out, "counted"), 1);
        assert_eq!(inliner.inlined_calls(), 0);

        let out = inliner.inline(&Expr::call("wrap", vec![Expr::field(0, 0)]));
        assert_eq!(out, Expr::add(Expr::field(0, 0), Expr::field(0, 0)));
        assert_eq!(inliner.inlined_calls(), 2);
    }

    fn call_count(expr: &Expr, symbol: &str) -> usize {
        let mut count = match expr {
            Expr::Call { symbol: s, .. } if s == symbol => 1,
            _ => 0,
        };
        expr.for_each_child(|child| count += call_count(child, symbol));
        count
    }

    #[test]
    fn test_unresolved_call_kept() {
        let resolver = SymbolResolver::empty();
        let mut inliner = Inliner::new(&resolver, DEFAULT_INLINE_COST_LIMIT);
        let expr = Expr::gt(Expr::call("int8abs", vec![Expr::field(0, 0)]), Expr::int(3));
        assert_eq!(inliner.inline(&expr), expr);
    }
}
