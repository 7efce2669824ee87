//! Interpreted expression evaluation.
//!
//! This is the engine's path whenever a unit of work runs without JIT. Semantics match
//! the generated code bit for bit: integer arithmetic wraps, division or remainder by
//! zero (and `i64::MIN / -1`) yield `NULL`, and booleans are plain `0`/`1` slots.


use crate::datum::NULL_SENTINEL;
use crate::expr::Expr;
use crate::native::NativeSymbols;

/// Context for expression evaluation.
pub struct EvalContext<'a> {
    /// The tuple of decoded input rows being matched, one slot per attribute.
    pub rows: &'a [&'a [i64]],
    /// Functions reachable through [`Expr::Call`].
    pub natives: &'a NativeSymbols,
}

impl<'a> EvalContext<'a> {
    /// Creates a new evaluation context.
    pub fn new(rows: &'a [&'a [i64]], natives: &'a NativeSymbols) -> Self {
        Self { rows, natives }
    }

    /// Reads a slot from the tuple; missing rows or attributes read as `NULL`.
    pub fn field(&self, param_idx: usize, field_idx: usize) -> i64 {
        self.rows
            .get(param_idx)
            .and_then(|row| row.get(field_idx))
            .copied()
            .unwrap_or(NULL_SENTINEL)
    }
}

/// Evaluates an expression in the given context.
pub fn eval_expr(expr: &Expr, ctx: &EvalContext) -> i64 {
    match expr {
        Expr::Literal(v) => v.to_slot(),

        Expr::Field {
            param_idx,
            field_idx,
        } => ctx.field(*param_idx, *field_idx),

        // Arguments only exist inside function bodies, which are inlined before use.
        Expr::Arg(_) => NULL_SENTINEL,

        Expr::Eq(l, r) => cmp(l, r, ctx, |a, b| a == b),
        Expr::Ne(l, r) => cmp(l, r, ctx, |a, b| a != b),
        Expr::Lt(l, r) => cmp(l, r, ctx, |a, b| a < b),
        Expr::Le(l, r) => cmp(l, r, ctx, |a, b| a <= b),
        Expr::Gt(l, r) => cmp(l, r, ctx, |a, b| a > b),
        Expr::Ge(l, r) => cmp(l, r, ctx, |a, b| a >= b),

        Expr::And(l, r) => eval_expr(l, ctx) & eval_expr(r, ctx),
        Expr::Or(l, r) => eval_expr(l, ctx) | eval_expr(r, ctx),
        Expr::Not(inner) => eval_expr(inner, ctx) ^ 1,

        Expr::Add(l, r) => eval_expr(l, ctx).wrapping_add(eval_expr(r, ctx)),
        Expr::Sub(l, r) => eval_expr(l, ctx).wrapping_sub(eval_expr(r, ctx)),
        Expr::Mul(l, r) => eval_expr(l, ctx).wrapping_mul(eval_expr(r, ctx)),
        Expr::Div(l, r) => eval_expr(l, ctx)
            .checked_div(eval_expr(r, ctx))
            .unwrap_or(NULL_SENTINEL),
        Expr::Mod(l, r) => eval_expr(l, ctx)
            .checked_rem(eval_expr(r, ctx))
            .unwrap_or(NULL_SENTINEL),
        Expr::Neg(inner) => eval_expr(inner, ctx).wrapping_neg(),
        Expr::Abs(inner) => eval_expr(inner, ctx).wrapping_abs(),

        Expr::Min(l, r) => eval_expr(l, ctx).min(eval_expr(r, ctx)),
        Expr::Max(l, r) => eval_expr(l, ctx).max(eval_expr(r, ctx)),

        Expr::IsNull(inner) => (eval_expr(inner, ctx) == NULL_SENTINEL) as i64,
        Expr::IsNotNull(inner) => (eval_expr(inner, ctx) != NULL_SENTINEL) as i64,

        // Both branches are evaluated, as in the generated code's `select`.
        Expr::If {
            cond,
            then_expr,
            else_expr,
        } => {
            let c = eval_expr(cond, ctx);
            let t = eval_expr(then_expr, ctx);
            let e = eval_expr(else_expr, ctx);
            if c != 0 {
                t
            } else {
                e
            }
        }

        Expr::Call { symbol, args, .. } => {
            let Some(native) = ctx.natives.get(symbol) else {
                return NULL_SENTINEL;
            };
            let values: Vec<i64> = args.iter().map(|a| eval_expr(a, ctx)).collect();
            if values.len() != native.arity {
                return NULL_SENTINEL;
            }
            native.invoke(&values)
        }
    }
}

fn cmp(left: &Expr, right: &Expr, ctx: &EvalContext, op: impl FnOnce(i64, i64) -> bool) -> i64 {
    let l = eval_expr(left, ctx);
    let r = eval_expr(right, ctx);
    op(l, r) as i64
}
