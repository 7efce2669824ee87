//! Expression trees submitted by the engine for evaluation or JIT compilation.

use std::ops;

use serde::{Deserialize, Serialize};

use crate::datum::Datum;
use crate::error::ExprError;
use crate::native::NativeSymbols;

/// An expression tree node.
///
/// Expressions are evaluated against a tuple of input rows (e.g., the outer and inner
/// row of a join qual) and produce one `i64` slot value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Literal(Datum),
    Field {
        param_idx: usize,
        field_idx: usize,
    },
    /// Positional argument of an indexed function body. Only valid inside bodies
    /// loaded from a bitcode index, where inlining replaces it with the call argument.
    Arg(usize),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    Lt(Box<Expr>, Box<Expr>),
    Le(Box<Expr>, Box<Expr>),
    Gt(Box<Expr>, Box<Expr>),
    Ge(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Abs(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Mod(Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),

    If {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },

    IsNull(Box<Expr>),

    IsNotNull(Box<Expr>),

    Min(Box<Expr>, Box<Expr>),

    Max(Box<Expr>, Box<Expr>),

    /// Call of an engine or extension function.
    ///
    /// `binary` names the binary that owns `symbol` when it is not the engine itself.
    Call {
        symbol: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        binary: Option<String>,
        #[serde(default)]
        args: Vec<Expr>,
    },
}

impl Expr {
    // Constructors for common expressions

    pub fn literal(value: Datum) -> Self {
        Expr::Literal(value)
    }

    pub fn int(value: i64) -> Self {
        Expr::Literal(Datum::Int(value))
    }

    pub fn bool(value: bool) -> Self {
        Expr::Literal(Datum::Bool(value))
    }

    pub fn null() -> Self {
        Expr::Literal(Datum::Null)
    }

    pub fn field(param_idx: usize, field_idx: usize) -> Self {
        Expr::Field {
            param_idx,
            field_idx,
        }
    }

    pub fn arg(idx: usize) -> Self {
        Expr::Arg(idx)
    }

    pub fn eq(left: Expr, right: Expr) -> Self {
        Expr::Eq(Box::new(left), Box::new(right))
    }

    pub fn ne(left: Expr, right: Expr) -> Self {
        Expr::Ne(Box::new(left), Box::new(right))
    }

    pub fn lt(left: Expr, right: Expr) -> Self {
        Expr::Lt(Box::new(left), Box::new(right))
    }

    pub fn le(left: Expr, right: Expr) -> Self {
        Expr::Le(Box::new(left), Box::new(right))
    }

    pub fn gt(left: Expr, right: Expr) -> Self {
        Expr::Gt(Box::new(left), Box::new(right))
    }

    pub fn ge(left: Expr, right: Expr) -> Self {
        Expr::Ge(Box::new(left), Box::new(right))
    }

    pub fn and(left: Expr, right: Expr) -> Self {
        Expr::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: Expr, right: Expr) -> Self {
        Expr::Or(Box::new(left), Box::new(right))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(expr: Expr) -> Self {
        Expr::Not(Box::new(expr))
    }

    pub fn abs(expr: Expr) -> Self {
        Expr::Abs(Box::new(expr))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn add(left: Expr, right: Expr) -> Self {
        Expr::Add(Box::new(left), Box::new(right))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn sub(left: Expr, right: Expr) -> Self {
        Expr::Sub(Box::new(left), Box::new(right))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn mul(left: Expr, right: Expr) -> Self {
        Expr::Mul(Box::new(left), Box::new(right))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn div(left: Expr, right: Expr) -> Self {
        Expr::Div(Box::new(left), Box::new(right))
    }

    pub fn modulo(left: Expr, right: Expr) -> Self {
        Expr::Mod(Box::new(left), Box::new(right))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn neg(expr: Expr) -> Self {
        Expr::Neg(Box::new(expr))
    }

    pub fn if_then_else(cond: Expr, then_expr: Expr, else_expr: Expr) -> Self {
        Expr::If {
            cond: Box::new(cond),
            then_expr: Box::new(then_expr),
            else_expr: Box::new(else_expr),
        }
    }

    pub fn is_null(expr: Expr) -> Self {
        Expr::IsNull(Box::new(expr))
    }

    pub fn is_not_null(expr: Expr) -> Self {
        Expr::IsNotNull(Box::new(expr))
    }

    pub fn min(left: Expr, right: Expr) -> Self {
        Expr::Min(Box::new(left), Box::new(right))
    }

    pub fn max(left: Expr, right: Expr) -> Self {
        Expr::Max(Box::new(left), Box::new(right))
    }

    /// Call of an engine function.
    pub fn call(symbol: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            symbol: symbol.into(),
            binary: None,
            args,
        }
    }

    /// Call of a function owned by the extension binary `binary`.
    pub fn call_in(symbol: impl Into<String>, binary: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            symbol: symbol.into(),
            binary: Some(binary.into()),
            args,
        }
    }

    /// Visits the direct children of this node in evaluation order.
    pub fn for_each_child(&self, mut f: impl FnMut(&Expr)) {
        use Expr::*;
        match self {
            Literal(_) | Field { .. } | Arg(_) => {}
            Eq(l, r) | Ne(l, r) | Lt(l, r) | Le(l, r) | Gt(l, r) | Ge(l, r) | And(l, r)
            | Or(l, r) | Add(l, r) | Sub(l, r) | Mul(l, r) | Div(l, r) | Mod(l, r)
            | Min(l, r) | Max(l, r) => {
                f(l);
                f(r);
            }
            Not(e) | Abs(e) | Neg(e) | IsNull(e) | IsNotNull(e) => f(e),
            If {
                cond,
                then_expr,
                else_expr,
            } => {
                f(cond);
                f(then_expr);
                f(else_expr);
            }
            Call { args, .. } => args.iter().for_each(f),
        }
    }

    /// Rebuilds this node with every direct child replaced by `f(child)`.
    pub fn map_children(&self, mut f: impl FnMut(&Expr) -> Expr) -> Expr {
        use Expr::*;
        let mut bx = |e: &Expr| Box::new(f(e));
        match self {
            Literal(_) | Field { .. } | Arg(_) => self.clone(),
            Eq(l, r) => Eq(bx(l), bx(r)),
            Ne(l, r) => Ne(bx(l), bx(r)),
            Lt(l, r) => Lt(bx(l), bx(r)),
            Le(l, r) => Le(bx(l), bx(r)),
            Gt(l, r) => Gt(bx(l), bx(r)),
            Ge(l, r) => Ge(bx(l), bx(r)),
            And(l, r) => And(bx(l), bx(r)),
            Or(l, r) => Or(bx(l), bx(r)),
            Add(l, r) => Add(bx(l), bx(r)),
            Sub(l, r) => Sub(bx(l), bx(r)),
            Mul(l, r) => Mul(bx(l), bx(r)),
            Div(l, r) => Div(bx(l), bx(r)),
            Mod(l, r) => Mod(bx(l), bx(r)),
            Min(l, r) => Min(bx(l), bx(r)),
            Max(l, r) => Max(bx(l), bx(r)),
            Not(e) => Not(bx(e)),
            Abs(e) => Abs(bx(e)),
            Neg(e) => Neg(bx(e)),
            IsNull(e) => IsNull(bx(e)),
            IsNotNull(e) => IsNotNull(bx(e)),
            If {
                cond,
                then_expr,
                else_expr,
            } => If {
                cond: bx(cond),
                then_expr: bx(then_expr),
                else_expr: bx(else_expr),
            },
            Call {
                symbol,
                binary,
                args,
            } => Call {
                symbol: symbol.clone(),
                binary: binary.clone(),
                args: args.iter().map(|a| *bx(a)).collect(),
            },
        }
    }

    /// Number of nodes in the tree. Used as the inlining cost of a function body.
    pub fn node_count(&self) -> usize {
        let mut count = 1;
        self.for_each_child(|child| count += child.node_count());
        count
    }

    /// Returns true if evaluating this expression may call out of the generated code.
    pub fn contains_call(&self) -> bool {
        if matches!(self, Expr::Call { .. }) {
            return true;
        }
        let mut found = false;
        self.for_each_child(|child| found = found || child.contains_call());
        found
    }

    /// Replaces every `Arg(i)` with `args[i]`.
    ///
    /// Callers validate the body against `args.len()` first; an out-of-range argument
    /// is left untouched.
    pub fn substitute_args(&self, args: &[Expr]) -> Expr {
        match self {
            Expr::Arg(i) => args.get(*i).cloned().unwrap_or(Expr::Arg(*i)),
            _ => self.map_children(|child| child.substitute_args(args)),
        }
    }

    /// Validates a top-level expression evaluated over `arity` input rows.
    pub fn validate(&self, arity: usize) -> Result<(), ExprError> {
        match self {
            Expr::Field { param_idx, .. } if *param_idx >= arity => {
                Err(ExprError::ParamOutOfRange {
                    param_idx: *param_idx,
                    arity,
                })
            }
            Expr::Arg(i) => Err(ExprError::UnboundArg(*i)),
            Expr::Call { symbol, .. } if symbol.is_empty() => Err(ExprError::EmptySymbol),
            _ => {
                let mut result = Ok(());
                self.for_each_child(|child| {
                    if result.is_ok() {
                        result = child.validate(arity);
                    }
                });
                result
            }
        }
    }

    /// Validates a function body taking `params` positional arguments.
    ///
    /// Bodies never read input rows directly.
    pub fn validate_body(&self, params: usize) -> Result<(), ExprError> {
        match self {
            Expr::Field { param_idx, .. } => Err(ExprError::ParamOutOfRange {
                param_idx: *param_idx,
                arity: 0,
            }),
            Expr::Arg(i) if *i >= params => Err(ExprError::ArgOutOfRange { index: *i, params }),
            Expr::Call { symbol, .. } if symbol.is_empty() => Err(ExprError::EmptySymbol),
            _ => {
                let mut result = Ok(());
                self.for_each_child(|child| {
                    if result.is_ok() {
                        result = child.validate_body(params);
                    }
                });
                result
            }
        }
    }

    /// Checks that every call targets a registered native function with a matching
    /// argument count, so a direct call can always be emitted.
    pub fn check_calls(&self, natives: &NativeSymbols) -> Result<(), ExprError> {
        if let Expr::Call { symbol, args, .. } = self {
            let native = natives
                .get(symbol)
                .ok_or_else(|| ExprError::UnknownFunction(symbol.clone()))?;
            if native.arity != args.len() {
                return Err(ExprError::ArgumentCount {
                    symbol: symbol.clone(),
                    expected: native.arity,
                    got: args.len(),
                });
            }
        }
        let mut result = Ok(());
        self.for_each_child(|child| {
            if result.is_ok() {
                result = child.check_calls(natives);
            }
        });
        result
    }
}

// Implement std::ops traits for operator syntax

impl ops::Not for Expr {
    type Output = Expr;

    fn not(self) -> Self::Output {
        Expr::Not(Box::new(self))
    }
}

impl ops::Add for Expr {
    type Output = Expr;

    fn add(self, rhs: Self) -> Self::Output {
        Expr::Add(Box::new(self), Box::new(rhs))
    }
}

impl ops::Sub for Expr {
    type Output = Expr;

    fn sub(self, rhs: Self) -> Self::Output {
        Expr::Sub(Box::new(self), Box::new(rhs))
    }
}

impl ops::Mul for Expr {
    type Output = Expr;

    fn mul(self, rhs: Self) -> Self::Output {
        Expr::Mul(Box::new(self), Box::new(rhs))
    }
}

impl ops::Div for Expr {
    type Output = Expr;

    fn div(self, rhs: Self) -> Self::Output {
        Expr::Div(Box::new(self), Box::new(rhs))
    }
}

impl ops::Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Self::Output {
        Expr::Neg(Box::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_count() {
        let e = Expr::add(Expr::field(0, 0), Expr::mul(Expr::int(2), Expr::field(0, 1)));
        assert_eq!(e.node_count(), 5);
    }

    #[test]
    fn test_substitute_args() {
        let body = Expr::add(Expr::arg(0), Expr::arg(1));
        let inlined = body.substitute_args(&[Expr::field(0, 3), Expr::int(1)]);
        assert_eq!(inlined, Expr::add(Expr::field(0, 3), Expr::int(1)));
    }

    #[test]
    fn test_validate_rejects_out_of_range_param() {
        let e = Expr::eq(Expr::field(0, 0), Expr::field(2, 0));
        assert_eq!(
            e.validate(2),
            Err(ExprError::ParamOutOfRange {
                param_idx: 2,
                arity: 2
            })
        );
        assert!(e.validate(3).is_ok());
    }

    #[test]
    fn test_validate_rejects_top_level_arg() {
        let e = Expr::add(Expr::arg(0), Expr::int(1));
        assert_eq!(e.validate(1), Err(ExprError::UnboundArg(0)));
    }

    #[test]
    fn test_validate_body() {
        let body = Expr::add(Expr::arg(0), Expr::arg(1));
        assert!(body.validate_body(2).is_ok());
        assert_eq!(
            body.validate_body(1),
            Err(ExprError::ArgOutOfRange {
                index: 1,
                params: 1
            })
        );
        assert!(Expr::field(0, 0).validate_body(1).is_err());
    }

    #[test]
    fn test_contains_call() {
        assert!(!Expr::add(Expr::int(1), Expr::int(2)).contains_call());
        assert!(Expr::neg(Expr::call("int8abs", vec![Expr::int(1)])).contains_call());
    }

    #[test]
    fn test_operator_syntax() {
        let e = Expr::field(0, 0) + Expr::int(1);
        assert_eq!(e, Expr::add(Expr::field(0, 0), Expr::int(1)));
        assert_eq!(!Expr::bool(true), Expr::not(Expr::bool(true)));
    }

    #[test]
    fn test_toml_body_deserialization() {
        #[derive(Deserialize)]
        struct Holder {
            body: Expr,
        }
        let holder: Holder = toml::from_str(
            r#"
            body = { add = [{ arg = 0 }, { literal = { int = 1 } }] }
            "#,
        )
        .unwrap();
        assert_eq!(holder.body, Expr::add(Expr::arg(0), Expr::int(1)));
    }
}
