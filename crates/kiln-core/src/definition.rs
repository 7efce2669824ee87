//! Logical function definitions submitted for native compilation.

use crate::error::ExprError;
use crate::expr::Expr;
use crate::native::NativeSymbols;
use crate::tuple::TupleDesc;

/// The two shapes of generated function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefinitionKind {
    /// `fn(*const *const i64) -> i64`: evaluates an expression over input rows.
    Expr,
    /// `fn(*const u8, *mut i64)`: decodes one raw row into slots.
    Deform,
}

impl DefinitionKind {
    /// Short prefix used in generated symbol names.
    pub fn prefix(self) -> &'static str {
        match self {
            DefinitionKind::Expr => "evalexpr",
            DefinitionKind::Deform => "deform",
        }
    }
}

/// A piece of engine logic to specialize.
#[derive(Debug, Clone, PartialEq)]
pub enum Definition {
    Expr { expr: Expr, arity: usize },
    Deform(TupleDesc),
}

impl Definition {
    pub fn expr(expr: Expr, arity: usize) -> Self {
        Definition::Expr { expr, arity }
    }

    pub fn deform(desc: TupleDesc) -> Self {
        Definition::Deform(desc)
    }

    pub fn kind(&self) -> DefinitionKind {
        match self {
            Definition::Expr { .. } => DefinitionKind::Expr,
            Definition::Deform(_) => DefinitionKind::Deform,
        }
    }

    /// Checks that the definition can be compiled against `natives`.
    pub fn validate(&self, natives: &NativeSymbols) -> Result<(), ExprError> {
        match self {
            Definition::Expr { expr, arity } => {
                expr.validate(*arity)?;
                expr.check_calls(natives)
            }
            Definition::Deform(desc) => desc.validate(),
        }
    }
}
