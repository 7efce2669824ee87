//! Error types for engine-submitted logic.

use thiserror::Error;

/// A structural problem in an expression or tuple descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    #[error("field references parameter {param_idx} but the expression takes {arity} rows")]
    ParamOutOfRange { param_idx: usize, arity: usize },

    #[error("argument reference Arg({0}) outside of a function body")]
    UnboundArg(usize),

    #[error("argument reference Arg({index}) but the function takes {params} arguments")]
    ArgOutOfRange { index: usize, params: usize },

    #[error("call with an empty symbol name")]
    EmptySymbol,

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("function {symbol} takes {expected} arguments, called with {got}")]
    ArgumentCount {
        symbol: String,
        expected: usize,
        got: usize,
    },

    #[error("tuple descriptor has no attributes")]
    EmptyTuple,
}
