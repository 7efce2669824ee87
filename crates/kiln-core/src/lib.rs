//! Engine-side building blocks for Kiln.
//!
//! The execution engine describes the logic it wants specialized with the types in
//! this crate: an [`Expr`] tree evaluated over flat `i64` row slots, or a [`TupleDesc`]
//! describing how raw rows are decoded into those slots. Both have an interpreted
//! implementation here, which is always a legal fallback when no JIT is available.
//!
//! # Slot representation
//!
//! Every value is carried as one `i64`. Booleans are `0`/`1`, and SQL `NULL` is
//! [`NULL_SENTINEL`]. Native code generated for an [`Expr`] sees exactly the same
//! representation, so interpreted and compiled results are interchangeable.

mod datum;
mod definition;
mod error;
pub mod eval;
mod expr;
mod native;
mod tuple;

pub use datum::{Datum, NULL_SENTINEL};
pub use definition::{Definition, DefinitionKind};
pub use error::ExprError;
pub use eval::{eval_expr, EvalContext};
pub use expr::Expr;
pub use native::{native_args, NativeFn, NativeFunction, NativeSymbols};
pub use tuple::{AttrDesc, AttrType, TupleDesc};
