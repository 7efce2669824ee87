//! JIT compilation dispatch and lifecycle for the Kiln execution engine.
//!
//! The engine talks to [`Jit`] only. It decides per unit of work whether to generate
//! native code ([`policy`]), loads the configured backend once per process
//! ([`ProviderLoader`]), ties generated code to the unit's [`ResourceOwner`] through a
//! [`JitContext`], and resolves calls to inlinable bodies ([`SymbolResolver`]).
//! Backends implement [`JitProvider`]; calls into them run inside a
//! [`ProtectedRegion`].
//!
//! When anything on the way is unavailable the facade returns `None` and the engine
//! interprets instead, so JIT is never required for correctness.

pub mod context;
pub mod dispatch;
pub mod error;
pub mod guard;
pub mod index;
pub mod inline;
pub mod instrumentation;
pub mod loader;
pub mod owner;
pub mod policy;
pub mod provider;
pub mod resolver;

#[cfg(test)]
mod test_utils;

pub use context::{
    ContextId, ContextState, DeformFn, ExprFn, FunctionHandle, JitContext, LogicalId,
};
pub use dispatch::Jit;
pub use error::{JitError, LoadError, Result};
pub use guard::{
    enter_protected, in_protected_region, leave_protected, protected, ProtectedRegion,
    FOREIGN_FATAL_EXIT_CODE,
};
pub use index::{BitcodeIndex, IndexError, IndexedFunction};
pub use inline::{Inliner, DEFAULT_INLINE_COST_LIMIT};
pub use instrumentation::JitInstrumentation;
pub use loader::ProviderLoader;
pub use owner::{ResourceOwner, WorkUnit};
pub use policy::{decide, Decision, JitFlags};
pub use provider::{ContextOptions, JitProvider, ProviderContext, ProviderFactory, ProviderRegistry};
pub use resolver::SymbolResolver;
