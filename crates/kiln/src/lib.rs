//! Kiln - JIT compilation dispatch for a database execution engine
//!
//! Zero-wiring API: build a [`Jit`] from configuration, open a [`WorkUnit`] per
//! query execution, and evaluate through [`ExprState`] / [`DeformState`], which run
//! native code when the unit was compiled and the interpreter otherwise.
//!
//! # Example
//!
//! ```
//! use kiln::prelude::*;
//!
//! let jit = kiln::jit_with_config(JitConfig::default().with_thresholds(
//!     CostThreshold::Always,
//!     CostThreshold::Never,
//!     CostThreshold::Never,
//! ));
//! let mut unit = WorkUnit::new("select", 1.0);
//!
//! let mut state = ExprState::new("total", Expr::add(Expr::field(0, 0), Expr::int(2)), 1);
//! state.prepare(&jit, &mut unit).unwrap();
//! assert_eq!(state.eval(&jit, &unit, &[&[40]]).unwrap(), 42);
//! unit.finish();
//! ```

mod builtins;
mod state;

use std::path::Path;
use std::sync::Arc;

use tracing::warn;

pub use kiln_config::{ConfigError, CostThreshold, JitConfig};
pub use kiln_core::{
    eval_expr, native_args, AttrDesc, AttrType, Datum, Definition, EvalContext, Expr, ExprError,
    NativeFn, NativeSymbols, TupleDesc, NULL_SENTINEL,
};
pub use kiln_cranelift::{CraneliftProvider, PROVIDER_NAME};
pub use kiln_jit::{
    BitcodeIndex, ContextId, FunctionHandle, IndexedFunction, Jit, JitContext, JitError,
    JitFlags, JitInstrumentation, JitProvider, LoadError, ProviderLoader, ProviderRegistry,
    ResourceOwner, SymbolResolver, WorkUnit,
};

pub use builtins::engine_index;
pub use state::{DeformState, ExprState};

/// Registry with every provider built into Kiln.
pub fn default_registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    CraneliftProvider::register(&mut registry);
    registry
}

/// The process-wide provider loader, installed with [`default_registry`] on first
/// use.
pub fn global_loader() -> Arc<ProviderLoader> {
    ProviderLoader::global().unwrap_or_else(|| ProviderLoader::install_global(default_registry()))
}

/// Builds the JIT facade from `kiln.toml`, falling back to defaults when the file
/// is missing or invalid.
pub fn jit() -> Jit {
    let config = match JitConfig::load("kiln.toml") {
        Ok(config) => config,
        Err(ConfigError::Io(_)) => JitConfig::default(),
        Err(e) => {
            warn!("ignoring kiln.toml: {e}");
            JitConfig::default()
        }
    };
    jit_with_config(config)
}

/// Builds the JIT facade from a configuration file.
pub fn jit_from_file(path: impl AsRef<Path>) -> Result<Jit, ConfigError> {
    Ok(jit_with_config(JitConfig::load(path)?))
}

/// Builds the JIT facade on the global loader with the engine's builtin natives.
pub fn jit_with_config(config: JitConfig) -> Jit {
    jit_with_loader(config, global_loader(), NativeSymbols::with_builtins())
}

/// Builds the JIT facade on an explicit loader and native table.
pub fn jit_with_loader(
    config: JitConfig,
    loader: Arc<ProviderLoader>,
    natives: NativeSymbols,
) -> Jit {
    #[cfg(feature = "console")]
    kiln_console::init();

    let resolver = SymbolResolver::from_config(&config, engine_index());
    Jit::new(config, loader, Arc::new(natives), Arc::new(resolver))
}

pub mod prelude {
    pub use super::{
        AttrDesc, AttrType, CostThreshold, Datum, DeformState, Expr, ExprState, Jit, JitConfig,
        TupleDesc, WorkUnit, NULL_SENTINEL,
    };
}
