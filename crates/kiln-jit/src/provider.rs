//! The capability set a code-generation backend implements.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use kiln_core::{Definition, NativeSymbols};

use crate::context::ContextId;
use crate::error::Result;
use crate::instrumentation::JitInstrumentation;
use crate::policy::JitFlags;
use crate::resolver::SymbolResolver;

/// Everything a provider needs to set up a backend context.
#[derive(Clone)]
pub struct ContextOptions {
    pub id: ContextId,
    pub flags: JitFlags,
    /// Engine functions generated code may call directly.
    pub natives: Arc<NativeSymbols>,
    pub resolver: Arc<SymbolResolver>,
    pub inline_cost_limit: usize,
    /// Log generated IR at debug level.
    pub dump_ir: bool,
}

impl fmt::Debug for ContextOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextOptions")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .field("natives", &self.natives.len())
            .field("inline_cost_limit", &self.inline_cost_limit)
            .field("dump_ir", &self.dump_ir)
            .finish()
    }
}

/// A code-generation backend.
///
/// Exactly one provider is loaded per process; it creates one backend context per
/// unit of work.
pub trait JitProvider: Send + Sync {
    fn name(&self) -> &str;

    fn create_context(&self, options: ContextOptions) -> Result<Box<dyn ProviderContext>>;

    /// Drops per-thread backend state left over from an aborted unit of work.
    fn reset_after_error(&self) {}
}

/// Backend half of a JIT context.
pub trait ProviderContext: Send {
    /// Adds `definition` to the pending batch under the native symbol `symbol`.
    fn define(&mut self, symbol: &str, definition: &Definition) -> Result<()>;

    /// Compiles every pending definition. Timings are added to `instr`.
    fn materialize(&mut self, instr: &mut JitInstrumentation) -> Result<()>;

    /// Entry point of a materialized symbol.
    fn resolve(&self, symbol: &str) -> Option<*const u8>;

    /// Frees all generated code and backend state. Called at most once.
    fn release(&mut self);
}

/// Constructs a provider on first load.
pub type ProviderFactory =
    Box<dyn Fn() -> std::result::Result<Arc<dyn JitProvider>, String> + Send + Sync>;

/// Providers known to the process, by name.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> std::result::Result<Arc<dyn JitProvider>, String> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn with<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> std::result::Result<Arc<dyn JitProvider>, String> + Send + Sync + 'static,
    {
        self.register(name, factory);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ProviderFactory> {
        self.factories.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
