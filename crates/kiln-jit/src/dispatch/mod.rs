//! The engine-facing JIT facade.
//!
//! Every entry point here degrades to "no JIT" instead of failing: if JIT is off for
//! the unit of work, or the provider cannot be loaded, callers get `None` and run the
//! interpreted path. Only failures the engine caused (invalid definitions) or the
//! backend cannot recover from (materialization) surface as errors.

#[cfg(test)]
mod tests;

use std::sync::Arc;

use kiln_config::JitConfig;
use kiln_core::{Definition, Expr, NativeSymbols, TupleDesc};
use tracing::{debug, info, warn};

use crate::context::{ContextId, FunctionHandle, JitContext, LogicalId};
use crate::error::Result;
use crate::guard;
use crate::loader::ProviderLoader;
use crate::owner::WorkUnit;
use crate::policy::JitFlags;
use crate::provider::ContextOptions;
use crate::resolver::SymbolResolver;

/// JIT dispatch for one engine instance.
#[derive(Debug, Clone)]
pub struct Jit {
    config: JitConfig,
    loader: Arc<ProviderLoader>,
    natives: Arc<NativeSymbols>,
    resolver: Arc<SymbolResolver>,
}

impl Jit {
    pub fn new(
        config: JitConfig,
        loader: Arc<ProviderLoader>,
        natives: Arc<NativeSymbols>,
        resolver: Arc<SymbolResolver>,
    ) -> Self {
        Self {
            config,
            loader,
            natives,
            resolver,
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn natives(&self) -> &Arc<NativeSymbols> {
        &self.natives
    }

    pub fn resolver(&self) -> &Arc<SymbolResolver> {
        &self.resolver
    }

    pub fn loader(&self) -> &Arc<ProviderLoader> {
        &self.loader
    }

    /// JIT flags for `unit`, derived from its cost on first use.
    pub fn flags_for(&self, unit: &mut WorkUnit) -> JitFlags {
        unit.flags_or_init(|cost| JitFlags::for_cost(cost, &self.config))
    }

    /// Returns the unit's JIT context, creating it on first use.
    ///
    /// `None` means the unit runs interpreted: the policy said skip, the provider
    /// is unavailable, or the unit's context was already released.
    pub fn start<'u>(&self, unit: &'u mut WorkUnit) -> Option<&'u JitContext> {
        if unit.owner().is_released() {
            return None;
        }
        if unit.owner().has_jit() {
            return unit.jit_context().filter(|ctx| !ctx.is_released());
        }

        let flags = self.flags_for(unit);
        if !flags.perform {
            return None;
        }

        let provider = match self.loader.ensure_loaded(&self.config.provider) {
            Ok(provider) => provider,
            Err(e) => {
                debug!(unit = unit.name(), "running interpreted: {e}");
                return None;
            }
        };

        let id = ContextId::next();
        let options = ContextOptions {
            id,
            flags,
            natives: self.natives.clone(),
            resolver: self.resolver.clone(),
            inline_cost_limit: self.config.inline_cost_limit,
            dump_ir: self.config.dump_ir,
        };
        let backend = match provider.create_context(options) {
            Ok(backend) => backend,
            Err(e) => {
                warn!(unit = unit.name(), provider = provider.name(), "cannot create JIT context: {e}");
                return None;
            }
        };

        info!(
            event = "jit_context_created",
            context = id.as_u64(),
            provider = provider.name(),
            unit = unit.name(),
            cost = unit.cost(),
            decision = %flags.decision(),
            "created JIT context"
        );
        let context = JitContext::new(id, flags, self.natives.clone(), backend);
        Some(unit.owner_mut().remember_jit(context))
    }

    /// Emits `definition` into `context` under `id`, or returns the existing handle.
    pub fn emit_or_get(
        &self,
        context: &JitContext,
        id: impl Into<LogicalId>,
        definition: &Definition,
    ) -> Result<FunctionHandle> {
        context.emit_or_get(id, definition)
    }

    /// Releases the unit's JIT context early. Further lookups fail.
    pub fn release(&self, unit: &mut WorkUnit) {
        unit.owner_mut().release_jit();
    }

    /// Compiles an expression for the unit if expression JIT applies to it.
    ///
    /// `Ok(None)` means the engine should interpret the expression.
    pub fn compile_expr(
        &self,
        unit: &mut WorkUnit,
        id: impl Into<LogicalId>,
        expr: &Expr,
        arity: usize,
    ) -> Result<Option<FunctionHandle>> {
        if !self.flags_for(unit).expressions {
            return Ok(None);
        }
        let Some(context) = self.start(unit) else {
            return Ok(None);
        };
        context
            .emit_or_get(id, &Definition::expr(expr.clone(), arity))
            .map(Some)
    }

    /// Compiles a tuple deformer for the unit if deform JIT applies to it.
    pub fn compile_deform(
        &self,
        unit: &mut WorkUnit,
        id: impl Into<LogicalId>,
        desc: &TupleDesc,
    ) -> Result<Option<FunctionHandle>> {
        if !self.flags_for(unit).deform {
            return Ok(None);
        }
        let Some(context) = self.start(unit) else {
            return Ok(None);
        };
        context
            .emit_or_get(id, &Definition::deform(desc.clone()))
            .map(Some)
    }

    /// Clears per-thread JIT state after a unit of work was aborted.
    pub fn reset_after_error(&self) {
        guard::reset_after_error();
        if let Some(provider) = self.loader.loaded() {
            provider.reset_after_error();
        }
    }
}
