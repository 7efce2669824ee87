//! The Cranelift provider and its per-context backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use cranelift_codegen::Context;
use cranelift_jit::JITModule;
use cranelift_module::{Linkage, Module};
use kiln_core::{Definition, Expr};
use kiln_jit::{
    protected, ContextOptions, Inliner, JitError, JitInstrumentation, JitProvider,
    ProviderContext, ProviderRegistry, Result,
};
use tracing::debug;

use crate::compiler::{build_function, make_jit_module, signature_for};

/// Name the provider registers under.
pub const PROVIDER_NAME: &str = "cranelift";

/// Native code generation with Cranelift.
#[derive(Debug)]
pub struct CraneliftProvider {
    _private: (),
}

impl CraneliftProvider {
    /// Loads the provider, failing if Cranelift does not support the host.
    pub fn load() -> std::result::Result<Self, String> {
        cranelift_native::builder()
            .map(|_| CraneliftProvider { _private: () })
            .map_err(|e| format!("host not supported: {e}"))
    }

    /// Adds the provider to `registry` under [`PROVIDER_NAME`].
    pub fn register(registry: &mut ProviderRegistry) {
        registry.register(PROVIDER_NAME, || {
            Ok(Arc::new(CraneliftProvider::load()?) as Arc<dyn JitProvider>)
        });
    }
}

impl JitProvider for CraneliftProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn create_context(&self, options: ContextOptions) -> Result<Box<dyn ProviderContext>> {
        let module = protected(|| make_jit_module(options.flags.optimize, &options.natives))?;
        Ok(Box::new(CraneliftContext {
            module: Some(module),
            options,
            pending: Vec::new(),
            entries: HashMap::new(),
        }))
    }
}

/// One JIT module holding every function of a context.
///
/// Batches are finalized incrementally; code from earlier batches stays valid until
/// the module is freed on release.
struct CraneliftContext {
    module: Option<JITModule>,
    options: ContextOptions,
    pending: Vec<(String, Definition)>,
    entries: HashMap<String, *const u8>,
}

// SAFETY: the module and the code it owns move with the context; entries point into
// that code. The context is driven by one thread at a time.
unsafe impl Send for CraneliftContext {}

impl CraneliftContext {
    fn released() -> JitError {
        JitError::materialization("backend context already released")
    }
}

/// Inlines resolvable calls when the unit of work asked for it.
fn prepare(
    options: &ContextOptions,
    definition: &Definition,
    instr: &mut JitInstrumentation,
) -> Definition {
    let Definition::Expr { expr, arity } = definition else {
        return definition.clone();
    };
    if !options.flags.inline || !expr.contains_call() {
        return definition.clone();
    }

    let start = Instant::now();
    let mut inliner = Inliner::new(&options.resolver, options.inline_cost_limit);
    let inlined: Expr = inliner.inline(expr);

    // An inlined body may reach a symbol the engine never registered; keep the
    // direct call then.
    if inlined.check_calls(&options.natives).is_err() {
        return definition.clone();
    }
    instr.inlining += start.elapsed();
    instr.inlined_calls += inliner.inlined_calls();
    Definition::expr(inlined, *arity)
}

impl ProviderContext for CraneliftContext {
    fn define(&mut self, symbol: &str, definition: &Definition) -> Result<()> {
        if self.module.is_none() {
            return Err(Self::released());
        }
        self.pending.push((symbol.to_string(), definition.clone()));
        Ok(())
    }

    fn materialize(&mut self, instr: &mut JitInstrumentation) -> Result<()> {
        let module = self.module.as_mut().ok_or_else(Self::released)?;
        let pending = std::mem::take(&mut self.pending);
        let mut compiled = Vec::with_capacity(pending.len());

        for (symbol, definition) in &pending {
            let definition = prepare(&self.options, definition, instr);

            let start = Instant::now();
            let func_id = protected(|| {
                let sig = signature_for(module, &definition);
                module.declare_function(symbol, Linkage::Local, &sig)
            })
            .map_err(|e| JitError::materialization(format!("{symbol}: {e}")))?;
            let func = protected(|| build_function(module, &self.options.natives, &definition, func_id))?;
            instr.generation += start.elapsed();

            if self.options.dump_ir {
                debug!(event = "jit_ir", symbol = %symbol, "\n{func}");
            }

            let start = Instant::now();
            let mut ctx = Context::for_function(func);
            protected(|| module.define_function(func_id, &mut ctx))
                .map_err(|e| JitError::materialization(format!("{symbol}: {e}")))?;
            protected(|| module.clear_context(&mut ctx));
            if self.options.flags.optimize {
                instr.optimization += start.elapsed();
            } else {
                instr.emission += start.elapsed();
            }
            compiled.push((symbol.clone(), func_id));
        }

        let start = Instant::now();
        protected(|| module.finalize_definitions())
            .map_err(|e| JitError::materialization(e.to_string()))?;
        for (symbol, func_id) in compiled {
            let entry = protected(|| module.get_finalized_function(func_id));
            self.entries.insert(symbol, entry);
        }
        instr.emission += start.elapsed();
        Ok(())
    }

    fn resolve(&self, symbol: &str) -> Option<*const u8> {
        self.entries.get(symbol).copied()
    }

    fn release(&mut self) {
        self.entries.clear();
        self.pending.clear();
        if let Some(module) = self.module.take() {
            // SAFETY: entries were cleared above and the owning JitContext refuses
            // lookups once released, so no pointer into this module is used again.
            protected(|| unsafe { module.free_memory() });
        }
    }
}

impl Drop for CraneliftContext {
    fn drop(&mut self) {
        self.release();
    }
}
