//! In-memory provider for exercising dispatch without a real backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kiln_core::{Definition, DefinitionKind};

use crate::error::{JitError, Result};
use crate::instrumentation::JitInstrumentation;
use crate::provider::{ContextOptions, JitProvider, ProviderContext, ProviderRegistry};

/// Value returned by every mock expression function.
pub const MOCK_EXPR_RESULT: i64 = 42;

extern "C" fn mock_expr(_rows: *const *const i64) -> i64 {
    MOCK_EXPR_RESULT
}

extern "C" fn mock_deform(_row: *const u8, out: *mut i64) {
    // SAFETY: callers guarantee at least one output slot for non-empty descriptors.
    unsafe { *out = MOCK_EXPR_RESULT }
}

#[derive(Debug, Default)]
pub struct MockCounters {
    pub contexts: AtomicUsize,
    pub defined: AtomicUsize,
    pub materializations: AtomicUsize,
    pub released: AtomicUsize,
}

impl MockCounters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct MockProvider {
    counters: Arc<MockCounters>,
    fail_materialize: bool,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            counters: Arc::default(),
            fail_materialize: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_materialize: true,
            ..Self::new()
        }
    }

    pub fn counters(&self) -> Arc<MockCounters> {
        self.counters.clone()
    }

    /// A registry whose `"mock"` entry hands out `self`.
    pub fn registry(self) -> (ProviderRegistry, Arc<MockCounters>) {
        let counters = self.counters();
        let provider: Arc<dyn JitProvider> = Arc::new(self);
        let registry = ProviderRegistry::new().with("mock", move || Ok(provider.clone()));
        (registry, counters)
    }
}

impl JitProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn create_context(&self, _options: ContextOptions) -> Result<Box<dyn ProviderContext>> {
        self.counters.contexts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockContext {
            counters: self.counters.clone(),
            fail_materialize: self.fail_materialize,
            pending: Vec::new(),
            entries: HashMap::new(),
        }))
    }
}

struct MockContext {
    counters: Arc<MockCounters>,
    fail_materialize: bool,
    pending: Vec<(String, DefinitionKind)>,
    entries: HashMap<String, usize>,
}

impl ProviderContext for MockContext {
    fn define(&mut self, symbol: &str, definition: &Definition) -> Result<()> {
        self.counters.defined.fetch_add(1, Ordering::SeqCst);
        self.pending.push((symbol.to_string(), definition.kind()));
        Ok(())
    }

    fn materialize(&mut self, instr: &mut JitInstrumentation) -> Result<()> {
        if self.fail_materialize {
            return Err(JitError::materialization("mock backend failure"));
        }
        self.counters.materializations.fetch_add(1, Ordering::SeqCst);
        for (symbol, kind) in self.pending.drain(..) {
            let entry = match kind {
                DefinitionKind::Expr => mock_expr as usize,
                DefinitionKind::Deform => mock_deform as usize,
            };
            self.entries.insert(symbol, entry);
        }
        instr.emission += Duration::from_micros(1);
        Ok(())
    }

    fn resolve(&self, symbol: &str) -> Option<*const u8> {
        self.entries.get(symbol).map(|addr| *addr as *const u8)
    }

    fn release(&mut self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
        self.entries.clear();
        self.pending.clear();
    }
}
