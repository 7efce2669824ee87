//! Per-context JIT counters and timings.

use std::fmt;
use std::time::Duration;

use crate::policy::JitFlags;

/// Counters and phase timings accumulated by one JIT context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitInstrumentation {
    /// Functions emitted into the context.
    pub created_functions: usize,
    /// Calls replaced by an inlined body.
    pub inlined_calls: usize,
    /// Completed materializations.
    pub batches: usize,
    pub generation: Duration,
    pub inlining: Duration,
    pub optimization: Duration,
    pub emission: Duration,
}

impl JitInstrumentation {
    /// Folds `other` into `self`, e.g. when aggregating parallel workers.
    pub fn add(&mut self, other: &JitInstrumentation) {
        self.created_functions += other.created_functions;
        self.inlined_calls += other.inlined_calls;
        self.batches += other.batches;
        self.generation += other.generation;
        self.inlining += other.inlining;
        self.optimization += other.optimization;
        self.emission += other.emission;
    }

    pub fn total(&self) -> Duration {
        self.generation + self.inlining + self.optimization + self.emission
    }

    /// EXPLAIN-style summary of this context.
    pub fn explain(&self, flags: JitFlags) -> JitExplain<'_> {
        JitExplain { instr: self, flags }
    }
}

/// Display adapter produced by [`JitInstrumentation::explain`].
pub struct JitExplain<'a> {
    instr: &'a JitInstrumentation,
    flags: JitFlags,
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

impl fmt::Display for JitExplain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let i = self.instr;
        writeln!(f, "JIT:")?;
        writeln!(f, "  Functions: {}", i.created_functions)?;
        writeln!(
            f,
            "  Options: Inlining {}, Optimization {}, Expressions {}, Deforming {}",
            self.flags.inline, self.flags.optimize, self.flags.expressions, self.flags.deform
        )?;
        write!(
            f,
            "  Timing: Generation {:.3} ms, Inlining {:.3} ms, Optimization {:.3} ms, Emission {:.3} ms, Total {:.3} ms",
            ms(i.generation),
            ms(i.inlining),
            ms(i.optimization),
            ms(i.emission),
            ms(i.total())
        )
    }
}
