//! Cost-based trigger policy.
//!
//! The planner's estimated cost for a unit of work is compared against three
//! thresholds. Each level implies the previous one, so the result is a staircase:
//! no code generation, plain code generation, optimized code, optimized and inlined.

use std::fmt;

use kiln_config::{CostThreshold, JitConfig};

/// Outcome of the trigger policy for one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Decision {
    Skip,
    Jit,
    JitOptimize,
    JitOptimizeInline,
}

impl Decision {
    pub fn performs(self) -> bool {
        self >= Decision::Jit
    }

    pub fn optimizes(self) -> bool {
        self >= Decision::JitOptimize
    }

    pub fn inlines(self) -> bool {
        self == Decision::JitOptimizeInline
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::Skip => "skip",
            Decision::Jit => "jit",
            Decision::JitOptimize => "jit+optimize",
            Decision::JitOptimizeInline => "jit+optimize+inline",
        };
        f.write_str(s)
    }
}

/// Applies the thresholds to `cost`.
///
/// A higher level is only reached when every lower level is met too, so disabling
/// `t_jit` disables everything. A NaN cost meets no threshold.
pub fn decide(
    cost: f64,
    t_jit: CostThreshold,
    t_opt: CostThreshold,
    t_inline: CostThreshold,
) -> Decision {
    if !t_jit.is_met_by(cost) {
        Decision::Skip
    } else if !t_opt.is_met_by(cost) {
        Decision::Jit
    } else if !t_inline.is_met_by(cost) {
        Decision::JitOptimize
    } else {
        Decision::JitOptimizeInline
    }
}

/// Per-unit-of-work JIT flags, derived once from configuration and cost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct JitFlags {
    pub perform: bool,
    pub optimize: bool,
    pub inline: bool,
    pub expressions: bool,
    pub deform: bool,
}

impl JitFlags {
    /// Flags for a unit of work that runs interpreted.
    pub const NONE: JitFlags = JitFlags {
        perform: false,
        optimize: false,
        inline: false,
        expressions: false,
        deform: false,
    };

    /// Derives the flags for a unit of work with estimated `cost`.
    pub fn for_cost(cost: f64, config: &JitConfig) -> Self {
        if !config.enabled {
            return Self::NONE;
        }
        let decision = decide(
            cost,
            config.above_cost,
            config.optimize_above_cost,
            config.inline_above_cost,
        );
        Self::from_decision(decision, config)
    }

    pub fn from_decision(decision: Decision, config: &JitConfig) -> Self {
        if !decision.performs() {
            return Self::NONE;
        }
        Self {
            perform: true,
            optimize: decision.optimizes(),
            inline: decision.inlines(),
            expressions: config.expressions,
            deform: config.tuple_deforming,
        }
    }

    pub fn decision(&self) -> Decision {
        match (self.perform, self.optimize, self.inline) {
            (false, _, _) => Decision::Skip,
            (true, false, _) => Decision::Jit,
            (true, true, false) => Decision::JitOptimize,
            (true, true, true) => Decision::JitOptimizeInline,
        }
    }
}
