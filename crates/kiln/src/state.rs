//! Per-node evaluation state that prefers native code and falls back to the
//! interpreter.

use kiln_core::{eval_expr, EvalContext, Expr, TupleDesc};
use kiln_jit::{FunctionHandle, Jit, JitError, LogicalId, Result, WorkUnit};

/// An expression owned by one plan node.
#[derive(Debug, Clone)]
pub struct ExprState {
    id: LogicalId,
    expr: Expr,
    arity: usize,
    handle: Option<FunctionHandle>,
}

impl ExprState {
    pub fn new(id: impl Into<LogicalId>, expr: Expr, arity: usize) -> Self {
        Self {
            id: id.into(),
            expr,
            arity,
            handle: None,
        }
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Asks the unit's JIT context for native code. Returns whether it will be used.
    pub fn prepare(&mut self, jit: &Jit, unit: &mut WorkUnit) -> Result<bool> {
        self.handle = jit.compile_expr(unit, self.id.clone(), &self.expr, self.arity)?;
        Ok(self.handle.is_some())
    }

    pub fn is_compiled(&self) -> bool {
        self.handle.is_some()
    }

    /// Evaluates over `rows`, one slice of slots per input tuple.
    ///
    /// The expression is interpreted once the unit's context has been released, and
    /// for rows too short for the compiled code, where missing slots read as `NULL`.
    pub fn eval(&self, jit: &Jit, unit: &WorkUnit, rows: &[&[i64]]) -> Result<i64> {
        if let (Some(handle), Some(context)) = (self.handle, unit.jit_context()) {
            match context.expr_fn(handle) {
                Ok(f) => {
                    if let Some(value) = f.try_call_rows(rows) {
                        return Ok(value);
                    }
                }
                Err(JitError::ContextReleased(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(eval_expr(&self.expr, &EvalContext::new(rows, jit.natives())))
    }
}

/// Tuple decoding for one scan.
#[derive(Debug, Clone)]
pub struct DeformState {
    id: LogicalId,
    desc: TupleDesc,
    handle: Option<FunctionHandle>,
}

impl DeformState {
    pub fn new(id: impl Into<LogicalId>, desc: TupleDesc) -> Self {
        Self {
            id: id.into(),
            desc,
            handle: None,
        }
    }

    pub fn desc(&self) -> &TupleDesc {
        &self.desc
    }

    pub fn prepare(&mut self, jit: &Jit, unit: &mut WorkUnit) -> Result<bool> {
        self.handle = jit.compile_deform(unit, self.id.clone(), &self.desc)?;
        Ok(self.handle.is_some())
    }

    pub fn is_compiled(&self) -> bool {
        self.handle.is_some()
    }

    /// Decodes `row` into `out`, which must hold at least `natts` slots.
    pub fn deform_into(&self, unit: &WorkUnit, row: &[u8], out: &mut [i64]) -> Result<()> {
        if let (Some(handle), Some(context)) = (self.handle, unit.jit_context()) {
            match context.deform_fn(handle) {
                Ok(f) => {
                    f.deform_into(row, out);
                    return Ok(());
                }
                Err(JitError::ContextReleased(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.desc.deform_into(row, out);
        Ok(())
    }

    pub fn deform(&self, unit: &WorkUnit, row: &[u8]) -> Result<Vec<i64>> {
        let mut out = vec![0; self.desc.natts()];
        self.deform_into(unit, row, &mut out)?;
        Ok(out)
    }
}
