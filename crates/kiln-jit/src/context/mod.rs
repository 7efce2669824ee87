//! JIT contexts: per-unit-of-work containers of generated code.
//!
//! A context accumulates definitions, compiles them in batches and hands out
//! typed entry points. Its life is a small state machine:
//!
//! ```text
//! Empty --emit--> Accumulating --lookup--> Materialized --emit--> Accumulating
//!   \________________\__________________________\--release--> Released
//! ```
//!
//! Entry points borrow the context, so the compiler rejects any use of generated
//! code after [`JitContext::release`]. Handles are plain values; looking one up in a
//! released context fails with [`JitError::ContextReleased`].


use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use kiln_core::{Definition, DefinitionKind, Expr, NativeSymbols};
use tracing::{debug, trace};

use crate::error::{JitError, Result};
use crate::instrumentation::JitInstrumentation;
use crate::policy::JitFlags;
use crate::provider::ProviderContext;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique context identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    pub fn next() -> Self {
        ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Engine-chosen name of a piece of logic, unique within a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalId(Arc<str>);

impl LogicalId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LogicalId {
    fn from(s: &str) -> Self {
        LogicalId(Arc::from(s))
    }
}

impl From<String> for LogicalId {
    fn from(s: String) -> Self {
        LogicalId(Arc::from(s))
    }
}

impl fmt::Display for LogicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque reference to a function emitted into a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionHandle {
    context: ContextId,
    slot: u32,
}

impl FunctionHandle {
    pub fn context(&self) -> ContextId {
        self.context
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Empty,
    Accumulating,
    Materialized,
    Released,
}

#[derive(Debug, Clone)]
enum Shape {
    /// Minimum slot count each input row must provide.
    Expr { widths: Arc<[usize]> },
    Deform { natts: usize, row_len: usize },
}

impl Shape {
    fn of(definition: &Definition) -> Self {
        match definition {
            Definition::Expr { expr, arity } => Shape::Expr {
                widths: row_widths(expr, *arity).into(),
            },
            Definition::Deform(desc) => Shape::Deform {
                natts: desc.natts(),
                row_len: desc.row_len(),
            },
        }
    }

    fn kind(&self) -> DefinitionKind {
        match self {
            Shape::Expr { .. } => DefinitionKind::Expr,
            Shape::Deform { .. } => DefinitionKind::Deform,
        }
    }
}

fn row_widths(expr: &Expr, arity: usize) -> Vec<usize> {
    fn visit(expr: &Expr, widths: &mut [usize]) {
        if let Expr::Field {
            param_idx,
            field_idx,
        } = expr
        {
            if let Some(w) = widths.get_mut(*param_idx) {
                *w = (*w).max(field_idx + 1);
            }
        }
        expr.for_each_child(|child| visit(child, widths));
    }
    let mut widths = vec![0; arity];
    visit(expr, &mut widths);
    widths
}

struct FunctionSlot {
    id: LogicalId,
    symbol: String,
    shape: Shape,
    entry: Option<*const u8>,
}

struct Inner {
    state: ContextState,
    backend: Option<Box<dyn ProviderContext>>,
    slots: Vec<FunctionSlot>,
    memo: HashMap<LogicalId, FunctionHandle>,
    pending: usize,
    instr: JitInstrumentation,
}

impl Inner {
    fn materialize(&mut self, id: ContextId) -> Result<()> {
        if self.state == ContextState::Released {
            return Err(JitError::ContextReleased(id));
        }
        if self.pending == 0 {
            return Ok(());
        }
        let backend = self
            .backend
            .as_mut()
            .ok_or(JitError::ContextReleased(id))?;

        let start = Instant::now();
        backend.materialize(&mut self.instr)?;
        for slot in self.slots.iter_mut().filter(|s| s.entry.is_none()) {
            let entry = backend.resolve(&slot.symbol).ok_or_else(|| {
                JitError::materialization(format!("backend did not produce {}", slot.symbol))
            })?;
            slot.entry = Some(entry);
        }

        let functions = std::mem::take(&mut self.pending);
        self.instr.batches += 1;
        self.state = ContextState::Materialized;
        debug!(
            event = "jit_materialize",
            context = id.as_u64(),
            functions,
            duration_us = start.elapsed().as_micros() as u64,
            "materialized batch"
        );
        Ok(())
    }
}

/// Generated code and bookkeeping of one unit of work.
pub struct JitContext {
    id: ContextId,
    flags: JitFlags,
    natives: Arc<NativeSymbols>,
    inner: RefCell<Inner>,
}

// SAFETY: entry points are addresses inside code owned by the backend context, which
// moves with the JitContext. A context is used by one thread at a time (it is !Sync).
unsafe impl Send for JitContext {}

impl JitContext {
    pub fn new(
        id: ContextId,
        flags: JitFlags,
        natives: Arc<NativeSymbols>,
        backend: Box<dyn ProviderContext>,
    ) -> Self {
        Self {
            id,
            flags,
            natives,
            inner: RefCell::new(Inner {
                state: ContextState::Empty,
                backend: Some(backend),
                slots: Vec::new(),
                memo: HashMap::new(),
                pending: 0,
                instr: JitInstrumentation::default(),
            }),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn flags(&self) -> JitFlags {
        self.flags
    }

    pub fn state(&self) -> ContextState {
        self.inner.borrow().state
    }

    pub fn is_released(&self) -> bool {
        self.state() == ContextState::Released
    }

    /// Snapshot of the counters and timings so far.
    pub fn instrumentation(&self) -> JitInstrumentation {
        self.inner.borrow().instr
    }

    /// Number of distinct functions emitted.
    pub fn function_count(&self) -> usize {
        self.inner.borrow().slots.len()
    }

    /// Functions defined but not yet materialized.
    pub fn pending_count(&self) -> usize {
        self.inner.borrow().pending
    }

    /// Returns the handle for `id`, defining `definition` on first request.
    ///
    /// Requests for an id already emitted return the same handle without
    /// regenerating code. The definition is validated before it reaches the backend.
    pub fn emit_or_get(
        &self,
        id: impl Into<LogicalId>,
        definition: &Definition,
    ) -> Result<FunctionHandle> {
        let id = id.into();
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        if inner.state == ContextState::Released {
            return Err(JitError::ContextReleased(self.id));
        }

        if let Some(handle) = inner.memo.get(&id) {
            let actual = inner.slots[handle.slot as usize].shape.kind();
            if actual != definition.kind() {
                return Err(JitError::KindMismatch {
                    id: id.to_string(),
                    expected: definition.kind(),
                    actual,
                });
            }
            return Ok(*handle);
        }

        definition
            .validate(&self.natives)
            .map_err(|source| JitError::Definition {
                id: id.to_string(),
                source,
            })?;

        let slot = inner.slots.len();
        let symbol = format!("kiln_{}_{}_{}", definition.kind().prefix(), self.id, slot);
        inner
            .backend
            .as_mut()
            .ok_or(JitError::ContextReleased(self.id))?
            .define(&symbol, definition)?;

        let handle = FunctionHandle {
            context: self.id,
            slot: slot as u32,
        };
        trace!(context = self.id.as_u64(), id = %id, symbol = %symbol, "defined function");
        inner.slots.push(FunctionSlot {
            id: id.clone(),
            symbol,
            shape: Shape::of(definition),
            entry: None,
        });
        inner.memo.insert(id, handle);
        inner.pending += 1;
        inner.instr.created_functions += 1;
        inner.state = ContextState::Accumulating;
        Ok(handle)
    }

    /// Compiles every pending definition. A no-op when nothing is pending.
    pub fn materialize(&self) -> Result<()> {
        self.inner.borrow_mut().materialize(self.id)
    }

    /// Entry point of an expression function, materializing first if needed.
    pub fn expr_fn(&self, handle: FunctionHandle) -> Result<ExprFn<'_>> {
        let (ptr, shape) = self.entry(handle, DefinitionKind::Expr)?;
        match shape {
            Shape::Expr { widths } => Ok(ExprFn {
                ptr,
                widths,
                _context: PhantomData,
            }),
            Shape::Deform { .. } => unreachable!("kind checked by entry"),
        }
    }

    /// Entry point of a deform function, materializing first if needed.
    pub fn deform_fn(&self, handle: FunctionHandle) -> Result<DeformFn<'_>> {
        let (ptr, shape) = self.entry(handle, DefinitionKind::Deform)?;
        match shape {
            Shape::Deform { natts, row_len } => Ok(DeformFn {
                ptr,
                natts,
                row_len,
                _context: PhantomData,
            }),
            Shape::Expr { .. } => unreachable!("kind checked by entry"),
        }
    }

    fn entry(&self, handle: FunctionHandle, expected: DefinitionKind) -> Result<(*const u8, Shape)> {
        let mut inner = self.inner.borrow_mut();
        if inner.state == ContextState::Released {
            return Err(JitError::ContextReleased(self.id));
        }
        let foreign = JitError::ForeignHandle {
            handle: handle.context,
            context: self.id,
        };
        if handle.context != self.id {
            return Err(foreign);
        }
        let index = handle.slot as usize;
        let slot = inner.slots.get(index).ok_or(foreign)?;
        if slot.shape.kind() != expected {
            return Err(JitError::KindMismatch {
                id: slot.id.to_string(),
                expected,
                actual: slot.shape.kind(),
            });
        }
        if slot.entry.is_none() {
            inner.materialize(self.id)?;
        }
        let slot = &inner.slots[index];
        let ptr = slot.entry.ok_or_else(|| {
            JitError::materialization(format!("no entry point for {}", slot.symbol))
        })?;
        Ok((ptr, slot.shape.clone()))
    }

    /// Frees all generated code. Safe to call more than once.
    pub fn release(&mut self) {
        let inner = self.inner.get_mut();
        if inner.state == ContextState::Released {
            return;
        }
        if let Some(mut backend) = inner.backend.take() {
            backend.release();
        }
        for slot in &mut inner.slots {
            slot.entry = None;
        }
        inner.pending = 0;
        inner.state = ContextState::Released;
        debug!(
            event = "jit_context_released",
            context = self.id.as_u64(),
            functions = inner.slots.len(),
            "released JIT context"
        );
    }
}

impl Drop for JitContext {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for JitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("JitContext")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("functions", &inner.slots.len())
            .field("pending", &inner.pending)
            .finish()
    }
}

/// Compiled expression: `fn(*const *const i64) -> i64`.
///
/// Parameter `i` is a pointer to the decoded slots of input row `i`.
#[derive(Clone)]
pub struct ExprFn<'ctx> {
    ptr: *const u8,
    widths: Arc<[usize]>,
    _context: PhantomData<&'ctx JitContext>,
}

impl ExprFn<'_> {
    pub fn arity(&self) -> usize {
        self.widths.len()
    }

    /// Calls the function with raw row pointers.
    ///
    /// # Safety
    ///
    /// `ptrs` must hold at least `arity()` pointers, each valid for reads of every
    /// slot the expression references in that row.
    #[inline]
    pub unsafe fn call_n(&self, ptrs: &[*const i64]) -> i64 {
        debug_assert!(
            ptrs.len() >= self.arity(),
            "call_n: expected {} ptrs, got {}",
            self.arity(),
            ptrs.len()
        );
        let f: unsafe extern "C" fn(*const *const i64) -> i64 = std::mem::transmute(self.ptr);
        f(ptrs.as_ptr())
    }

    /// Returns true if `rows` provide every slot the expression reads.
    pub fn fits(&self, rows: &[&[i64]]) -> bool {
        rows.len() >= self.arity()
            && rows
                .iter()
                .zip(self.widths.iter())
                .all(|(row, width)| row.len() >= *width)
    }

    /// Evaluates the expression over `rows`, or returns `None` if a row is missing
    /// or too short for the fields the expression reads.
    pub fn try_call_rows(&self, rows: &[&[i64]]) -> Option<i64> {
        self.fits(rows).then(|| self.call_unchecked(rows))
    }

    /// Evaluates the expression over `rows`.
    ///
    /// # Panics
    ///
    /// Panics if fewer than `arity()` rows are given or a row is too short for the
    /// fields the expression reads.
    pub fn call_rows(&self, rows: &[&[i64]]) -> i64 {
        assert!(
            rows.len() >= self.arity(),
            "expected {} rows, got {}",
            self.arity(),
            rows.len()
        );
        for (i, (row, width)) in rows.iter().zip(self.widths.iter()).enumerate() {
            assert!(
                row.len() >= *width,
                "row {i} has {} slots, expression reads {width}",
                row.len()
            );
        }
        self.call_unchecked(rows)
    }

    fn call_unchecked(&self, rows: &[&[i64]]) -> i64 {
        let mut small = [std::ptr::null::<i64>(); 4];
        if rows.len() <= small.len() {
            for (p, row) in small.iter_mut().zip(rows) {
                *p = row.as_ptr();
            }
            // SAFETY: callers checked every row against the fields the expression reads.
            unsafe { self.call_n(&small[..rows.len()]) }
        } else {
            let ptrs: Vec<*const i64> = rows.iter().map(|row| row.as_ptr()).collect();
            // SAFETY: as above.
            unsafe { self.call_n(&ptrs) }
        }
    }
}

impl fmt::Debug for ExprFn<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExprFn")
            .field("ptr", &self.ptr)
            .field("widths", &self.widths)
            .finish()
    }
}

/// Compiled tuple deformer: `fn(*const u8, *mut i64)`.
#[derive(Clone, Copy)]
pub struct DeformFn<'ctx> {
    ptr: *const u8,
    natts: usize,
    row_len: usize,
    _context: PhantomData<&'ctx JitContext>,
}

impl fmt::Debug for DeformFn<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeformFn")
            .field("ptr", &self.ptr)
            .field("natts", &self.natts)
            .field("row_len", &self.row_len)
            .finish()
    }
}

impl DeformFn<'_> {
    pub fn natts(&self) -> usize {
        self.natts
    }

    /// Decodes `row` into `out`.
    ///
    /// # Panics
    ///
    /// Panics if `row` is shorter than the descriptor's row length or `out` has
    /// fewer than `natts()` slots.
    pub fn deform_into(&self, row: &[u8], out: &mut [i64]) {
        assert!(row.len() >= self.row_len, "row shorter than descriptor");
        assert!(out.len() >= self.natts, "output slots shorter than descriptor");
        let f: unsafe extern "C" fn(*const u8, *mut i64) = unsafe { std::mem::transmute(self.ptr) };
        // SAFETY: lengths checked above; the generated code touches nothing else.
        unsafe { f(row.as_ptr(), out.as_mut_ptr()) }
    }

    pub fn deform(&self, row: &[u8]) -> Vec<i64> {
        let mut out = vec![0; self.natts];
        self.deform_into(row, &mut out);
        out
    }
}
