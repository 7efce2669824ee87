//! Protected regions around calls into foreign code-generation libraries.
//!
//! A backend library can fail in ways the engine cannot recover from (an internal
//! assertion, a verifier bug surfacing as a panic). Inside a [`ProtectedRegion`] such
//! a failure terminates the whole process with [`FOREIGN_FATAL_EXIT_CODE`] instead of
//! unwinding through engine state that may be half updated. Outside any region the
//! condition propagates normally.
//!
//! Regions nest and are tracked per thread. Keep them tight: wrap the foreign call,
//! not the engine logic around it.


use std::cell::Cell;
use std::marker::PhantomData;
use std::panic::{self, PanicHookInfo};
use std::sync::Once;

/// Exit status used when a foreign library fails inside a protected region.
pub const FOREIGN_FATAL_EXIT_CODE: i32 = 70;

type FatalHandler = fn(&str) -> !;

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
    static HANDLER: Cell<Option<FatalHandler>> = const { Cell::new(None) };
}

static HOOK: Once = Once::new();

fn install_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if let Some(handler) = HANDLER.with(Cell::get) {
                handler(&panic_message(info));
            }
            previous(info);
        }));
    });
}

fn panic_message(info: &PanicHookInfo<'_>) -> String {
    let payload = info.payload();
    let text = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown failure".to_string());
    match info.location() {
        Some(loc) => format!("{text} at {}:{}", loc.file(), loc.line()),
        None => text,
    }
}

fn foreign_fatal(message: &str) -> ! {
    tracing::error!(
        event = "jit_foreign_fatal",
        exit_code = FOREIGN_FATAL_EXIT_CODE,
        "fatal error in JIT backend: {message}"
    );
    eprintln!("kiln: fatal error in JIT backend: {message}");
    std::process::exit(FOREIGN_FATAL_EXIT_CODE)
}

/// RAII guard marking the current thread as executing foreign code.
///
/// Construction installs the fatal handler, dropping restores whatever was installed
/// before. The guard is tied to its thread.
#[must_use = "the region ends when the guard is dropped"]
pub struct ProtectedRegion {
    depth: usize,
    previous: Option<FatalHandler>,
    _thread: PhantomData<*const ()>,
}

impl ProtectedRegion {
    pub fn enter() -> Self {
        install_hook();
        let depth = DEPTH.with(|d| {
            let depth = d.get() + 1;
            d.set(depth);
            depth
        });
        let previous = HANDLER.with(|h| h.replace(Some(foreign_fatal)));
        Self {
            depth,
            previous,
            _thread: PhantomData,
        }
    }
}

impl Drop for ProtectedRegion {
    fn drop(&mut self) {
        DEPTH.with(|d| {
            let current = d.get();
            debug_assert_eq!(
                current, self.depth,
                "protected regions must be left in reverse order of entry"
            );
            d.set(current.saturating_sub(1));
        });
        HANDLER.with(|h| h.set(self.previous));
    }
}

/// Enters a protected region. Equivalent to [`ProtectedRegion::enter`].
pub fn enter_protected() -> ProtectedRegion {
    ProtectedRegion::enter()
}

/// Leaves a protected region.
pub fn leave_protected(region: ProtectedRegion) {
    drop(region);
}

/// Runs `f` inside a protected region.
pub fn protected<T>(f: impl FnOnce() -> T) -> T {
    let _region = ProtectedRegion::enter();
    f()
}

/// Returns true if the current thread is inside a protected region.
pub fn in_protected_region() -> bool {
    protection_depth() > 0
}

pub fn protection_depth() -> usize {
    DEPTH.with(Cell::get)
}

/// Clears the region bookkeeping of the current thread after an error unwound past
/// live guards, e.g. when a unit of work was aborted with its guards leaked.
pub fn reset_after_error() {
    DEPTH.with(|d| d.set(0));
    HANDLER.with(|h| h.set(None));
}
