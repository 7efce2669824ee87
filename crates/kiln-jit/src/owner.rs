//! Scoped ownership of per-unit-of-work resources.

use std::fmt;

use tracing::trace;

use crate::context::JitContext;
use crate::policy::JitFlags;

type Cleanup = Box<dyn FnOnce() + Send>;

/// Owns resources for a scope and frees them exactly once, when released or dropped.
///
/// Owners form a tree: releasing an owner releases its children first (last added,
/// first released), then its JIT context, then runs its cleanups in reverse order.
/// This happens on normal completion and on error unwinding alike.
pub struct ResourceOwner {
    name: String,
    jit: Option<JitContext>,
    children: Vec<ResourceOwner>,
    cleanups: Vec<Cleanup>,
    released: bool,
}

impl ResourceOwner {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jit: None,
            children: Vec::new(),
            cleanups: Vec::new(),
            released: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Adds a child scope, released before this owner's own resources.
    pub fn add_child(&mut self, name: impl Into<String>) -> &mut ResourceOwner {
        self.children.push(ResourceOwner::new(name));
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    pub fn children(&self) -> &[ResourceOwner] {
        &self.children
    }

    /// Registers a cleanup to run on release.
    pub fn on_release(&mut self, cleanup: impl FnOnce() + Send + 'static) {
        if self.released {
            cleanup();
            return;
        }
        self.cleanups.push(Box::new(cleanup));
    }

    /// Takes ownership of `context`. An owner holds at most one JIT context.
    ///
    /// # Panics
    ///
    /// Panics if the owner already holds a context.
    pub fn remember_jit(&mut self, context: JitContext) -> &JitContext {
        assert!(
            self.jit.is_none(),
            "resource owner {} already holds a JIT context",
            self.name
        );
        self.jit.insert(context)
    }

    pub fn has_jit(&self) -> bool {
        self.jit.is_some()
    }

    pub fn jit(&self) -> Option<&JitContext> {
        self.jit.as_ref()
    }

    /// Releases the JIT context early. Returns false if there was none.
    pub fn release_jit(&mut self) -> bool {
        match self.jit.as_mut() {
            Some(ctx) => {
                ctx.release();
                true
            }
            None => false,
        }
    }

    /// Frees everything this owner holds. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        for child in self.children.iter_mut().rev() {
            child.release();
        }
        self.release_jit();
        while let Some(cleanup) = self.cleanups.pop() {
            cleanup();
        }
        trace!(owner = %self.name, "released resource owner");
    }
}

impl Drop for ResourceOwner {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ResourceOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceOwner")
            .field("name", &self.name)
            .field("jit", &self.jit)
            .field("children", &self.children)
            .field("cleanups", &self.cleanups.len())
            .field("released", &self.released)
            .finish()
    }
}

/// One execution of a plan: its estimated cost and the resources it owns.
#[derive(Debug)]
pub struct WorkUnit {
    cost: f64,
    flags: Option<JitFlags>,
    owner: ResourceOwner,
}

impl WorkUnit {
    pub fn new(name: impl Into<String>, cost: f64) -> Self {
        Self {
            cost,
            flags: None,
            owner: ResourceOwner::new(name),
        }
    }

    pub fn name(&self) -> &str {
        self.owner.name()
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    /// Flags chosen for this unit, if the policy has run.
    pub fn flags(&self) -> Option<JitFlags> {
        self.flags
    }

    /// Returns the unit's flags, deriving them with `derive` on first use.
    pub fn flags_or_init(&mut self, derive: impl FnOnce(f64) -> JitFlags) -> JitFlags {
        let cost = self.cost;
        *self.flags.get_or_insert_with(|| derive(cost))
    }

    pub fn owner(&self) -> &ResourceOwner {
        &self.owner
    }

    pub fn owner_mut(&mut self) -> &mut ResourceOwner {
        &mut self.owner
    }

    pub fn jit_context(&self) -> Option<&JitContext> {
        self.owner.jit()
    }

    /// Ends the unit, releasing everything it owns.
    pub fn finish(mut self) {
        self.owner.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn test_release_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut root = ResourceOwner::new("root");
        for name in ["a", "b"] {
            let log = log.clone();
            root.add_child(name)
                .on_release(move || log.lock().unwrap().push(name));
        }
        let l = log.clone();
        root.on_release(move || l.lock().unwrap().push("root"));
        root.release();
        assert_eq!(*log.lock().unwrap(), vec!["b", "a", "root"]);
    }

    #[test]
    fn test_release_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut owner = ResourceOwner::new("unit");
        let c = count.clone();
        owner.on_release(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        owner.release();
        owner.release();
        drop(owner);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let mut owner = ResourceOwner::new("unit");
            let c = count.clone();
            owner.add_child("scan").on_release(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_on_unwind() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let result = std::panic::catch_unwind(move || {
            let mut owner = ResourceOwner::new("unit");
            owner.on_release(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
            panic!("unit aborted");
        });
        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_flags_derived_once() {
        let mut unit = WorkUnit::new("q", 10.0);
        let mut calls = 0;
        for _ in 0..3 {
            unit.flags_or_init(|_| {
                calls += 1;
                JitFlags::NONE
            });
        }
        assert_eq!(calls, 1);
        assert_eq!(unit.flags(), Some(JitFlags::NONE));
    }
}
