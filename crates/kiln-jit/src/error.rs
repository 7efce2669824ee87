//! Error types for JIT dispatch.

use kiln_core::{DefinitionKind, ExprError};
use thiserror::Error;

use crate::context::ContextId;

/// Why a provider could not be loaded. Never escapes the dispatch facade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("JIT provider {0:?} is not registered")]
    NotFound(String),

    #[error("JIT provider {name:?} failed to load: {reason}")]
    LoadFailed { name: String, reason: String },

    #[error("JIT provider {loaded:?} is already loaded, cannot load {requested:?}")]
    Conflict { loaded: String, requested: String },
}

/// Main error type for JIT operations.
#[derive(Debug, Error)]
pub enum JitError {
    /// No usable provider.
    #[error(transparent)]
    ProviderUnavailable(#[from] LoadError),

    /// The engine submitted logic that cannot be compiled.
    #[error("invalid definition {id}: {source}")]
    Definition {
        id: String,
        #[source]
        source: ExprError,
    },

    /// The backend failed to compile a batch. The unit of work must abort.
    #[error("materialization failed: {0}")]
    Materialization(String),

    #[error("JIT context {0} has been released")]
    ContextReleased(ContextId),

    #[error("function handle belongs to context {handle}, not {context}")]
    ForeignHandle {
        handle: ContextId,
        context: ContextId,
    },

    #[error("function {id} is a {actual:?} function, not {expected:?}")]
    KindMismatch {
        id: String,
        expected: DefinitionKind,
        actual: DefinitionKind,
    },
}

impl JitError {
    pub fn materialization(what: impl Into<String>) -> Self {
        JitError::Materialization(what.into())
    }

    /// Returns false for failures after which the unit of work must not continue.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            JitError::Materialization(_) | JitError::ContextReleased(_)
        )
    }
}

/// Result type alias for JIT operations
pub type Result<T> = std::result::Result<T, JitError>;
