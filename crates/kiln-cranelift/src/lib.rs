//! Cranelift code-generation provider for Kiln.
//!
//! Compiles [`kiln_core::Expr`] trees and tuple deformers to native code. All
//! functions of a JIT context share one `JITModule`, which is freed when the context
//! is released.
//!
//! ```
//! use kiln_jit::{ProviderLoader, ProviderRegistry};
//! use kiln_cranelift::{CraneliftProvider, PROVIDER_NAME};
//!
//! let mut registry = ProviderRegistry::new();
//! CraneliftProvider::register(&mut registry);
//! let loader = ProviderLoader::new(registry);
//! assert!(loader.ensure_loaded(PROVIDER_NAME).is_ok());
//! ```

mod compiler;
mod provider;


pub use provider::{CraneliftProvider, PROVIDER_NAME};
