//! One-time provider loading.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tracing::{info, warn};

use crate::error::LoadError;
use crate::provider::{JitProvider, ProviderRegistry};

struct LoadedProvider {
    name: String,
    result: Result<Arc<dyn JitProvider>, LoadError>,
}

/// Loads the configured provider at most once per loader.
///
/// The first call to [`ensure_loaded`](Self::ensure_loaded) decides: success and
/// failure are both sticky, so a broken provider is not retried on every unit of
/// work. Concurrent first calls block until one load completes.
pub struct ProviderLoader {
    registry: ProviderRegistry,
    loaded: OnceLock<LoadedProvider>,
}

static GLOBAL: OnceLock<Arc<ProviderLoader>> = OnceLock::new();

impl ProviderLoader {
    pub fn new(registry: ProviderRegistry) -> Self {
        Self {
            registry,
            loaded: OnceLock::new(),
        }
    }

    /// Returns the provider named `name`, loading it on first use.
    ///
    /// Once a provider is loaded, requesting a different name is a
    /// [`LoadError::Conflict`].
    pub fn ensure_loaded(&self, name: &str) -> Result<Arc<dyn JitProvider>, LoadError> {
        let loaded = self.loaded.get_or_init(|| self.load(name));
        if loaded.name != name {
            return Err(LoadError::Conflict {
                loaded: loaded.name.clone(),
                requested: name.to_string(),
            });
        }
        loaded.result.clone()
    }

    /// The provider, if one was loaded successfully.
    pub fn loaded(&self) -> Option<Arc<dyn JitProvider>> {
        self.loaded.get()?.result.as_ref().ok().cloned()
    }

    pub fn is_attempted(&self) -> bool {
        self.loaded.get().is_some()
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    fn load(&self, name: &str) -> LoadedProvider {
        let result = match self.registry.get(name) {
            None => Err(LoadError::NotFound(name.to_string())),
            Some(factory) => factory().map_err(|reason| LoadError::LoadFailed {
                name: name.to_string(),
                reason,
            }),
        };
        match &result {
            Ok(_) => info!(event = "jit_provider_loaded", provider = name, "JIT provider loaded"),
            Err(e) => warn!(
                event = "jit_provider_unavailable",
                provider = name,
                "JIT disabled for this process: {e}"
            ),
        }
        LoadedProvider {
            name: name.to_string(),
            result,
        }
    }

    /// Installs the process-wide loader. The first installation wins; later calls
    /// return the loader already installed.
    pub fn install_global(registry: ProviderRegistry) -> Arc<ProviderLoader> {
        GLOBAL
            .get_or_init(|| Arc::new(ProviderLoader::new(registry)))
            .clone()
    }

    pub fn global() -> Option<Arc<ProviderLoader>> {
        GLOBAL.get().cloned()
    }
}

impl fmt::Debug for ProviderLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderLoader")
            .field("registry", &self.registry)
            .field("loaded", &self.loaded.get().map(|l| &l.name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::test_utils::MockProvider;

    fn counting_registry(calls: Arc<AtomicUsize>) -> ProviderRegistry {
        ProviderRegistry::new()
            .with("mock", move || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(MockProvider::new()) as Arc<dyn JitProvider>)
            })
            .with("broken", || Err("missing symbol".to_string()))
    }

    #[test]
    fn test_loads_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = ProviderLoader::new(counting_registry(calls.clone()));
        assert!(!loader.is_attempted());
        for _ in 0..3 {
            let provider = loader.ensure_loaded("mock").unwrap();
            assert_eq!(provider.name(), "mock");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(loader.loaded().is_some());
    }

    #[test]
    fn test_concurrent_first_load() {
        let calls = Arc::new(AtomicUsize::new(0));
        let loader = ProviderLoader::new(counting_registry(calls.clone()));
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| assert!(loader.ensure_loaded("mock").is_ok()));
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_provider_is_sticky() {
        let loader = ProviderLoader::new(ProviderRegistry::new());
        assert_eq!(
            loader.ensure_loaded("llvm").err(),
            Some(LoadError::NotFound("llvm".into()))
        );
        assert!(loader.ensure_loaded("llvm").is_err());
        assert!(loader.loaded().is_none());
    }

    #[test]
    fn test_failed_load() {
        let loader = ProviderLoader::new(counting_registry(Arc::new(AtomicUsize::new(0))));
        let err = loader.ensure_loaded("broken").err().unwrap();
        assert!(matches!(err, LoadError::LoadFailed { ref reason, .. } if reason == "missing symbol"));
    }

    #[test]
    fn test_conflict() {
        let loader = ProviderLoader::new(counting_registry(Arc::new(AtomicUsize::new(0))));
        loader.ensure_loaded("mock").unwrap();
        assert_eq!(
            loader.ensure_loaded("broken").err(),
            Some(LoadError::Conflict {
                loaded: "mock".into(),
                requested: "broken".into()
            })
        );
    }
}
