//! Resolution of callable symbols to inlinable bodies.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use kiln_config::JitConfig;
use tracing::{debug, warn};

use crate::index::{BitcodeIndex, IndexedFunction};

/// Looks up function bodies in the engine's index and, lazily, in the index of the
/// binary that owns a symbol.
///
/// Extension indexes are loaded at most once per binary, including failed loads.
/// The resolver is shared by every context and is safe to use from many threads.
#[derive(Debug)]
pub struct SymbolResolver {
    engine: Arc<BitcodeIndex>,
    bitcode_dir: Option<PathBuf>,
    extensions: RwLock<HashMap<String, Option<Arc<BitcodeIndex>>>>,
}

impl SymbolResolver {
    pub fn new(engine: BitcodeIndex, bitcode_dir: Option<PathBuf>) -> Self {
        Self {
            engine: Arc::new(engine),
            bitcode_dir,
            extensions: RwLock::new(HashMap::new()),
        }
    }

    /// A resolver that knows no bodies, so nothing is ever inlined.
    pub fn empty() -> Self {
        Self::new(BitcodeIndex::default(), None)
    }

    /// Builds a resolver from configuration, loading the engine index from the
    /// bitcode directory when present. `fallback` is used when there is none.
    pub fn from_config(config: &JitConfig, fallback: BitcodeIndex) -> Self {
        let engine = config
            .bitcode_dir
            .as_deref()
            .map(|dir| BitcodeIndex::path_for(dir, &config.engine_binary))
            .filter(|path| path.exists())
            .and_then(|path| match BitcodeIndex::load(&path) {
                Ok(index) => Some(index),
                Err(e) => {
                    warn!(path = %path.display(), "ignoring engine index: {e}");
                    None
                }
            })
            .unwrap_or(fallback);
        Self::new(engine, config.bitcode_dir.clone())
    }

    /// Pre-installs an extension index, bypassing the bitcode directory.
    pub fn with_extension(self, index: BitcodeIndex) -> Self {
        self.extensions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index.binary().to_string(), Some(Arc::new(index)));
        self
    }

    pub fn engine(&self) -> &BitcodeIndex {
        &self.engine
    }

    /// Finds an inlinable body for `symbol`.
    ///
    /// The engine index is consulted first. If that misses and `owning_binary`
    /// names a different binary, that binary's index is consulted next. Absence is
    /// an ordinary outcome: the caller emits a direct call instead.
    pub fn resolve(&self, symbol: &str, owning_binary: Option<&str>) -> Option<Arc<IndexedFunction>> {
        if let Some(found) = self.engine.get(symbol) {
            return Some(found.clone());
        }
        let binary = owning_binary.filter(|b| *b != self.engine.binary())?;
        self.extension(binary)?.get(symbol).cloned()
    }

    fn extension(&self, binary: &str) -> Option<Arc<BitcodeIndex>> {
        if let Some(cached) = self
            .extensions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(binary)
        {
            return cached.clone();
        }

        let mut extensions = self
            .extensions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // Another thread may have loaded it while we waited for the write lock.
        extensions
            .entry(binary.to_string())
            .or_insert_with(|| self.load_extension(binary))
            .clone()
    }

    fn load_extension(&self, binary: &str) -> Option<Arc<BitcodeIndex>> {
        let path = BitcodeIndex::path_for(self.bitcode_dir.as_deref()?, binary);
        match BitcodeIndex::load(&path) {
            Ok(index) => {
                debug!(binary, functions = index.len(), "loaded symbol index");
                Some(Arc::new(index))
            }
            Err(e) => {
                debug!(binary, path = %path.display(), "no usable symbol index: {e}");
                None
            }
        }
    }
}

impl Default for SymbolResolver {
    fn default() -> Self {
        Self::empty()
    }
}
