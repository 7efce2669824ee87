//! Inlinable function bodies published by a binary.
//!
//! Each binary (the engine itself or an extension) may ship an index file named
//! `<binary>.index.toml` in the bitcode directory:
//!
//! ```toml
//! binary = "kiln"
//!
//! [[functions]]
//! name = "int8pl"
//! params = 2
//! body = { add = [{ arg = 0 }, { arg = 1 }] }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_core::{Expr, ExprError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid body for {symbol}: {source}")]
    InvalidBody {
        symbol: String,
        #[source]
        source: ExprError,
    },
}

/// An inlinable function body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedFunction {
    pub name: String,
    pub params: usize,
    pub body: Expr,
}

impl IndexedFunction {
    pub fn new(name: impl Into<String>, params: usize, body: Expr) -> Self {
        Self {
            name: name.into(),
            params,
            body,
        }
    }

    /// Inlining cost of the body.
    pub fn cost(&self) -> usize {
        self.body.node_count()
    }
}

#[derive(Deserialize)]
struct IndexFile {
    binary: String,
    #[serde(default)]
    functions: Vec<IndexedFunction>,
}

/// The symbol index of one binary.
#[derive(Debug, Clone, Default)]
pub struct BitcodeIndex {
    binary: String,
    functions: HashMap<String, Arc<IndexedFunction>>,
}

impl BitcodeIndex {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            functions: HashMap::new(),
        }
    }

    /// Path of the index for `binary` under `dir`.
    pub fn path_for(dir: &Path, binary: &str) -> PathBuf {
        dir.join(format!("{binary}.index.toml"))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parses an index, validating every body against its parameter count.
    pub fn from_toml_str(s: &str) -> Result<Self, IndexError> {
        let file: IndexFile = toml::from_str(s)?;
        let mut index = Self::new(file.binary);
        for function in file.functions {
            function
                .body
                .validate_body(function.params)
                .map_err(|source| IndexError::InvalidBody {
                    symbol: function.name.clone(),
                    source,
                })?;
            index.insert(function);
        }
        Ok(index)
    }

    pub fn with_function(mut self, function: IndexedFunction) -> Self {
        self.insert(function);
        self
    }

    /// Adds a function, replacing any previous body for the same symbol.
    pub fn insert(&mut self, function: IndexedFunction) {
        self.functions
            .insert(function.name.clone(), Arc::new(function));
    }

    pub fn get(&self, symbol: &str) -> Option<&Arc<IndexedFunction>> {
        self.functions.get(symbol)
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
