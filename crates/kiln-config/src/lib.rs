//! Configuration system for Kiln.
//!
//! Load JIT configuration from TOML or YAML to choose the code-generation provider and
//! tune when units of work are compiled, without code changes.
//!
//! # Examples
//!
//! Load configuration from TOML string:
//!
//! ```
//! use kiln_config::{CostThreshold, JitConfig};
//!
//! let config = JitConfig::from_toml_str(r#"
//!     provider = "cranelift"
//!     above_cost = 50000
//!     optimize_above_cost = 250000
//!     inline_above_cost = "never"
//! "#).unwrap();
//!
//! assert_eq!(config.above_cost, CostThreshold::Above(50000.0));
//! assert_eq!(config.inline_above_cost, CostThreshold::Never);
//! ```
//!
//! Use default config when file is missing:
//!
//! ```
//! use kiln_config::JitConfig;
//!
//! let config = JitConfig::load("kiln.toml").unwrap_or_default();
//! // Proceeds with defaults if file doesn't exist
//! ```


use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the built-in provider.
pub const DEFAULT_PROVIDER: &str = "cranelift";

/// Name the engine's own binary is indexed under.
pub const DEFAULT_ENGINE_BINARY: &str = "kiln";

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// JIT configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "snake_case")]
pub struct JitConfig {
    /// Master switch. When off no unit of work is ever compiled.
    pub enabled: bool,

    /// Name of the code-generation provider to load.
    pub provider: String,

    /// Estimated cost at which a unit of work is compiled at all.
    pub above_cost: CostThreshold,

    /// Estimated cost at which generated code is optimized.
    pub optimize_above_cost: CostThreshold,

    /// Estimated cost at which calls are inlined.
    pub inline_above_cost: CostThreshold,

    /// Compile expressions.
    pub expressions: bool,

    /// Compile tuple deforming.
    pub tuple_deforming: bool,

    /// Largest callee body (in expression nodes) considered for inlining.
    pub inline_cost_limit: usize,

    /// Log generated IR at debug level.
    pub dump_ir: bool,

    /// Directory holding `<binary>.index.toml` inlining indexes.
    pub bitcode_dir: Option<PathBuf>,

    /// Name the engine's own binary is indexed under.
    pub engine_binary: String,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: DEFAULT_PROVIDER.to_string(),
            above_cost: CostThreshold::Above(100_000.0),
            optimize_above_cost: CostThreshold::Above(500_000.0),
            inline_above_cost: CostThreshold::Above(500_000.0),
            expressions: true,
            tuple_deforming: true,
            inline_cost_limit: 150,
            dump_ir: false,
            bitcode_dir: None,
            engine_binary: DEFAULT_ENGINE_BINARY.to_string(),
        }
    }
}

impl JitConfig {
    /// Creates a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if file doesn't exist or contains invalid TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_file(path)
    }

    /// Loads configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Parses configuration from a YAML string.
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration with JIT switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Sets the provider name.
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    /// Sets all three thresholds.
    pub fn with_thresholds(
        mut self,
        jit: CostThreshold,
        optimize: CostThreshold,
        inline: CostThreshold,
    ) -> Self {
        self.above_cost = jit;
        self.optimize_above_cost = optimize;
        self.inline_above_cost = inline;
        self
    }

    /// Sets the bitcode index directory.
    pub fn with_bitcode_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bitcode_dir = Some(dir.into());
        self
    }

    /// Checks the configuration for contradictions.
    ///
    /// Numeric thresholds must be non-decreasing from `above_cost` through
    /// `inline_above_cost`. Sentinels are exempt, since each level can be switched
    /// off on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider.trim().is_empty() {
            return Err(ConfigError::Invalid("provider name is empty".into()));
        }
        let ordered = [
            ("above_cost", self.above_cost),
            ("optimize_above_cost", self.optimize_above_cost),
            ("inline_above_cost", self.inline_above_cost),
        ];
        let numeric: Vec<(&str, f64)> = ordered
            .iter()
            .filter_map(|(name, t)| match t {
                CostThreshold::Above(cost) => Some((*name, *cost)),
                _ => None,
            })
            .collect();
        for pair in numeric.windows(2) {
            let ((lo_name, lo), (hi_name, hi)) = (pair[0], pair[1]);
            if lo > hi {
                return Err(ConfigError::Invalid(format!(
                    "{lo_name} ({lo}) exceeds {hi_name} ({hi})"
                )));
            }
        }
        for (name, t) in ordered {
            if let CostThreshold::Above(cost) = t {
                if cost.is_nan() {
                    return Err(ConfigError::Invalid(format!("{name} is NaN")));
                }
            }
        }
        Ok(())
    }
}

/// A cost threshold with "always" and "never" sentinels.
///
/// In configuration files a threshold is a number, a negative number (never), or one
/// of the strings `"always"` and `"never"`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(try_from = "ThresholdRepr", into = "ThresholdRepr")]
pub enum CostThreshold {
    /// Met by any cost.
    Always,
    /// Met by no cost.
    Never,
    /// Met by costs greater than or equal to the value.
    Above(f64),
}

impl CostThreshold {
    /// Returns true if `cost` meets this threshold.
    pub fn is_met_by(&self, cost: f64) -> bool {
        match self {
            CostThreshold::Always => !cost.is_nan(),
            CostThreshold::Never => false,
            CostThreshold::Above(limit) => cost >= *limit,
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, CostThreshold::Never)
    }
}

impl fmt::Display for CostThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CostThreshold::Always => f.write_str("always"),
            CostThreshold::Never => f.write_str("never"),
            CostThreshold::Above(cost) => write!(f, "{cost}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
enum ThresholdRepr {
    Number(f64),
    Word(String),
}

impl TryFrom<ThresholdRepr> for CostThreshold {
    type Error = String;

    fn try_from(repr: ThresholdRepr) -> Result<Self, Self::Error> {
        match repr {
            ThresholdRepr::Number(n) if n < 0.0 => Ok(CostThreshold::Never),
            ThresholdRepr::Number(n) => Ok(CostThreshold::Above(n)),
            ThresholdRepr::Word(w) => match w.to_ascii_lowercase().as_str() {
                "always" => Ok(CostThreshold::Always),
                "never" | "off" | "disabled" => Ok(CostThreshold::Never),
                other => Err(format!(
                    "invalid cost threshold {other:?}, expected a number, \"always\" or \"never\""
                )),
            },
        }
    }
}

impl From<CostThreshold> for ThresholdRepr {
    fn from(t: CostThreshold) -> Self {
        match t {
            CostThreshold::Always => ThresholdRepr::Word("always".into()),
            CostThreshold::Never => ThresholdRepr::Word("never".into()),
            CostThreshold::Above(n) => ThresholdRepr::Number(n),
        }
    }
}
