//! Machine configuration.
//!
//! Hosts usually build a [`MachineConfig`] in code, but it can also be read
//! from a TOML file:
//!
//! ```toml
//! max_call_depth = 128
//! instruction_limit = 1000000
//! max_threads = 64
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_MAX_CALL_DEPTH: usize = 256;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid machine config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Resource limits for one [`ScriptMachine`](crate::vm::ScriptMachine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MachineConfig {
    /// Nested calls allowed within one thread before `StackOverflow`.
    pub max_call_depth: usize,
    /// Instructions executed per host entry (`run`, `resume`, `call`).
    pub instruction_limit: Option<u64>,
    /// Live threads allowed at once, including the main thread.
    pub max_threads: Option<usize>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            instruction_limit: None,
            max_threads: None,
        }
    }
}

impl MachineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn with_instruction_limit(mut self, limit: u64) -> Self {
        self.instruction_limit = Some(limit);
        self
    }

    pub fn with_max_threads(mut self, threads: usize) -> Self {
        self.max_threads = Some(threads);
        self
    }
}
