use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::gas::GasSchedule;

/// Engine-wide limits and costs. Every field is optional in JSON and
/// falls back to [`EngineConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Gas granted to an invocation that does not name its own limit.
    pub gas_limit: u64,
    /// Deepest async call chain; the root invocation has depth 0.
    pub max_call_depth: u32,
    /// Upper bound on any contract's linear memory, in 64 KiB pages.
    pub max_memory_pages: u32,
    /// Upper bound on the initial size of any contract's table.
    pub max_table_elements: u32,
    pub schedule: GasSchedule,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gas_limit: 10_000_000,
            max_call_depth: 10,
            max_memory_pages: 256,
            max_table_elements: 10_000,
            schedule: GasSchedule::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}
