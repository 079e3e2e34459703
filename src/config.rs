//! Pipeline configuration loaded from JSON.
//!
//! ```json
//! { "disabled_passes": ["FuseSwish"], "enabled_passes": [], "fp16": true }
//! ```

use crate::passes::builtin::ConvertFp32ToFp16;
use crate::passes::{PassRegistry, RegistryError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },

    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration refers to an unknown pass: {0}")]
    Registry(#[from] RegistryError),
}

type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Passes to switch off, by name.
    pub disabled_passes: Vec<String>,
    /// Passes to switch on, by name (applied after `disabled_passes`).
    pub enabled_passes: Vec<String>,
    /// Shortcut for enabling `ConvertFp32ToFp16`.
    pub fp16: bool,
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Applies the enable/disable switches. Must happen before the run.
    pub fn apply(&self, registry: &mut PassRegistry) -> Result<()> {
        for name in &self.disabled_passes {
            registry.set_enabled(name, false)?;
        }
        for name in &self.enabled_passes {
            registry.set_enabled(name, true)?;
        }
        if self.fp16 {
            registry.set_enabled(ConvertFp32ToFp16::NAME, true)?;
        }
        Ok(())
    }
}
