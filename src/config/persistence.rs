//! Persistence configuration.

use std::path::PathBuf;

use serde::Deserialize;

/// Persistence configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Keep history in the fjall store; when disabled history lives in memory
    pub enabled: bool,

    /// Data directory path (for fjall)
    pub path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("./data"),
        }
    }
}
