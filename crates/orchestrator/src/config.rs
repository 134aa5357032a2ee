use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::last_used::{JsonFileLastUsedStore, LastUsedStore, MemoryLastUsedStore};

/// What happens to already-pending cleanup regions when a busy unit is
/// superseded again before the next one consumed them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CarryForwardPolicy {
    /// Keep every region of every superseded unit until a unit consumes them.
    #[default]
    Accumulate,
    /// Keep only the regions of the most recently superseded unit.
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub carry_forward: CarryForwardPolicy,
    /// Apply to every selected animation frame on finish, not just the
    /// previewed one.
    pub fan_out_to_selected_frames: bool,
    /// Where the last used operation is persisted. In-memory when unset.
    pub last_used_path: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            carry_forward: CarryForwardPolicy::Accumulate,
            fan_out_to_selected_frames: true,
            last_used_path: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("read orchestrator config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse orchestrator config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl OrchestratorConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigLoadError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigLoadError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub(crate) fn last_used_store(&self) -> Box<dyn LastUsedStore> {
        match &self.last_used_path {
            Some(path) => Box::new(JsonFileLastUsedStore::new(path.clone())),
            None => Box::new(MemoryLastUsedStore::default()),
        }
    }
}
