use std::path::{Path, PathBuf};

use protocol::OperationConfig;
use serde::{Deserialize, Serialize};

const SCHEMA_VERSION: u16 = 1;

#[derive(Debug, thiserror::Error)]
pub enum LastUsedStoreError {
    #[error("last used store {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("last used store {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("last used store {path}: unsupported schema version {found}")]
    UnsupportedSchema { path: PathBuf, found: u16 },
}

/// Remembers the most recently finished operation for "repeat last".
pub trait LastUsedStore: Send {
    fn load(&self) -> Result<Option<OperationConfig>, LastUsedStoreError>;

    fn store(&mut self, config: &OperationConfig) -> Result<(), LastUsedStoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryLastUsedStore {
    config: Option<OperationConfig>,
}

impl LastUsedStore for MemoryLastUsedStore {
    fn load(&self) -> Result<Option<OperationConfig>, LastUsedStoreError> {
        Ok(self.config.clone())
    }

    fn store(&mut self, config: &OperationConfig) -> Result<(), LastUsedStoreError> {
        self.config = Some(config.clone());
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LastUsedFile {
    schema_version: u16,
    config: OperationConfig,
}

/// Keeps the last used config in a JSON file, replaced atomically on store.
#[derive(Debug, Clone)]
pub struct JsonFileLastUsedStore {
    path: PathBuf,
}

impl JsonFileLastUsedStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> LastUsedStoreError {
        LastUsedStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl LastUsedStore for JsonFileLastUsedStore {
    fn load(&self) -> Result<Option<OperationConfig>, LastUsedStoreError> {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(self.io_error(error)),
        };
        let file: LastUsedFile =
            serde_json::from_str(&json).map_err(|source| LastUsedStoreError::Json {
                path: self.path.clone(),
                source,
            })?;
        if file.schema_version != SCHEMA_VERSION {
            return Err(LastUsedStoreError::UnsupportedSchema {
                path: self.path.clone(),
                found: file.schema_version,
            });
        }
        Ok(Some(file.config))
    }

    fn store(&mut self, config: &OperationConfig) -> Result<(), LastUsedStoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| self.io_error(error))?;
        }
        let json = serde_json::to_string_pretty(&LastUsedFile {
            schema_version: SCHEMA_VERSION,
            config: config.clone(),
        })
        .map_err(|source| LastUsedStoreError::Json {
            path: self.path.clone(),
            source,
        })?;
        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, json).map_err(|error| self.io_error(error))?;
        std::fs::rename(&staging, &self.path).map_err(|error| self.io_error(error))
    }
}
