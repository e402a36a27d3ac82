use super::{create_storage, Storage, StorageError, StorageType};
use crate::config::{Config, ConfigError};
use std::path::PathBuf;

/// Engine choice and location, derived from the loaded [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub storage_type: StorageType,
    pub storage_path: PathBuf,
}

impl StorageConfig {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let config = config.resolved();

        let raw_type = config.storage_type.unwrap_or_default();
        let storage_type = StorageType::parse(&raw_type).ok_or_else(|| {
            ConfigError::InvalidConfig(format!("Unknown storage.type: {}", raw_type))
        })?;

        let storage_path = config
            .storage_path
            .map(|s| PathBuf::from(shellexpand::tilde(&s).to_string()))
            .ok_or_else(|| ConfigError::InvalidConfig("storage.path is not set".to_string()))?;

        Ok(Self {
            storage_type,
            storage_path,
        })
    }

    pub fn open(&self) -> Result<Box<dyn Storage>, StorageError> {
        create_storage(self.storage_type, &self.storage_path)
    }
}
