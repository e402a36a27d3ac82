use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

const VALID_STORAGE_TYPES: &[&str] = &["json", "sqlite"];
const VALID_SYNC_MODES: &[&str] = &["transaction", "retry"];

/// Every key understood by [`ConfigManager`], in listing order.
pub const KEYS: &[&str] = &[
    "storage.type",
    "storage.path",
    "sync.mode",
    "sync.max-attempts",
    "sync.backoff-ms",
    "sync.timeout-ms",
    "page-size",
    "default-user",
];

fn validate_storage_path(path: &str) -> Result<PathBuf, ConfigError> {
    if path.contains('\0') {
        return Err(ConfigError::InvalidConfig(
            "Path contains invalid characters".to_string(),
        ));
    }
    if path.trim().is_empty() {
        return Err(ConfigError::InvalidConfig(
            "Path cannot be empty".to_string(),
        ));
    }

    let path = PathBuf::from(shellexpand::tilde(path).to_string());

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            return Err(ConfigError::InvalidConfig(format!(
                "Parent directory does not exist: {}",
                parent.display()
            )));
        }
    }

    Ok(path)
}

fn validate_choice(key: &str, value: &str, valid: &[&str]) -> Result<(), ConfigError> {
    if !valid.contains(&value) {
        return Err(ConfigError::InvalidConfig(format!(
            "{} must be one of: {}",
            key,
            valid.join(", ")
        )));
    }
    Ok(())
}

fn validate_number(key: &str, value: &str, min: u64) -> Result<u64, ConfigError> {
    match value.parse::<u64>() {
        Ok(n) if n >= min => Ok(n),
        _ => Err(ConfigError::InvalidConfig(format!(
            "{} must be an integer >= {}",
            key, min
        ))),
    }
}

fn validate_u32(key: &str, value: &str, min: u64) -> Result<u32, ConfigError> {
    u32::try_from(validate_number(key, value, min)?).map_err(|_| {
        ConfigError::InvalidConfig(format!("{} must be at most {}", key, u32::MAX))
    })
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_backoff_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_user: Option<String>,
}

impl Config {
    pub fn with_defaults() -> Self {
        Self {
            storage_type: Some("json".to_string()),
            storage_path: Some(default_storage_path()),
            sync_mode: Some("transaction".to_string()),
            sync_max_attempts: Some(3),
            sync_backoff_ms: Some(50),
            sync_timeout_ms: Some(5000),
            page_size: Some(10),
            default_user: None,
        }
    }

    /// Fills every unset field from [`Config::with_defaults`].
    pub fn resolved(&self) -> Self {
        let defaults = Self::with_defaults();
        Self {
            storage_type: self.storage_type.clone().or(defaults.storage_type),
            storage_path: self.storage_path.clone().or(defaults.storage_path),
            sync_mode: self.sync_mode.clone().or(defaults.sync_mode),
            sync_max_attempts: self.sync_max_attempts.or(defaults.sync_max_attempts),
            sync_backoff_ms: self.sync_backoff_ms.or(defaults.sync_backoff_ms),
            sync_timeout_ms: self.sync_timeout_ms.or(defaults.sync_timeout_ms),
            page_size: self.page_size.or(defaults.page_size),
            default_user: self.default_user.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref storage_type) = self.storage_type {
            validate_choice("storage.type", storage_type, VALID_STORAGE_TYPES)?;
        }
        if let Some(ref mode) = self.sync_mode {
            validate_choice("sync.mode", mode, VALID_SYNC_MODES)?;
        }
        if self.sync_max_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "sync.max-attempts must be an integer >= 1".to_string(),
            ));
        }
        if self.sync_timeout_ms == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "sync.timeout-ms must be an integer >= 1".to_string(),
            ));
        }
        if self.page_size == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "page-size must be an integer >= 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "storage.type" => self.storage_type.clone(),
            "storage.path" => self.storage_path.clone(),
            "sync.mode" => self.sync_mode.clone(),
            "sync.max-attempts" => self.sync_max_attempts.map(|v| v.to_string()),
            "sync.backoff-ms" => self.sync_backoff_ms.map(|v| v.to_string()),
            "sync.timeout-ms" => self.sync_timeout_ms.map(|v| v.to_string()),
            "page-size" => self.page_size.map(|v| v.to_string()),
            "default-user" => self.default_user.clone(),
            _ => None,
        }
    }
}

fn config_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".config").join("trtasks"))
        .unwrap_or_else(|| PathBuf::from(".trtasks"))
}

fn default_storage_path() -> String {
    config_dir().join("data.json").to_string_lossy().to_string()
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Reads and edits the JSON config file. The loaded [`Config`] is handed to the
/// rest of the program once at startup.
pub struct ConfigManager {
    path: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Loads `path` (or the default location); a missing or empty file yields an
    /// empty config that resolves to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map_or_else(default_config_path, |p| {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).to_string())
        });

        let config = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            if contents.trim().is_empty() {
                Config::default()
            } else {
                serde_json::from_str(&contents)?
            }
        } else {
            Config::default()
        };
        config.validate()?;

        Ok(Self { path, config })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored values with defaults filled in.
    pub fn effective(&self) -> Config {
        self.config.resolved()
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(&self.config)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.effective().get(key)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut config = self.config.clone();
        match key {
            "storage.type" => {
                validate_choice(key, value, VALID_STORAGE_TYPES)?;
                config.storage_type = Some(value.to_string());
            }
            "storage.path" => {
                let path = validate_storage_path(value)?;
                config.storage_path = Some(path.to_string_lossy().to_string());
            }
            "sync.mode" => {
                validate_choice(key, value, VALID_SYNC_MODES)?;
                config.sync_mode = Some(value.to_string());
            }
            "sync.max-attempts" => {
                config.sync_max_attempts = Some(validate_u32(key, value, 1)?);
            }
            "sync.backoff-ms" => {
                config.sync_backoff_ms = Some(validate_number(key, value, 0)?);
            }
            "sync.timeout-ms" => {
                config.sync_timeout_ms = Some(validate_number(key, value, 1)?);
            }
            "page-size" => {
                config.page_size = Some(validate_u32(key, value, 1)?);
            }
            "default-user" => {
                if value.trim().is_empty() {
                    return Err(ConfigError::InvalidConfig(
                        "default-user cannot be empty".to_string(),
                    ));
                }
                config.default_user = Some(value.to_string());
            }
            _ => return Err(ConfigError::InvalidKey(key.to_string())),
        }
        config.validate()?;
        self.config = config;
        self.save()
    }

    pub fn unset(&mut self, key: &str) -> Result<(), ConfigError> {
        match key {
            "storage.type" => self.config.storage_type = None,
            "storage.path" => self.config.storage_path = None,
            "sync.mode" => self.config.sync_mode = None,
            "sync.max-attempts" => self.config.sync_max_attempts = None,
            "sync.backoff-ms" => self.config.sync_backoff_ms = None,
            "sync.timeout-ms" => self.config.sync_timeout_ms = None,
            "page-size" => self.config.page_size = None,
            "default-user" => self.config.default_user = None,
            _ => return Err(ConfigError::InvalidKey(key.to_string())),
        }
        self.save()
    }

    /// `(key, effective value, is_default)` for every known key.
    pub fn list(&self) -> Vec<(String, String, bool)> {
        let effective = self.effective();
        KEYS.iter()
            .map(|key| {
                let is_default = self.config.get(key).is_none();
                let value = effective.get(key).unwrap_or_else(|| "null".to_string());
                (key.to_string(), value, is_default)
            })
            .collect()
    }
}
