use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::types::{BackendDescriptor, Config, TransportConfig, MAIN_PROFILE};

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Config validation failed: {message}")]
    ValidationError { message: String },

    /// A single backend is malformed. Only that backend is skipped.
    #[error("Backend '{backend}' is invalid: {reason}")]
    InvalidBackend { backend: String, reason: String },
}

impl Config {
    /// Returns the path to the configuration file.
    ///
    /// Uses `~/.config/keyfleet/config.toml` on Unix/macOS,
    /// or equivalent on other platforms via `dirs::config_dir()`.
    /// Falls back to current directory if config_dir is unavailable.
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        config_dir.join("keyfleet").join("config.toml")
    }

    /// Loads configuration from the default config file.
    ///
    /// - If the file doesn't exist, returns `Config::default()`.
    /// - Otherwise behaves like [`Config::load_from`].
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path();

        if !path.exists() {
            return Ok(Config::default());
        }

        Self::load_from(&path)
    }

    /// Loads and validates configuration from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validates settings that affect every backend.
    ///
    /// Checks:
    /// - Backend names are unique
    /// - At least one attempt per operation
    /// - A non-zero fan-out limit
    ///
    /// Individual backends are checked separately by
    /// [`BackendDescriptor::validate`] so that one malformed entry does not
    /// take the others down.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.defaults.max_attempts == 0 {
            return Err(ConfigError::ValidationError {
                message: "max_attempts must be at least 1".to_string(),
            });
        }

        if self.defaults.fanout_limit == 0 {
            return Err(ConfigError::ValidationError {
                message: "fanout_limit must be at least 1".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.name.as_str()) {
                return Err(ConfigError::ValidationError {
                    message: format!("Backend name '{}' is used more than once", backend.name),
                });
            }
        }

        Ok(())
    }
}

impl BackendDescriptor {
    /// Checks that this backend can be used at all.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidBackend {
            backend: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name is empty"));
        }
        if self.address.trim().is_empty() {
            return Err(invalid("address is empty"));
        }
        if !self.profiles.contains_key(MAIN_PROFILE) {
            return Err(invalid("no 'main' endpoint profile"));
        }

        match &self.transport {
            TransportConfig::Panel(panel) => {
                let url = reqwest::Url::parse(&panel.url)
                    .map_err(|e| invalid(&format!("panel url '{}': {}", panel.url, e)))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(invalid("panel url must be http or https"));
                }
                if panel.username.is_empty() || panel.password.is_empty() {
                    return Err(invalid("panel username and password are required"));
                }
            }
            TransportConfig::Shell(shell) => {
                if shell.agent_command.trim().is_empty() {
                    return Err(invalid("agent_command is empty"));
                }
                if shell.password.is_none() && shell.identity_file.is_none() {
                    return Err(invalid("shell transport needs a password or identity_file"));
                }
            }
        }

        Ok(())
    }
}
