//! Application configuration.
//!
//! Sources, later ones win:
//! 1. built-in defaults
//! 2. a TOML file (`--config`)
//! 3. `MAILFW_*` environment variables, `__` separating sections
//!    (e.g. `MAILFW_RUNTIME__SUBSTRATE=task`)

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use mailfw_runtime::RuntimeConfig;
use serde::{Deserialize, Serialize};

use crate::supervisor::RestartPolicy;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "MAILFW_";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Failed to render configuration: {0}")]
    Render(String),

    #[error(transparent)]
    Runtime(#[from] mailfw_runtime::ConfigError),

    #[error("Invalid configuration value for {key}: {message}")]
    Invalid { key: String, message: String },
}

/// Top-level configuration (mailfw.toml)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Base name of driver workers; each restart appends a generation.
    pub worker_name: String,
    pub runtime: RuntimeConfig,
    pub restart: RestartPolicy,
    pub maildir: MaildirConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            worker_name: "maildir".to_string(),
            runtime: RuntimeConfig::default(),
            restart: RestartPolicy::default(),
            maildir: MaildirConfig::default(),
        }
    }
}

/// Maildir location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaildirConfig {
    pub root: PathBuf,
}

impl Default for MaildirConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./Maildir"),
        }
    }
}

impl AppConfig {
    /// Load defaults, then `path` (if any), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            figment = figment.merge(Toml::file(path));
        }

        let config: AppConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "worker_name".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        self.runtime.validate()?;
        self.restart.validate()?;
        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Render(e.to_string()))
    }
}
