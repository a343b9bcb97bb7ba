//! Runtime configuration.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::concurrency::{Concurrency, TaskConcurrency, ThreadConcurrency};
use crate::conduit::DEFAULT_CAPACITY;
use crate::error::ConfigError;

/// Which concurrency substrate driver workers run on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Substrate {
    /// Dedicated OS thread per worker
    #[default]
    Thread,
    /// Task on the ambient tokio runtime
    Task,
}

impl fmt::Display for Substrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Substrate::Thread => write!(f, "thread"),
            Substrate::Task => write!(f, "task"),
        }
    }
}

impl FromStr for Substrate {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "thread" => Ok(Substrate::Thread),
            "task" => Ok(Substrate::Task),
            other => Err(ConfigError::Invalid {
                key: "runtime.substrate".to_string(),
                message: format!("unknown substrate '{other}', expected 'thread' or 'task'"),
            }),
        }
    }
}

/// Settings for architects and their workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub substrate: Substrate,
    /// Bound of each driver's command queue.
    pub queue_capacity: usize,
    /// How long `kill` waits before detaching a worker.
    pub kill_grace_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            substrate: Substrate::Thread,
            queue_capacity: DEFAULT_CAPACITY,
            kill_grace_ms: 500,
        }
    }
}

impl RuntimeConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "runtime.queue_capacity".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Build the configured substrate.
    pub fn concurrency(&self) -> Arc<dyn Concurrency> {
        match self.substrate {
            Substrate::Thread => Arc::new(ThreadConcurrency::new(self.kill_grace())),
            Substrate::Task => Arc::new(TaskConcurrency::new(self.kill_grace())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.substrate, Substrate::Thread);
        assert_eq!(config.queue_capacity, DEFAULT_CAPACITY);
        assert_eq!(config.kill_grace(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RuntimeConfig = serde_json::from_str(r#"{"substrate": "task"}"#).unwrap();
        assert_eq!(config.substrate, Substrate::Task);
        assert_eq!(config.queue_capacity, DEFAULT_CAPACITY);
    }

    #[test]
    fn test_zero_capacity_is_invalid() {
        let config = RuntimeConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key, .. }) if key == "runtime.queue_capacity"
        ));
    }

    #[test]
    fn test_substrate_parsing() {
        assert_eq!("Thread".parse::<Substrate>().unwrap(), Substrate::Thread);
        assert_eq!(" task ".parse::<Substrate>().unwrap(), Substrate::Task);
        assert!("process".parse::<Substrate>().is_err());
        assert_eq!(Substrate::Task.to_string(), "task");
    }
}
