//! Error types for the driver runtime.

use crate::concurrency::WorkerState;

/// Errors returned by architect lifecycle operations.
///
/// These are local contract violations or substrate failures. They are
/// returned to the caller and never escalated through the handler.
#[derive(Debug, thiserror::Error)]
pub enum ArchitectError {
    #[error("Architect {0} has not been started")]
    NotStarted(String),

    #[error("Architect {0} was already started")]
    AlreadyStarted(String),

    #[error("Architect {0} has already terminated")]
    Terminated(String),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

/// Errors raised by the concurrency substrate.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker {name} cannot {operation} while {state}")]
    InvalidState {
        name: String,
        operation: &'static str,
        state: WorkerState,
    },

    #[error("Failed to spawn worker thread: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("No tokio runtime available to spawn worker {0}")]
    NoRuntime(String),

    #[error("Worker {0} panicked")]
    Panicked(String),
}

/// Errors seen by emitter holders when submitting work.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConduitError {
    #[error("Conduit {0} has stopped serving")]
    Stopped(String),

    #[error("Conduit {0} is closed")]
    Closed(String),

    #[error("Conduit {0} dropped the reply")]
    Dropped(String),
}

/// Invalid runtime configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    Invalid { key: String, message: String },
}
