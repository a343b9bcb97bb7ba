//! mailfw driver runtime
//!
//! This crate provides the supervised worker infrastructure for mailfw.
//! An architect owns exactly one driver worker: it builds the conduit the
//! worker is fed through, starts the worker on a concurrency substrate and
//! hands escalated faults back to a parent handler.
//!
//! # Architecture
//!
//! - `DriverManager::split` yields a `Receiver` (worker side) and an `Emitter`
//!   (architect/caller side) sharing one FIFO queue and one stop flag
//! - The worker runs `run_driver`, which drains the receiver under a crash guard
//! - Faults cross the worker boundary only as an `Interruption`
//!   (worker, category, message), never as an error object
//! - Workers run either on a dedicated OS thread with their own current-thread
//!   tokio runtime, or as a task on the ambient runtime

pub mod architect;
pub mod concurrency;
pub mod conduit;
pub mod config;
pub mod error;
pub mod interruption;
pub mod runner;

pub use architect::{Architect, DriverArchitect};
pub use concurrency::{
    Concurrency, EntryRoutine, TaskConcurrency, ThreadConcurrency, Worker, WorkerState,
};
pub use conduit::{DriverManager, Emitter, Receiver, Serve};
pub use config::{RuntimeConfig, Substrate};
pub use error::{ArchitectError, ConduitError, ConfigError, WorkerError};
pub use interruption::{Fault, HandlerEmitter, HandlerReceiver, Interruption, handler_channel};
pub use runner::run_driver;
