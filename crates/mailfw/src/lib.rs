//! mailfw - supervised mail drivers
//!
//! This crate wires the driver runtime into an application:
//! - Configuration loading (TOML file + `MAILFW_` environment overrides)
//! - A parent supervisor that replaces interrupted driver workers
//! - A Maildir driver used by the command line

// Re-export the runtime crate
pub use mailfw_runtime;

// Configuration
pub mod config;

// Maildir driver
pub mod maildir;

// Parent supervisor
pub mod supervisor;
