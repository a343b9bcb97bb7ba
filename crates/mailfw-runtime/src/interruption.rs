//! Fault escalation from a driver worker to its parent supervisor.
//!
//! Only the category and message of a fault leave the worker. The full
//! diagnostic (source chain, backtrace) is logged where the fault happened.

use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Category used when the driver panicked instead of returning an error.
pub const PANIC_CATEGORY: &str = "panic";

const EMPTY_MESSAGE: &str = "(no message)";

// ─────────────────────────────────────────────────────────────────────────────
// Interruption
// ─────────────────────────────────────────────────────────────────────────────

/// A fault escalated by a driver worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interruption {
    /// Name of the worker that failed.
    pub worker: String,
    /// Fault category (error kind, or `panic`).
    pub category: String,
    /// Human-readable message.
    pub message: String,
    /// When the fault was caught.
    pub occurred_at: DateTime<Utc>,
}

impl Interruption {
    /// Build an interruption. Empty categories and messages are replaced so
    /// the parent always receives something printable.
    pub fn new(
        worker: impl Into<String>,
        category: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let category = category.into();
        let message = message.into();
        Self {
            worker: worker.into(),
            category: if category.trim().is_empty() {
                "unknown".to_string()
            } else {
                category
            },
            message: if message.trim().is_empty() {
                EMPTY_MESSAGE.to_string()
            } else {
                message
            },
            occurred_at: Utc::now(),
        }
    }

    /// Whether the worker panicked rather than returning an error.
    pub fn is_panic(&self) -> bool {
        self.category == PANIC_CATEGORY
    }
}

impl fmt::Display for Interruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} interrupted ({}): {}", self.worker, self.category, self.message)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fault
// ─────────────────────────────────────────────────────────────────────────────

/// An error a driver may return from `Serve::serve`.
///
/// `category` names the kind of failure for the parent. The default is the
/// error type's short name.
pub trait Fault: std::error::Error + Send + Sync + 'static {
    fn category(&self) -> Cow<'_, str> {
        Cow::Borrowed(short_type_name(std::any::type_name::<Self>()))
    }
}

impl Fault for std::io::Error {
    fn category(&self) -> Cow<'_, str> {
        Cow::Borrowed("io")
    }
}

impl Fault for std::convert::Infallible {}

/// `alloc::string::String` -> `String`, `a::Wrapper<b::C>` -> `Wrapper`.
fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

// ─────────────────────────────────────────────────────────────────────────────
// Handler channel
// ─────────────────────────────────────────────────────────────────────────────

/// Escalation endpoint handed to a worker.
///
/// Sending is fire-and-forget and never blocks the failing worker. When the
/// parent's receiver is gone the interruption is logged and dropped, so
/// delivery is at most once.
#[derive(Debug, Clone)]
pub struct HandlerEmitter {
    tx: mpsc::UnboundedSender<Interruption>,
}

impl HandlerEmitter {
    /// Escalate a fault to the parent handler.
    pub fn interruption_error(&self, interruption: Interruption) {
        if let Err(mpsc::error::SendError(lost)) = self.tx.send(interruption) {
            tracing::warn!(
                worker = %lost.worker,
                category = %lost.category,
                message = %lost.message,
                "Parent handler is gone, interruption dropped"
            );
        }
    }

    /// Whether the parent side still listens.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Parent side of the escalation channel.
#[derive(Debug)]
pub struct HandlerReceiver {
    rx: mpsc::UnboundedReceiver<Interruption>,
}

impl HandlerReceiver {
    /// Wait for the next interruption. Returns `None` once every
    /// `HandlerEmitter` is dropped and nothing is buffered.
    pub async fn recv(&mut self) -> Option<Interruption> {
        self.rx.recv().await
    }

    /// Take a buffered interruption without waiting.
    pub fn try_recv(&mut self) -> Option<Interruption> {
        self.rx.try_recv().ok()
    }
}

/// Create a connected escalation pair.
pub fn handler_channel() -> (HandlerEmitter, HandlerReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (HandlerEmitter { tx }, HandlerReceiver { rx })
}
