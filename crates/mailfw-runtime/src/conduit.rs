//! Conduit between an architect and its driver worker.
//!
//! `DriverManager::split` turns a driver into exactly one `Receiver` (owned
//! by the worker) and one `Emitter` (owned by the architect, cloneable for
//! callers). Both ends share one FIFO queue and one stop flag.
//!
//! Stopping enqueues a marker behind everything already submitted, so the
//! receiver drains all earlier work before it observes the stop.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::error::ConduitError;
use crate::interruption::Fault;

/// Default queue capacity when none is configured.
pub const DEFAULT_CAPACITY: usize = 64;

// ─────────────────────────────────────────────────────────────────────────────
// Serve
// ─────────────────────────────────────────────────────────────────────────────

/// Business logic executed by a driver worker, one command at a time.
#[async_trait]
pub trait Serve: Send + 'static {
    /// Work submitted through the emitter.
    type Command: Send + 'static;
    /// Result handed back to `Emitter::call`.
    type Reply: Send + 'static;
    /// Failure escalated to the parent handler.
    type Error: Fault;

    async fn serve(&mut self, command: Self::Command) -> Result<Self::Reply, Self::Error>;
}

/// Queue entry.
enum Envelope<S: Serve> {
    Item {
        command: S::Command,
        reply: Option<oneshot::Sender<S::Reply>>,
    },
    Stop,
}

struct Shared<S: Serve> {
    name: String,
    stopped: AtomicBool,
    /// `None` once stop was requested. Submissions and the stop marker go
    /// through this lock so nothing can be queued behind the marker.
    gate: Mutex<Option<mpsc::Sender<Envelope<S>>>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Builds the conduit for one driver.
pub struct DriverManager<S: Serve> {
    name: String,
    driver: S,
    capacity: usize,
}

impl<S: Serve> DriverManager<S> {
    pub fn new(name: impl Into<String>, driver: S, capacity: usize) -> Self {
        Self {
            name: name.into(),
            driver,
            capacity: capacity.max(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Split into the worker-side receiver and the control-side emitter.
    pub fn split(self) -> (Receiver<S>, Emitter<S>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let shared = Arc::new(Shared {
            name: self.name.clone(),
            stopped: AtomicBool::new(false),
            gate: Mutex::new(Some(tx)),
        });
        let receiver = Receiver {
            name: self.name,
            driver: self.driver,
            rx,
            served: 0,
        };
        (receiver, Emitter { shared })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Receiver
// ─────────────────────────────────────────────────────────────────────────────

/// Worker side of the conduit.
pub struct Receiver<S: Serve> {
    name: String,
    driver: S,
    rx: mpsc::Receiver<Envelope<S>>,
    served: u64,
}

impl<S: Serve> Receiver<S> {
    /// Pull the next command and serve it.
    ///
    /// Waits until work or the stop marker arrives. Returns `Ok(false)` when
    /// the loop must end: stop was reached, or every emitter is gone.
    pub async fn serve_next(&mut self) -> Result<bool, S::Error> {
        match self.rx.recv().await {
            Some(Envelope::Item { command, reply }) => {
                let output = self.driver.serve(command).await?;
                self.served += 1;
                if let Some(reply) = reply {
                    // Caller may have given up waiting.
                    let _ = reply.send(output);
                }
                Ok(true)
            }
            Some(Envelope::Stop) | None => Ok(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of commands served successfully.
    pub fn served(&self) -> u64 {
        self.served
    }

    pub fn driver(&self) -> &S {
        &self.driver
    }
}

impl<S: Serve> fmt::Debug for Receiver<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("name", &self.name)
            .field("served", &self.served)
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Emitter
// ─────────────────────────────────────────────────────────────────────────────

/// Control side of the conduit.
///
/// Cheap to clone; every clone feeds the same receiver. The receiver sees
/// exhaustion once all clones are dropped.
pub struct Emitter<S: Serve> {
    shared: Arc<Shared<S>>,
}

impl<S: Serve> Clone for Emitter<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Serve> Emitter<S> {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Request a cooperative stop. Idempotent.
    ///
    /// Work submitted before this call is still served. If the queue is full
    /// this waits for the worker to make room.
    pub async fn stop_serving(&self) {
        let mut gate = self.shared.gate.lock().await;
        let Some(tx) = gate.take() else {
            return;
        };
        self.shared.stopped.store(true, Ordering::SeqCst);
        if tx.send(Envelope::Stop).await.is_err() {
            tracing::debug!(conduit = %self.shared.name, "Receiver already gone at stop");
        }
    }

    /// Submit a command without waiting for its result.
    pub async fn submit(&self, command: S::Command) -> Result<(), ConduitError> {
        self.send(Envelope::Item {
            command,
            reply: None,
        })
        .await
    }

    /// Submit a command and wait for the driver's reply.
    ///
    /// Fails with `ConduitError::Dropped` when the driver faulted on this
    /// command (the fault itself goes to the handler, not to the caller).
    pub async fn call(&self, command: S::Command) -> Result<S::Reply, ConduitError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Envelope::Item {
            command,
            reply: Some(reply_tx),
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| ConduitError::Dropped(self.shared.name.clone()))
    }

    /// Whether both emitters feed the same conduit.
    pub fn same_conduit(&self, other: &Emitter<S>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    async fn send(&self, envelope: Envelope<S>) -> Result<(), ConduitError> {
        let gate = self.shared.gate.lock().await;
        let tx = gate
            .as_ref()
            .ok_or_else(|| ConduitError::Stopped(self.shared.name.clone()))?;
        tx.send(envelope)
            .await
            .map_err(|_| ConduitError::Closed(self.shared.name.clone()))
    }
}

impl<S: Serve> fmt::Debug for Emitter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("name", &self.shared.name)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
