//! Concurrency substrate for driver workers.
//!
//! A `Worker` runs one entry routine. Two substrates are provided:
//! - `ThreadConcurrency`: one OS thread per worker, each with its own
//!   current-thread tokio runtime (no work-stealing between drivers)
//! - `TaskConcurrency`: a task on the ambient tokio runtime
//!
//! Both support cooperative `join` and forced `kill`. A kill cancels the
//! routine at its next await point; if it does not get there within the
//! grace period the worker is detached.

use std::fmt;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::WorkerError;

/// The routine a worker executes.
pub type EntryRoutine = BoxFuture<'static, ()>;

/// Default time `kill` waits for the worker to let go.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(500);

// ─────────────────────────────────────────────────────────────────────────────
// Worker State
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle of a worker. There is no way back from `Joined` or `Killed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Started,
    Joined,
    Killed,
}

impl WorkerState {
    /// Check if the worker is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Joined | WorkerState::Killed)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Created => write!(f, "created"),
            WorkerState::Started => write!(f, "started"),
            WorkerState::Joined => write!(f, "joined"),
            WorkerState::Killed => write!(f, "killed"),
        }
    }
}

fn expect_state(
    name: &str,
    operation: &'static str,
    state: WorkerState,
    expected: WorkerState,
) -> Result<(), WorkerError> {
    if state == expected {
        Ok(())
    } else {
        Err(WorkerError::InvalidState {
            name: name.to_string(),
            operation,
            state,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Traits
// ─────────────────────────────────────────────────────────────────────────────

/// A unit of concurrent execution.
#[async_trait]
pub trait Worker: Send {
    fn name(&self) -> &str;

    fn state(&self) -> WorkerState;

    /// Begin executing the entry routine.
    fn start(&mut self) -> Result<(), WorkerError>;

    /// Wait until the entry routine has returned.
    async fn join(&mut self) -> Result<(), WorkerError>;

    /// Terminate without waiting for the routine to finish.
    async fn kill(&mut self) -> Result<(), WorkerError>;
}

/// Factory for workers.
pub trait Concurrency: Send + Sync + fmt::Debug {
    fn create_worker(&self, name: &str, routine: EntryRoutine) -> Box<dyn Worker>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Thread substrate
// ─────────────────────────────────────────────────────────────────────────────

/// Runs each worker on a dedicated OS thread.
#[derive(Debug, Clone)]
pub struct ThreadConcurrency {
    kill_grace: Duration,
}

impl ThreadConcurrency {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }
}

impl Default for ThreadConcurrency {
    fn default() -> Self {
        Self::new(DEFAULT_KILL_GRACE)
    }
}

impl Concurrency for ThreadConcurrency {
    fn create_worker(&self, name: &str, routine: EntryRoutine) -> Box<dyn Worker> {
        Box::new(ThreadWorker {
            name: name.to_string(),
            state: WorkerState::Created,
            kill_grace: self.kill_grace,
            routine: Some(routine),
            kill_tx: None,
            exited_rx: None,
            thread: None,
        })
    }
}

/// Worker backed by an OS thread.
///
/// Dropping a started worker without joining it kills the routine.
pub struct ThreadWorker {
    name: String,
    state: WorkerState,
    kill_grace: Duration,
    routine: Option<EntryRoutine>,
    kill_tx: Option<oneshot::Sender<()>>,
    /// Resolves (with an error) when the thread closure returns or unwinds.
    exited_rx: Option<oneshot::Receiver<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ThreadWorker {
    fn join_thread(&mut self) -> Result<(), WorkerError> {
        match self.thread.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| WorkerError::Panicked(self.name.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Worker for ThreadWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> WorkerState {
        self.state
    }

    fn start(&mut self) -> Result<(), WorkerError> {
        expect_state(&self.name, "start", self.state, WorkerState::Created)?;
        let Some(routine) = self.routine.take() else {
            return Err(WorkerError::InvalidState {
                name: self.name.clone(),
                operation: "start",
                state: self.state,
            });
        };

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exited_tx, exited_rx) = oneshot::channel::<()>();
        let name = self.name.clone();

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                // Declared first so it is dropped last, after the runtime.
                let _exited = exited_tx;
                tracing::debug!(worker = %name, "Thread started");

                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!(
                            worker = %name,
                            error = %e,
                            "Failed to build worker runtime"
                        );
                        return;
                    }
                };

                rt.block_on(async {
                    tokio::select! {
                        _ = routine => {}
                        _ = kill_rx => {
                            tracing::debug!(worker = %name, "Entry routine cancelled");
                        }
                    }
                });

                rt.shutdown_background();
                tracing::debug!(worker = %name, "Thread exiting");
            })?;

        self.kill_tx = Some(kill_tx);
        self.exited_rx = Some(exited_rx);
        self.thread = Some(handle);
        self.state = WorkerState::Started;
        Ok(())
    }

    async fn join(&mut self) -> Result<(), WorkerError> {
        expect_state(&self.name, "join", self.state, WorkerState::Started)?;
        if let Some(exited) = self.exited_rx.take() {
            let _ = exited.await;
        }
        self.state = WorkerState::Joined;
        // The thread has signalled exit, so this does not block for long.
        self.join_thread()
    }

    async fn kill(&mut self) -> Result<(), WorkerError> {
        expect_state(&self.name, "kill", self.state, WorkerState::Started)?;
        self.state = WorkerState::Killed;
        if let Some(kill) = self.kill_tx.take() {
            let _ = kill.send(());
        }

        let exited = match self.exited_rx.take() {
            Some(exited) => tokio::time::timeout(self.kill_grace, exited).await.is_ok(),
            None => true,
        };

        if exited {
            if let Err(e) = self.join_thread() {
                tracing::warn!(
                    worker = %self.name,
                    error = %e,
                    "Worker panicked while being killed"
                );
            }
        } else {
            tracing::warn!(
                worker = %self.name,
                grace_ms = self.kill_grace.as_millis() as u64,
                "Worker did not stop within grace period, detaching thread"
            );
            self.thread = None;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task substrate
// ─────────────────────────────────────────────────────────────────────────────

/// Runs each worker as a task on the current tokio runtime.
#[derive(Debug, Clone)]
pub struct TaskConcurrency {
    kill_grace: Duration,
}

impl TaskConcurrency {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }
}

impl Default for TaskConcurrency {
    fn default() -> Self {
        Self::new(DEFAULT_KILL_GRACE)
    }
}

impl Concurrency for TaskConcurrency {
    fn create_worker(&self, name: &str, routine: EntryRoutine) -> Box<dyn Worker> {
        Box::new(TaskWorker {
            name: name.to_string(),
            state: WorkerState::Created,
            kill_grace: self.kill_grace,
            routine: Some(routine),
            handle: None,
        })
    }
}

/// Worker backed by a tokio task.
pub struct TaskWorker {
    name: String,
    state: WorkerState,
    kill_grace: Duration,
    routine: Option<EntryRoutine>,
    handle: Option<JoinHandle<()>>,
}

#[async_trait]
impl Worker for TaskWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> WorkerState {
        self.state
    }

    fn start(&mut self) -> Result<(), WorkerError> {
        expect_state(&self.name, "start", self.state, WorkerState::Created)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| WorkerError::NoRuntime(self.name.clone()))?;
        let Some(routine) = self.routine.take() else {
            return Err(WorkerError::InvalidState {
                name: self.name.clone(),
                operation: "start",
                state: self.state,
            });
        };
        self.handle = Some(runtime.spawn(routine));
        self.state = WorkerState::Started;
        Ok(())
    }

    async fn join(&mut self) -> Result<(), WorkerError> {
        expect_state(&self.name, "join", self.state, WorkerState::Started)?;
        self.state = WorkerState::Joined;
        match self.handle.take() {
            Some(handle) => match handle.await {
                Ok(()) => Ok(()),
                Err(e) if e.is_panic() => Err(WorkerError::Panicked(self.name.clone())),
                Err(_) => Ok(()),
            },
            None => Ok(()),
        }
    }

    async fn kill(&mut self) -> Result<(), WorkerError> {
        expect_state(&self.name, "kill", self.state, WorkerState::Started)?;
        self.state = WorkerState::Killed;
        if let Some(handle) = self.handle.take() {
            handle.abort();
            if tokio::time::timeout(self.kill_grace, handle).await.is_err() {
                tracing::warn!(
                    worker = %self.name,
                    grace_ms = self.kill_grace.as_millis() as u64,
                    "Worker task did not stop within grace period, detaching"
                );
            }
        }
        Ok(())
    }
}
