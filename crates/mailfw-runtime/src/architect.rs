//! Architects: supervisors owning one driver worker each.
//!
//! The architect builds the conduit, keeps the emitter half and hands the
//! receiver half to a worker running `run_driver`. Escalation wiring is fixed
//! once, in `start`.
//!
//! Lifecycle: Created → Started → Terminated (via `join` or `kill`).

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::Instrument;

use crate::concurrency::{Concurrency, Worker, WorkerState};
use crate::conduit::{DEFAULT_CAPACITY, DriverManager, Emitter, Serve};
use crate::config::RuntimeConfig;
use crate::error::ArchitectError;
use crate::interruption::HandlerEmitter;
use crate::runner::run_driver;

/// Operations every architect supports.
#[async_trait]
pub trait Architect: Send {
    type Driver: Serve;

    /// Build the conduit and start the worker. Allowed once.
    fn start(&mut self, handler: HandlerEmitter) -> Result<(), ArchitectError>;

    /// The retained emitter, stable from `start` onwards.
    fn emitter(&self) -> Result<&Emitter<Self::Driver>, ArchitectError>;

    /// Request a cooperative stop, then wait for the worker to finish.
    async fn join(&mut self) -> Result<(), ArchitectError>;

    /// Terminate the worker without a cooperative stop.
    async fn kill(&mut self) -> Result<(), ArchitectError>;
}

/// Architect for a single driver.
pub struct DriverArchitect<S: Serve> {
    worker_name: String,
    concurrency: Arc<dyn Concurrency>,
    queue_capacity: usize,
    /// Consumed by `start`.
    driver: Option<S>,
    emitter: Option<Emitter<S>>,
    worker: Option<Box<dyn Worker>>,
    terminated: bool,
}

impl<S: Serve> DriverArchitect<S> {
    pub fn new(
        worker_name: impl Into<String>,
        driver: S,
        concurrency: Arc<dyn Concurrency>,
    ) -> Self {
        let worker_name = worker_name.into();
        tracing::debug!(worker = %worker_name, "Architect created");
        Self {
            worker_name,
            concurrency,
            queue_capacity: DEFAULT_CAPACITY,
            driver: Some(driver),
            emitter: None,
            worker: None,
            terminated: false,
        }
    }

    /// Build an architect with the configured substrate and queue size.
    pub fn from_config(worker_name: impl Into<String>, driver: S, config: &RuntimeConfig) -> Self {
        Self::new(worker_name, driver, config.concurrency())
            .with_queue_capacity(config.queue_capacity)
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn is_started(&self) -> bool {
        self.worker.is_some()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// State of the underlying worker, once created.
    pub fn worker_state(&self) -> Option<WorkerState> {
        self.worker.as_ref().map(|w| w.state())
    }

    fn live_worker(&mut self) -> Result<&mut Box<dyn Worker>, ArchitectError> {
        if self.terminated {
            return Err(ArchitectError::Terminated(self.worker_name.clone()));
        }
        self.worker
            .as_mut()
            .ok_or_else(|| ArchitectError::NotStarted(self.worker_name.clone()))
    }
}

#[async_trait]
impl<S: Serve> Architect for DriverArchitect<S> {
    type Driver = S;

    fn start(&mut self, handler: HandlerEmitter) -> Result<(), ArchitectError> {
        if self.terminated {
            return Err(ArchitectError::Terminated(self.worker_name.clone()));
        }
        let driver = self
            .driver
            .take()
            .ok_or_else(|| ArchitectError::AlreadyStarted(self.worker_name.clone()))?;

        tracing::debug!(worker = %self.worker_name, "Starting driver manager");

        let (receiver, emitter) =
            DriverManager::new(self.worker_name.clone(), driver, self.queue_capacity).split();
        let span = tracing::info_span!("driver", worker = %self.worker_name);
        let routine = run_driver(self.worker_name.clone(), receiver, handler)
            .instrument(span)
            .boxed();

        let mut worker = self.concurrency.create_worker(&self.worker_name, routine);
        if let Err(e) = worker.start() {
            self.terminated = true;
            return Err(e.into());
        }

        self.emitter = Some(emitter);
        self.worker = Some(worker);
        Ok(())
    }

    fn emitter(&self) -> Result<&Emitter<S>, ArchitectError> {
        match &self.emitter {
            Some(emitter) => Ok(emitter),
            None if self.terminated => Err(ArchitectError::Terminated(self.worker_name.clone())),
            None => Err(ArchitectError::NotStarted(self.worker_name.clone())),
        }
    }

    async fn join(&mut self) -> Result<(), ArchitectError> {
        self.live_worker()?;
        if let Some(emitter) = self.emitter.clone() {
            emitter.stop_serving().await;
        }

        let worker = self.live_worker()?;
        let result = worker.join().await;
        self.terminated = true;
        tracing::debug!(worker = %self.worker_name, "Architect joined");
        result.map_err(ArchitectError::from)
    }

    async fn kill(&mut self) -> Result<(), ArchitectError> {
        let worker = self.live_worker()?;
        let result = worker.kill().await;
        self.terminated = true;
        tracing::debug!(worker = %self.worker_name, "Architect killed worker");
        result.map_err(ArchitectError::from)
    }
}

impl<S: Serve> Drop for DriverArchitect<S> {
    fn drop(&mut self) {
        if self.worker.is_some() && !self.terminated {
            tracing::warn!(
                worker = %self.worker_name,
                "Architect dropped without join or kill"
            );
        }
    }
}
