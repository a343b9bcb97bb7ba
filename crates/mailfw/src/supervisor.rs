//! Parent supervisor with worker replacement and exponential backoff
//!
//! The supervisor holds the parent end of the escalation channel. When a
//! driver worker is interrupted it reaps the old architect, records the
//! failed command, waits out the backoff and starts a fresh architect for the
//! commands that are left. Failed commands are not retried.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use mailfw_runtime::{
    Architect, Concurrency, ConduitError, DriverArchitect, Emitter, HandlerReceiver,
    Interruption, handler_channel,
};
use serde::{Deserialize, Serialize};

use crate::config::{AppConfig, ConfigError};
use crate::maildir::{MaildirCommand, MaildirDriver, MaildirReply};

// ─────────────────────────────────────────────────────────────────────────────
// Restart Policy
// ─────────────────────────────────────────────────────────────────────────────

/// How interrupted driver workers are replaced (`[restart]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// Replacements allowed inside one window before the run is abandoned
    pub max_restarts: u32,
    /// Delay before the first replacement worker
    pub initial_backoff_ms: u64,
    /// Upper bound on the delay between replacements
    pub max_backoff_ms: u64,
    /// Factor applied to the delay after every replacement
    pub backoff_multiplier: f64,
    /// A worker that serves this long without interruption clears the count
    pub restart_window_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            initial_backoff_ms: 250,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            restart_window_ms: 300_000,
        }
    }
}

impl RestartPolicy {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn restart_window(&self) -> Duration {
        Duration::from_millis(self.restart_window_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                key: "restart.backoff_multiplier".to_string(),
                message: "must be a finite value of at least 1.0".to_string(),
            });
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::Invalid {
                key: "restart.max_backoff_ms".to_string(),
                message: "must not be below restart.initial_backoff_ms".to_string(),
            });
        }
        Ok(())
    }

    fn grow(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.backoff_multiplier).min(self.max_backoff())
    }
}

/// Counts worker generations replaced after an interruption and hands out
/// the delay before each replacement.
#[derive(Debug)]
pub struct RestartTracker {
    policy: RestartPolicy,
    restart_count: u32,
    last_restart: Option<Instant>,
    next_delay: Duration,
    serving_since: Option<Instant>,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        let next_delay = policy.initial_backoff();
        Self {
            policy,
            restart_count: 0,
            last_restart: None,
            next_delay,
            serving_since: None,
        }
    }

    /// A worker generation has started serving.
    pub fn on_start(&mut self) {
        self.serving_since = Some(Instant::now());
    }

    /// The current generation escalated an interruption.
    ///
    /// Returns how long to wait before starting the next generation, or
    /// `None` once the policy allows no further replacement.
    pub fn on_interruption(&mut self) -> Option<Duration> {
        let now = Instant::now();

        let served = self.serving_since.map(|since| now.duration_since(since));
        if served.is_some_and(|served| served >= self.policy.restart_window()) {
            self.reset();
        }

        self.restart_count += 1;
        if self.restart_count > self.policy.max_restarts {
            return None;
        }

        let delay = self.next_delay;
        self.next_delay = self.policy.grow(delay);
        self.last_restart = Some(now);
        Some(delay)
    }

    /// Forget earlier replacements and start over from the initial delay.
    pub fn reset(&mut self) {
        self.restart_count = 0;
        self.next_delay = self.policy.initial_backoff();
        self.last_restart = None;
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// When the latest replacement was granted.
    pub fn last_restart(&self) -> Option<Instant> {
        self.last_restart
    }

    /// No replacement is left in the current window.
    pub fn is_exhausted(&self) -> bool {
        self.restart_count >= self.policy.max_restarts
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Report
// ─────────────────────────────────────────────────────────────────────────────

/// What happened to one command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandOutcome {
    Completed {
        command: MaildirCommand,
        reply: MaildirReply,
    },
    Interrupted {
        command: MaildirCommand,
        interruption: Interruption,
    },
}

/// Result of a supervised run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SupervisorReport {
    pub outcomes: Vec<CommandOutcome>,
    /// Number of architects started.
    pub generations: u32,
}

impl SupervisorReport {
    pub fn interruptions(&self) -> impl Iterator<Item = &Interruption> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            CommandOutcome::Interrupted { interruption, .. } => Some(interruption),
            CommandOutcome::Completed { .. } => None,
        })
    }

    pub fn is_clean(&self) -> bool {
        self.interruptions().next().is_none()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Supervisor
// ─────────────────────────────────────────────────────────────────────────────

/// Runs commands through a supervised Maildir driver.
pub struct Supervisor {
    config: AppConfig,
    concurrency: Arc<dyn Concurrency>,
    tracker: RestartTracker,
}

impl Supervisor {
    pub fn new(config: AppConfig) -> Self {
        let concurrency = config.runtime.concurrency();
        let tracker = RestartTracker::new(config.restart.clone());
        Self {
            config,
            concurrency,
            tracker,
        }
    }

    pub fn tracker(&self) -> &RestartTracker {
        &self.tracker
    }

    /// Serve `commands` in order, replacing the driver worker whenever it
    /// is interrupted. Fails once the restart policy is exhausted.
    pub async fn run(&mut self, commands: Vec<MaildirCommand>) -> Result<SupervisorReport> {
        let mut pending: VecDeque<MaildirCommand> = commands.into();
        let mut report = SupervisorReport::default();

        loop {
            report.generations += 1;
            let name = format!("{}-{}", self.config.worker_name, report.generations);
            let driver = MaildirDriver::new(&self.config.maildir.root);
            let mut architect = DriverArchitect::new(name, driver, self.concurrency.clone())
                .with_queue_capacity(self.config.runtime.queue_capacity);

            let (handler, mut interruptions) = handler_channel();
            architect
                .start(handler)
                .with_context(|| format!("starting driver worker {}", architect.worker_name()))?;
            self.tracker.on_start();

            let emitter = architect.emitter()?.clone();
            let failed =
                serve_pending(&emitter, &mut pending, &mut interruptions, &mut report).await;

            // After an interruption the runner has already exited, so join
            // only reaps it.
            architect.join().await?;

            let Some(interruption) = failed? else {
                tracing::info!(
                    worker = %architect.worker_name(),
                    served = report.outcomes.len(),
                    "All commands served"
                );
                return Ok(report);
            };

            tracing::warn!(
                worker = %interruption.worker,
                category = %interruption.category,
                message = %interruption.message,
                "Driver worker interrupted"
            );

            if pending.is_empty() {
                return Ok(report);
            }

            match self.tracker.on_interruption() {
                Some(delay) => {
                    tracing::info!(
                        delay_ms = delay.as_millis() as u64,
                        restarts = self.tracker.restart_count(),
                        remaining = pending.len(),
                        "Replacing driver worker"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => bail!(
                    "giving up after {} restarts, last interruption: {interruption}",
                    self.config.restart.max_restarts
                ),
            }
        }
    }
}

/// Feed pending commands one at a time. Returns the interruption that ended
/// the worker, if any; the failed command is consumed.
async fn serve_pending(
    emitter: &Emitter<MaildirDriver>,
    pending: &mut VecDeque<MaildirCommand>,
    interruptions: &mut HandlerReceiver,
    report: &mut SupervisorReport,
) -> Result<Option<Interruption>> {
    while let Some(command) = pending.pop_front() {
        match emitter.call(command.clone()).await {
            Ok(reply) => report.outcomes.push(CommandOutcome::Completed { command, reply }),
            Err(ConduitError::Dropped(_) | ConduitError::Closed(_)) => {
                let interruption = interruptions
                    .recv()
                    .await
                    .context("driver worker exited without escalating")?;
                report.outcomes.push(CommandOutcome::Interrupted {
                    command,
                    interruption: interruption.clone(),
                });
                return Ok(Some(interruption));
            }
            Err(e @ ConduitError::Stopped(_)) => return Err(e.into()),
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maildir::tests::create_test_maildir;
    use mailfw_runtime::Substrate;

    fn fast_policy(max_restarts: u32) -> RestartPolicy {
        RestartPolicy {
            max_restarts,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            ..Default::default()
        }
    }

    fn count(folder: &str) -> MaildirCommand {
        MaildirCommand::CountMessages {
            folder: folder.to_string(),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut tracker = RestartTracker::new(RestartPolicy {
            max_restarts: 4,
            initial_backoff_ms: 100,
            max_backoff_ms: 300,
            ..Default::default()
        });
        tracker.on_start();

        assert_eq!(tracker.on_interruption(), Some(Duration::from_millis(100)));
        assert_eq!(tracker.on_interruption(), Some(Duration::from_millis(200)));
        assert_eq!(tracker.on_interruption(), Some(Duration::from_millis(300)));
        assert_eq!(tracker.on_interruption(), Some(Duration::from_millis(300)));
        assert!(tracker.is_exhausted());
        assert!(tracker.last_restart().is_some());
        assert_eq!(tracker.on_interruption(), None);
    }

    #[test]
    fn test_reset_restores_initial_backoff() {
        let mut tracker = RestartTracker::new(fast_policy(2));
        tracker.on_interruption();
        tracker.on_interruption();
        assert_eq!(tracker.restart_count(), 2);

        tracker.reset();
        assert_eq!(tracker.restart_count(), 0);
        assert_eq!(tracker.on_interruption(), Some(Duration::from_millis(1)));
    }

    #[test]
    fn test_long_serving_generation_clears_count() {
        let mut tracker = RestartTracker::new(RestartPolicy {
            restart_window_ms: 0,
            ..fast_policy(1)
        });
        tracker.on_start();
        assert_eq!(tracker.on_interruption(), Some(Duration::from_millis(1)));

        // With an empty window every generation counts as having served long enough.
        tracker.on_start();
        assert_eq!(tracker.on_interruption(), Some(Duration::from_millis(1)));
        assert_eq!(tracker.restart_count(), 1);
    }

    #[test]
    fn test_policy_validation() {
        assert!(RestartPolicy::default().validate().is_ok());
        let bad = RestartPolicy {
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let unbounded = RestartPolicy {
            backoff_multiplier: f64::INFINITY,
            ..Default::default()
        };
        assert!(unbounded.validate().is_err());
        let inverted = RestartPolicy {
            initial_backoff_ms: 10,
            max_backoff_ms: 5,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_interrupted_worker_is_replaced() {
        let dir = create_test_maildir().await;
        for substrate in [Substrate::Thread, Substrate::Task] {
            let mut config = AppConfig::default();
            config.maildir.root = dir.path().to_path_buf();
            config.runtime.substrate = substrate;
            config.restart = fast_policy(3);
            let mut supervisor = Supervisor::new(config);

            let report = supervisor
                .run(vec![MaildirCommand::ListFolders, count("Spam"), count("INBOX")])
                .await
                .unwrap();

            assert_eq!(report.generations, 2, "{substrate}");
            assert_eq!(report.outcomes.len(), 3);
            assert!(matches!(
                &report.outcomes[1],
                CommandOutcome::Interrupted { interruption, .. }
                    if interruption.category == "not_found" && interruption.worker == "maildir-1"
            ));
            assert_eq!(
                report.outcomes[2],
                CommandOutcome::Completed {
                    command: count("INBOX"),
                    reply: MaildirReply::Count(2),
                }
            );
            assert!(!report.is_clean());
            assert_eq!(supervisor.tracker().restart_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_clean_run_uses_one_generation() {
        let dir = create_test_maildir().await;
        let mut config = AppConfig::default();
        config.maildir.root = dir.path().to_path_buf();
        config.runtime.substrate = Substrate::Task;
        let mut supervisor = Supervisor::new(config);

        let report = supervisor
            .run(vec![count("Archive"), count("Drafts")])
            .await
            .unwrap();

        assert_eq!(report.generations, 1);
        assert!(report.is_clean());
        assert_eq!(supervisor.tracker().restart_count(), 0);
    }

    #[tokio::test]
    async fn test_gives_up_when_policy_exhausted() {
        let dir = create_test_maildir().await;
        let mut config = AppConfig::default();
        config.maildir.root = dir.path().to_path_buf();
        config.runtime.substrate = Substrate::Task;
        config.restart = fast_policy(1);
        let mut supervisor = Supervisor::new(config);

        let err =
            tokio_test::assert_err!(supervisor.run(vec![count("A"), count("B"), count("C")]).await);

        assert!(err.to_string().contains("giving up after 1 restarts"));
    }
}
