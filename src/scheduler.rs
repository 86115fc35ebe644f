//! Dispatches ready tasks to concurrent workers.
//!
//! The scheduler claims ready tasks in resolver order (priority, then
//! creation), runs at most `max_concurrent_tasks` of them at once, and sleeps
//! on the state machine's status-change notification when nothing is ready.
//! It never polls.
//!
//! Only one scheduler may drive a database at a time. It holds a lease row
//! that it renews while running; another process cannot reap or dispatch
//! until that lease is released or has expired.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::lifecycle::Lifecycle;
use crate::models::*;
use crate::registry::RunRegistry;
use crate::runner::{RunOutcome, TaskRunner};

type RunResult = (Uuid, Result<RunOutcome>);

/// Tally of finished runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
}

pub struct Scheduler<E> {
    lifecycle: Lifecycle,
    runner: Arc<TaskRunner<E>>,
    registry: RunRegistry,
    config: SchedulerConfig,
    holder: String,
}

impl<E: Executor + 'static> Scheduler<E> {
    pub fn new(
        lifecycle: Lifecycle,
        runner: TaskRunner<E>,
        registry: RunRegistry,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            lifecycle,
            runner: Arc::new(runner),
            registry,
            config,
            holder: format!("scheduler-{}", Uuid::new_v4().simple()),
        }
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    /// Take or renew the lease on the database. Fails with
    /// [`Error::Conflict`] while another scheduler holds it.
    pub fn acquire_lease(&self) -> Result<()> {
        match self
            .lifecycle
            .db()
            .acquire_lease(&self.holder, self.config.lease_ttl())?
        {
            Ok(()) => Ok(()),
            Err(lease) => Err(Error::Conflict(format!(
                "Another scheduler ({}) is driving this database",
                lease.holder
            ))),
        }
    }

    /// Give the lease back so another process can take over immediately.
    pub fn release_lease(&self) -> Result<()> {
        if self.lifecycle.db().release_lease(&self.holder)? {
            tracing::debug!(holder = %self.holder, "Scheduler lease released");
        }
        Ok(())
    }

    /// Fail tasks left IN_PROGRESS by a previous process. Their workers are
    /// gone, so they can only be retried. Holding the lease guarantees no
    /// live scheduler elsewhere still owns them.
    pub fn reap_orphans(&self) -> Result<usize> {
        self.acquire_lease()?;
        let orphans: Vec<Task> = self
            .lifecycle
            .db()
            .get_tasks_by_status(TaskStatus::InProgress)?
            .into_iter()
            .filter(|task| self.registry.get(task.id).is_none())
            .collect();

        for task in &orphans {
            tracing::warn!(task_id = %task.id, "Failing orphaned task");
            self.lifecycle.fail(
                task.id,
                task.assigned_worker.as_deref(),
                FailureReason::Unrecoverable {
                    message: "worker lost before the task finished".to_string(),
                },
            )?;
        }
        Ok(orphans.len())
    }

    /// Run until nothing is ready and nothing is in flight.
    pub async fn run_until_idle(&self) -> Result<RunSummary> {
        self.drive(CancellationToken::new(), true).await
    }

    /// Run until `shutdown` fires. Active runs are then cancelled and drained.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<RunSummary> {
        self.drive(shutdown, false).await
    }

    async fn drive(&self, shutdown: CancellationToken, exit_when_idle: bool) -> Result<RunSummary> {
        self.acquire_lease()?;
        let renew_every = self.config.lease_ttl() / 3;
        let mut renew_at = Instant::now() + renew_every;
        let mut lost_lease: Option<Error> = None;

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_tasks.max(1)));
        let mut join_set: JoinSet<RunResult> = JoinSet::new();
        let mut summary = RunSummary::default();
        let wake = self.lifecycle.status_changes();

        tracing::info!(
            max_concurrent = self.config.max_concurrent_tasks,
            holder = %self.holder,
            "Scheduler started"
        );

        loop {
            if shutdown.is_cancelled() {
                tracing::info!("Shutdown requested, stopping dispatch");
                break;
            }

            if Instant::now() >= renew_at {
                if let Err(e) = self.acquire_lease() {
                    tracing::error!("Lost the scheduler lease: {}", e);
                    lost_lease = Some(e);
                    break;
                }
                renew_at = Instant::now() + renew_every;
            }

            while let Some(result) = join_set.try_join_next() {
                reap(result, &mut summary);
            }

            let dispatched = self.dispatch(&permits, &mut join_set)?;

            if dispatched == 0 && join_set.is_empty() && exit_when_idle {
                tracing::info!("Nothing ready and nothing in flight");
                break;
            }

            if dispatched == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Shutdown during wait");
                        break;
                    }
                    Some(result) = join_set.join_next() => reap(result, &mut summary),
                    _ = wake.notified() => {}
                    _ = tokio::time::sleep_until(renew_at) => {}
                }
            }
        }

        if !join_set.is_empty() {
            let cancelled = self.registry.cancel_all();
            tracing::info!(count = join_set.len(), cancelled, "Draining in-flight runs");
            loop {
                tokio::select! {
                    next = join_set.join_next() => match next {
                        Some(result) => reap(result, &mut summary),
                        None => break,
                    },
                    _ = tokio::time::sleep_until(renew_at), if lost_lease.is_none() => {
                        if let Err(e) = self.acquire_lease() {
                            tracing::error!("Lost the scheduler lease while draining: {}", e);
                            lost_lease = Some(e);
                        }
                        renew_at = Instant::now() + renew_every;
                    }
                }
            }
        }

        tracing::info!(
            completed = summary.completed,
            failed = summary.failed,
            "Scheduler stopped"
        );
        match lost_lease {
            Some(e) => Err(e),
            None => {
                self.release_lease()?;
                Ok(summary)
            }
        }
    }

    /// Claim and spawn as many ready tasks as there are free permits.
    fn dispatch(&self, permits: &Arc<Semaphore>, join_set: &mut JoinSet<RunResult>) -> Result<usize> {
        let free = permits.available_permits();
        if free == 0 {
            return Ok(0);
        }

        let mut dispatched = 0;
        for task in self.lifecycle.db().get_ready_tasks(free)? {
            let Ok(permit) = permits.clone().try_acquire_owned() else {
                break;
            };

            let worker_id = format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]);
            match self.lifecycle.claim(task.id, &worker_id) {
                Ok(_) => {}
                Err(e @ (Error::Conflict(_) | Error::NotReady { .. } | Error::InvalidTransition { .. })) => {
                    tracing::debug!(task_id = %task.id, "Skipping task: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            }

            let guard = match self.registry.register(task.id, &worker_id) {
                Ok(guard) => guard,
                Err(e) => {
                    self.lifecycle.fail(
                        task.id,
                        Some(&worker_id),
                        FailureReason::Unrecoverable {
                            message: e.to_string(),
                        },
                    )?;
                    continue;
                }
            };

            tracing::info!(task_id = %task.id, worker = %worker_id, title = %task.title, "Dispatching task");
            let runner = self.runner.clone();
            join_set.spawn(async move {
                let _permit = permit;
                let outcome = runner.run(task.id, &worker_id, guard.token()).await;
                drop(guard);
                (task.id, outcome)
            });
            dispatched += 1;
        }
        Ok(dispatched)
    }
}

fn reap(result: std::result::Result<RunResult, tokio::task::JoinError>, summary: &mut RunSummary) {
    match result {
        Ok((task_id, Ok(outcome))) => match outcome {
            RunOutcome::Completed { iterations } => {
                summary.completed += 1;
                tracing::info!(task_id = %task_id, iterations, "Run completed");
            }
            RunOutcome::Failed { reason } => {
                summary.failed += 1;
                tracing::warn!(task_id = %task_id, reason = reason.code(), "Run failed: {}", reason);
            }
        },
        Ok((task_id, Err(e))) => {
            summary.failed += 1;
            tracing::error!(task_id = %task_id, error = %e, "Run aborted");
        }
        Err(e) => {
            summary.failed += 1;
            tracing::error!(error = %e, "Worker task panicked");
        }
    }
}
