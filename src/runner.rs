//! The bounded per-task execution loop.
//!
//! A [`TaskRunner`] drives one claimed task through at most `max_iterations`
//! strictly sequential rounds. Each round assembles context, calls the
//! reasoning service (retrying transient failures), decodes actions from the
//! response, dispatches them through the task's [`ToolGateway`] and then asks
//! the state machine whether the task is complete. Cancellation and the
//! task-level deadline are checked before and after every round, so a round
//! that is interrupted ends the run with that reason and not with budget
//! exhaustion.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::action::{self, Action};
use crate::config::RunnerConfig;
use crate::context::{self, ContextPayload, RoundInfo};
use crate::error::{Error, Result, ServiceError};
use crate::executor::Executor;
use crate::gateway::{truncate_lines, ToolGateway};
use crate::lifecycle::Lifecycle;
use crate::models::*;

/// How a run ended. Either way the task is in a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { iterations: u32 },
    Failed { reason: FailureReason },
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Surface a failed run as the matching error variant.
    pub fn into_result(self) -> Result<u32> {
        match self {
            Self::Completed { iterations } => Ok(iterations),
            Self::Failed {
                reason: FailureReason::BudgetExhausted { iterations },
            } => Err(Error::BudgetExhausted { iterations }),
            Self::Failed {
                reason: FailureReason::Cancelled,
            } => Err(Error::Cancelled),
            Self::Failed { reason } => Err(Error::TaskFailed(reason)),
        }
    }
}

/// Why a round could not get a response.
enum RoundFailure {
    Cancelled,
    DeadlineReached,
    Service { attempts: u32, error: ServiceError },
}

/// What dispatching one action asks of the loop.
enum Dispatch {
    Continue(String),
    Complete(String),
    Blocked(String),
}

pub struct TaskRunner<E> {
    lifecycle: Lifecycle,
    executor: E,
    config: RunnerConfig,
}

impl<E: Executor> TaskRunner<E> {
    pub fn new(lifecycle: Lifecycle, executor: E, config: RunnerConfig) -> Self {
        Self {
            lifecycle,
            executor,
            config,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Claim `task_id` for `worker_id` and run it.
    pub async fn claim_and_run(
        &self,
        task_id: Uuid,
        worker_id: &str,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        self.lifecycle.claim(task_id, worker_id)?;
        self.run(task_id, worker_id, cancel).await
    }

    /// Run a task that `worker_id` has already claimed.
    ///
    /// Infrastructure errors (the store failing) abort the run; the task is
    /// then failed as unrecoverable on a best-effort basis and the error is
    /// returned.
    pub async fn run(
        &self,
        task_id: Uuid,
        worker_id: &str,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let task = self
            .lifecycle
            .db()
            .get_task(task_id)?
            .ok_or_else(|| Error::not_found("Task", task_id))?;
        if task.status != TaskStatus::InProgress {
            return Err(Error::InvalidTransition {
                from: task.status,
                to: TaskStatus::InProgress,
            });
        }
        if task.assigned_worker.as_deref() != Some(worker_id) {
            return Err(Error::Conflict(format!(
                "Task {} is not claimed by {}",
                task_id, worker_id
            )));
        }

        match self.run_rounds(task, worker_id, &cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!(task_id = %task_id, worker = worker_id, "Run aborted: {}", e);
                let reason = FailureReason::Unrecoverable {
                    message: e.to_string(),
                };
                if let Err(fail_err) = self.lifecycle.fail(task_id, Some(worker_id), reason) {
                    tracing::error!(task_id = %task_id, "Could not mark task failed: {}", fail_err);
                }
                Err(e)
            }
        }
    }

    async fn run_rounds(
        &self,
        task: Task,
        worker_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let task_id = task.id;
        let max_iterations = task.max_iterations.unwrap_or(self.config.max_iterations);
        let tracker = self.lifecycle.tracker();
        tracker.begin_run(&task, max_iterations);

        let gateway = ToolGateway::for_task(&task, worker_id, tracker.clone());
        let started = Instant::now();
        let deadline = started + self.config.task_timeout();
        let mut violations = 0u32;
        let mut feedback: Vec<String> = Vec::new();

        tracing::info!(task_id = %task_id, worker = worker_id, max_iterations, "Starting run");

        for iteration in 1..=max_iterations {
            if let Some(reason) = interruption(cancel, started, deadline) {
                return self.finish_failed(task_id, worker_id, reason);
            }

            self.lifecycle.db().record_iteration(task_id, iteration)?;
            tracker.begin_iteration(task_id, iteration, worker_id)?;

            let current = self
                .lifecycle
                .db()
                .get_task(task_id)?
                .ok_or_else(|| Error::not_found("Task", task_id))?;
            let payload = context::assemble(
                &current,
                &gateway,
                RoundInfo {
                    iteration,
                    max_iterations,
                    line_budget: self.config.context_line_budget,
                },
                &feedback,
            );

            let response = match self.invoke(task_id, worker_id, &payload, deadline, cancel).await? {
                Ok(response) => response,
                Err(RoundFailure::Cancelled) => {
                    return self.finish_failed(task_id, worker_id, FailureReason::Cancelled)
                }
                Err(RoundFailure::DeadlineReached) => {
                    let elapsed_secs = started.elapsed().as_secs();
                    return self.finish_failed(task_id, worker_id, FailureReason::TimedOut { elapsed_secs });
                }
                Err(RoundFailure::Service { attempts, error }) => {
                    return self.finish_failed(
                        task_id,
                        worker_id,
                        FailureReason::ServiceUnavailable {
                            attempts,
                            message: error.to_string(),
                        },
                    )
                }
            };

            let actions = action::parse_actions(&response);
            if actions.is_empty() {
                tracker.record_event(
                    NewLogEntry::for_task(task_id, EventKind::Note, "Response contained no actions")
                        .worker(worker_id)
                        .level(Severity::Debug),
                )?;
            }

            feedback.clear();
            let mut completion_signal: Option<String> = None;
            let mut blocked: Option<String> = None;

            for action in actions {
                match self.dispatch(&gateway, task_id, worker_id, action) {
                    Ok(Dispatch::Continue(result)) => feedback.push(result),
                    Ok(Dispatch::Complete(summary)) => completion_signal = Some(summary),
                    Ok(Dispatch::Blocked(reason)) => {
                        blocked = Some(reason);
                        break;
                    }
                    Err(e @ Error::ScopeViolation { .. }) => {
                        violations += 1;
                        feedback.push(e.to_string());
                        if violations >= self.config.scope_violation_limit {
                            return self.finish_failed(
                                task_id,
                                worker_id,
                                FailureReason::ScopeViolations { count: violations },
                            );
                        }
                    }
                    Err(e @ (Error::Storage(_) | Error::Serialization(_))) => return Err(e),
                    Err(e) => feedback.push(e.to_string()),
                }
            }

            if let Some(reason) = blocked {
                return self.finish_failed(task_id, worker_id, FailureReason::Blocked { reason });
            }

            if self
                .lifecycle
                .complete(task_id, worker_id, completion_signal.as_deref())?
                .is_some()
            {
                tracing::info!(task_id = %task_id, iterations = iteration, "Task complete");
                return Ok(RunOutcome::Completed {
                    iterations: iteration,
                });
            }

            if let Some(reason) = interruption(cancel, started, deadline) {
                return self.finish_failed(task_id, worker_id, reason);
            }
        }

        self.finish_failed(
            task_id,
            worker_id,
            FailureReason::BudgetExhausted {
                iterations: max_iterations,
            },
        )
    }

    /// Call the reasoning service, retrying transient failures with doubling
    /// backoff. The outer `Result` carries store errors from logging.
    async fn invoke(
        &self,
        task_id: Uuid,
        worker_id: &str,
        payload: &ContextPayload,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<String, RoundFailure>> {
        let attempts = self.config.reasoning_retries.max(1);
        let mut backoff = self.config.retry_backoff();

        for attempt in 1..=attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Err(RoundFailure::DeadlineReached));
            }
            let budget = self.config.reasoning_timeout().min(remaining);

            let error = match tokio::time::timeout(
                budget,
                self.executor.invoke(&payload.prompt, &payload.system),
            )
            .await
            {
                Ok(Ok(response)) => return Ok(Ok(response)),
                Ok(Err(error)) => error,
                Err(_) => ServiceError::Timeout(budget),
            };

            self.lifecycle.tracker().record_event(
                NewLogEntry::for_task(
                    task_id,
                    EventKind::Error,
                    format!("Reasoning call failed (attempt {}/{}): {}", attempt, attempts, error),
                )
                .worker(worker_id)
                .level(Severity::Warn),
            )?;

            if !error.is_transient() || attempt == attempts {
                return Ok(Err(RoundFailure::Service { attempts: attempt, error }));
            }

            let pause = backoff.min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                _ = cancel.cancelled() => return Ok(Err(RoundFailure::Cancelled)),
                _ = tokio::time::sleep(pause) => {}
            }
            backoff = backoff.saturating_mul(2).min(Duration::from_secs(60));
        }

        Ok(Err(RoundFailure::DeadlineReached))
    }

    fn dispatch(
        &self,
        gateway: &ToolGateway,
        task_id: Uuid,
        worker_id: &str,
        action: Action,
    ) -> Result<Dispatch> {
        tracing::debug!(task_id = %task_id, action = action.name(), "Dispatching action");

        match action {
            Action::ReadFile { path } => {
                let content = gateway.read(&path)?;
                Ok(Dispatch::Continue(format!(
                    "read_file {}:\n{}",
                    path,
                    truncate_lines(&content, self.config.context_line_budget)
                )))
            }
            Action::WriteFile { path, content } => {
                let bytes = gateway.write(&path, &content)?;
                Ok(Dispatch::Continue(format!("wrote {} bytes to {}", bytes, path)))
            }
            Action::EditFile { path, old, new } => {
                let count = gateway.edit(&path, &old, &new)?;
                Ok(Dispatch::Continue(format!("replaced {} occurrences in {}", count, path)))
            }
            Action::VerifyCriterion { index, evidence } => {
                match self
                    .lifecycle
                    .verify_criterion(task_id, index, worker_id, evidence.as_deref())
                {
                    Ok(true) => Ok(Dispatch::Continue(format!("criterion {} verified", index))),
                    Ok(false) => Ok(Dispatch::Continue(format!("criterion {} was already verified", index))),
                    Err(e @ (Error::NotFound { .. } | Error::Validation(_))) => {
                        self.lifecycle.tracker().record_event(
                            NewLogEntry::for_task(
                                task_id,
                                EventKind::Error,
                                format!("verify_criterion {} rejected: {}", index, e),
                            )
                            .worker(worker_id)
                            .level(Severity::Warn),
                        )?;
                        Err(e)
                    }
                    Err(e) => Err(e),
                }
            }
            Action::Complete { summary } => Ok(Dispatch::Complete(summary.unwrap_or_default())),
            Action::Blocked { reason } => Ok(Dispatch::Blocked(reason)),
            Action::Note { message } => {
                self.lifecycle.tracker().record_event(
                    NewLogEntry::for_task(task_id, EventKind::Note, message).worker(worker_id),
                )?;
                Ok(Dispatch::Continue("note recorded".to_string()))
            }
        }
    }

    fn finish_failed(&self, task_id: Uuid, worker_id: &str, reason: FailureReason) -> Result<RunOutcome> {
        self.lifecycle.fail(task_id, Some(worker_id), reason.clone())?;
        Ok(RunOutcome::Failed { reason })
    }
}

/// Why the run must stop before (or after) a round, if it must.
fn interruption(cancel: &CancellationToken, started: Instant, deadline: Instant) -> Option<FailureReason> {
    if cancel.is_cancelled() {
        return Some(FailureReason::Cancelled);
    }
    if Instant::now() >= deadline {
        return Some(FailureReason::TimedOut {
            elapsed_secs: started.elapsed().as_secs(),
        });
    }
    None
}
