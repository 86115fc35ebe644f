//! The task state machine.
//!
//! Every status change goes through [`Lifecycle`]. Each transition is written
//! as a compare-and-set against the revision the caller read, and its
//! execution events are appended in the same transaction. It then refreshes the owning component's roll-up status and
//! re-runs the resolver for the task's dependents. Status changes wake the
//! scheduler through a shared [`Notify`].

use std::sync::Arc;

use tokio::sync::Notify;
use uuid::Uuid;

use crate::db::{Database, Resolution, TerminalUpdate};
use crate::error::{Error, Result};
use crate::models::*;
use crate::progress::ProgressTracker;
use crate::resolver::Readiness;

#[derive(Clone)]
pub struct Lifecycle {
    db: Database,
    tracker: ProgressTracker,
    notify: Arc<Notify>,
}

impl Lifecycle {
    pub fn new(db: Database, tracker: ProgressTracker) -> Self {
        Self {
            db,
            tracker,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    /// Signalled after every status change.
    pub fn status_changes(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    // ============================================================
    // Creation and dependencies
    // ============================================================

    pub fn create_task(&self, component_id: Uuid, input: CreateTaskInput) -> Result<Task> {
        let task = self.db.insert_task(component_id, input)?;

        self.tracker.record_event(
            NewLogEntry::for_task(
                task.id,
                EventKind::Created,
                format!("Task '{}' created as {}", task.title, task.status),
            )
            .payload(serde_json::json!({
                "status": task.status,
                "priority": task.priority,
                "depends_on": task.dependencies.iter().map(|d| d.task_id).collect::<Vec<_>>(),
            })),
        )?;
        self.db.refresh_component_status(component_id)?;

        tracing::debug!(task_id = %task.id, status = %task.status, "Task created");
        if task.status == TaskStatus::Pending {
            self.notify.notify_one();
        }
        Ok(task)
    }

    /// Declare that `task_id` waits on `source`, then re-resolve the task.
    pub fn add_dependency(&self, task_id: Uuid, source: Uuid) -> Result<Task> {
        if self.db.add_dependency(task_id, source)? {
            self.tracker.record_event(NewLogEntry::for_task(
                task_id,
                EventKind::Note,
                format!("Now depends on task {}", source),
            ))?;
        }
        Ok(self.resolve(task_id)?.task)
    }

    // ============================================================
    // Transitions
    // ============================================================

    /// PENDING/BLOCKED -> IN_PROGRESS for exactly one worker.
    pub fn claim(&self, task_id: Uuid, worker_id: &str) -> Result<Task> {
        let (task, logged) = self.db.claim_task(task_id, worker_id, |from, task| {
            vec![
                NewLogEntry::for_task(task.id, EventKind::Claimed, format!("Claimed by {}", worker_id))
                    .worker(worker_id),
                transition_entry(task, from, Some(worker_id)),
            ]
        })?;
        self.after_transition(&task, &logged)?;
        Ok(task)
    }

    /// Verify one criterion of a running task. Returns `false` if it was
    /// already verified.
    pub fn verify_criterion(
        &self,
        task_id: Uuid,
        index: usize,
        worker_id: &str,
        evidence: Option<&str>,
    ) -> Result<bool> {
        if !self.db.verify_criterion(task_id, index, worker_id)? {
            return Ok(false);
        }

        let task = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| Error::not_found("Task", task_id))?;
        let description = task
            .acceptance_criteria
            .get(index)
            .map(|c| c.description.as_str())
            .unwrap_or_default();

        let mut entry = NewLogEntry::for_task(
            task_id,
            EventKind::CriterionVerified,
            format!("Criterion {} verified: {}", index, description),
        )
        .worker(worker_id);
        if let Some(evidence) = evidence {
            entry = entry.payload(serde_json::json!({ "index": index, "evidence": evidence }));
        }
        self.tracker.record_event(entry)?;
        self.tracker.observe(&task)?;
        Ok(true)
    }

    /// IN_PROGRESS -> COMPLETE, if the completion guard holds.
    ///
    /// The guard is recomputed from stored criteria. A task without criteria
    /// only completes when `explicit_signal` is set; for tasks with criteria
    /// the signal is ignored. Returns `None` when the guard does not hold.
    pub fn complete(
        &self,
        task_id: Uuid,
        worker_id: &str,
        explicit_signal: Option<&str>,
    ) -> Result<Option<Task>> {
        let current = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| Error::not_found("Task", task_id))?;
        current.status.ensure_transition(TaskStatus::Complete)?;

        let done = current.is_complete()
            || (current.acceptance_criteria.is_empty() && explicit_signal.is_some());
        if !done {
            return Ok(None);
        }

        let summary = explicit_signal.filter(|s| !s.is_empty()).unwrap_or("all criteria verified");
        let (task, logged) = self.db.finish_task(
            task_id,
            current.revision,
            TerminalUpdate::Complete,
            |from, task| {
                vec![
                    NewLogEntry::for_task(task.id, EventKind::Finished, format!("Completed: {}", summary))
                        .worker(worker_id)
                        .payload(serde_json::json!({
                            "status": TaskStatus::Complete,
                            "iterations": task.iteration,
                            "criteria_verified": task.criteria_verified(),
                        })),
                    transition_entry(task, from, Some(worker_id)),
                ]
            },
        )?;
        self.after_transition(&task, &logged)?;
        Ok(Some(task))
    }

    /// IN_PROGRESS -> FAILED with a reason code.
    pub fn fail(&self, task_id: Uuid, worker_id: Option<&str>, reason: FailureReason) -> Result<Task> {
        let current = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| Error::not_found("Task", task_id))?;
        let (task, logged) = self.db.finish_task(
            task_id,
            current.revision,
            TerminalUpdate::Failed(reason.clone()),
            |from, task| {
                let mut entry =
                    NewLogEntry::for_task(task.id, EventKind::Finished, format!("Failed: {}", reason))
                        .level(Severity::Error)
                        .payload(serde_json::json!({
                            "status": TaskStatus::Failed,
                            "reason": reason,
                            "iterations": task.iteration,
                        }));
                if let Some(worker_id) = worker_id {
                    entry = entry.worker(worker_id);
                }
                vec![entry, transition_entry(task, from, worker_id)]
            },
        )?;

        tracing::warn!(task_id = %task_id, reason = reason.code(), "Task failed: {}", reason);
        self.after_transition(&task, &logged)?;
        Ok(task)
    }

    /// FAILED -> PENDING (or BLOCKED). Only ever triggered from outside.
    pub fn retry(&self, task_id: Uuid) -> Result<Task> {
        let current = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| Error::not_found("Task", task_id))?;
        let previous = current
            .failure_reason
            .as_ref()
            .map(|r| r.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let (task, logged) = self.db.retry_task(task_id, current.revision, |from, task| {
            vec![
                NewLogEntry::for_task(
                    task.id,
                    EventKind::Retry,
                    format!("Retry requested after: {}", previous),
                )
                .payload(serde_json::json!({ "previous_reason": current.failure_reason })),
                transition_entry(task, from, None),
            ]
        })?;
        self.after_transition(&task, &logged)?;
        Ok(task)
    }

    // ============================================================
    // Resolution
    // ============================================================

    /// Re-run the resolver for one task and record any flip.
    pub fn resolve(&self, task_id: Uuid) -> Result<Resolution> {
        let resolution = self.db.resolve_task(task_id)?;

        if let Some((from, to)) = resolution.transition {
            let mut entry = NewLogEntry::for_task(
                task_id,
                EventKind::Transition,
                format!("{} -> {}", from, to),
            )
            .payload(serde_json::json!({ "from": from, "to": to }));
            if !resolution.readiness.is_ready() {
                entry.message = format!(
                    "{} -> {} (waiting on {} dependencies)",
                    from,
                    to,
                    resolution.readiness.blockers().len()
                );
            }
            self.tracker.record_event(entry)?;
            self.db.refresh_component_status(resolution.task.component_id)?;
            self.notify.notify_one();
        }

        if let Readiness::Unsatisfiable { failed } = &resolution.readiness {
            if resolution.task.status == TaskStatus::Blocked {
                self.tracker.record_event(
                    NewLogEntry::for_task(
                        task_id,
                        EventKind::Note,
                        format!("Unsatisfiable until failed dependencies are retried: {:?}", failed),
                    )
                    .level(Severity::Warn),
                )?;
            }
        }

        Ok(resolution)
    }

    /// Re-run the resolver for every task that depends on `source`.
    pub fn resolve_dependents(&self, source: Uuid) -> Result<Vec<Resolution>> {
        self.db
            .get_dependents(source)?
            .into_iter()
            .map(|dependent| self.resolve(dependent))
            .collect()
    }

    // ============================================================
    // Deletion
    // ============================================================

    pub fn delete_component(&self, id: Uuid, policy: DeletePolicy) -> Result<DeleteOutcome> {
        let outcome = self.db.delete_component(id, policy)?;
        self.after_delete(&outcome, format!("Component {} deleted", id))?;
        Ok(outcome)
    }

    pub fn delete_project(&self, id: Uuid, policy: DeletePolicy) -> Result<DeleteOutcome> {
        let outcome = self.db.delete_project(id, policy)?;
        self.after_delete(&outcome, format!("Project {} deleted", id))?;
        Ok(outcome)
    }

    pub fn delete_task(&self, id: Uuid, policy: DeletePolicy) -> Result<DeleteOutcome> {
        let component_id = self.db.get_task(id)?.map(|t| t.component_id);
        let outcome = self.db.delete_task(id, policy)?;
        if let Some(component_id) = component_id.filter(|_| outcome.deleted) {
            self.db.refresh_component_status(component_id)?;
        }
        self.after_delete(&outcome, format!("Task {} deleted", id))?;
        Ok(outcome)
    }

    pub fn advance_phase(&self, project_id: Uuid) -> Result<Project> {
        let before = self
            .db
            .get_project(project_id)?
            .ok_or_else(|| Error::not_found("Project", project_id))?;
        let project = self.db.advance_phase(project_id)?;

        if project.phase != before.phase {
            self.tracker.record_event(
                NewLogEntry::new(
                    EventKind::Phase,
                    format!("Phase {} -> {}", before.phase, project.phase),
                )
                .project(project_id),
            )?;
        }
        Ok(project)
    }

    fn after_delete(&self, outcome: &DeleteOutcome, message: String) -> Result<()> {
        if !outcome.deleted {
            return Ok(());
        }
        tracing::info!("{} ({} dependents detached)", message, outcome.detached_dependents.len());
        for dependent in &outcome.detached_dependents {
            self.tracker.record_event(
                NewLogEntry::for_task(*dependent, EventKind::Note, format!("{}; dependency edge removed", message))
                    .level(Severity::Warn),
            )?;
            self.resolve(*dependent)?;
        }
        Ok(())
    }

    /// Follow-up work for a committed status change and its `logged` events.
    fn after_transition(&self, task: &Task, logged: &[LogEntry]) -> Result<()> {
        for entry in logged {
            self.tracker.track(entry)?;
        }

        self.db.refresh_component_status(task.component_id)?;
        self.tracker.observe(task)?;

        // A claim is the one transition dependents cannot observe.
        if task.status != TaskStatus::InProgress {
            self.resolve_dependents(task.id)?;
        }
        self.notify.notify_one();
        Ok(())
    }
}

fn transition_entry(task: &Task, from: TaskStatus, worker_id: Option<&str>) -> NewLogEntry {
    let mut entry = NewLogEntry::for_task(
        task.id,
        EventKind::Transition,
        format!("{} -> {}", from, task.status),
    )
    .payload(serde_json::json!({ "from": from, "to": task.status }));
    if let Some(worker_id) = worker_id {
        entry = entry.worker(worker_id);
    }
    entry
}
