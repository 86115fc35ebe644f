//! Dependency resolution.
//!
//! Everything here is pure: callers hand in a snapshot of source statuses and
//! get back a verdict. The store applies the verdict inside the same
//! transaction that read the snapshot, and the state machine re-runs it for a
//! task's dependents whenever that task completes, fails or is retried.

use std::collections::HashMap;

use uuid::Uuid;

use crate::models::{Task, TaskStatus};

/// Current status of every source task a dependent waits on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencySnapshot {
    statuses: HashMap<Uuid, TaskStatus>,
}

impl DependencySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task_id: Uuid, status: TaskStatus) {
        self.statuses.insert(task_id, status);
    }

    pub fn status_of(&self, task_id: Uuid) -> Option<TaskStatus> {
        self.statuses.get(&task_id).copied()
    }
}

impl FromIterator<(Uuid, TaskStatus)> for DependencySnapshot {
    fn from_iter<I: IntoIterator<Item = (Uuid, TaskStatus)>>(iter: I) -> Self {
        Self {
            statuses: iter.into_iter().collect(),
        }
    }
}

/// The resolver's verdict on a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Some sources have not completed yet.
    Waiting { pending: Vec<Uuid> },
    /// Some sources failed; nothing but a retry of those sources helps.
    Unsatisfiable { failed: Vec<Uuid> },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Sources still standing in the way.
    pub fn blockers(&self) -> &[Uuid] {
        match self {
            Self::Ready => &[],
            Self::Waiting { pending } => pending,
            Self::Unsatisfiable { failed } => failed,
        }
    }
}

/// A dependency is satisfied once its source reaches COMPLETE. A source that
/// is missing from the snapshot is not.
pub fn is_satisfied(source_status: Option<TaskStatus>) -> bool {
    source_status == Some(TaskStatus::Complete)
}

/// Recomputed `satisfied` flag for each source, in the given order.
pub fn satisfaction(sources: &[Uuid], snapshot: &DependencySnapshot) -> Vec<(Uuid, bool)> {
    sources
        .iter()
        .map(|id| (*id, is_satisfied(snapshot.status_of(*id))))
        .collect()
}

pub fn evaluate(sources: &[Uuid], snapshot: &DependencySnapshot) -> Readiness {
    let failed: Vec<Uuid> = sources
        .iter()
        .copied()
        .filter(|id| snapshot.status_of(*id) == Some(TaskStatus::Failed))
        .collect();
    if !failed.is_empty() {
        return Readiness::Unsatisfiable { failed };
    }

    let pending: Vec<Uuid> = sources
        .iter()
        .copied()
        .filter(|id| !is_satisfied(snapshot.status_of(*id)))
        .collect();
    if pending.is_empty() {
        Readiness::Ready
    } else {
        Readiness::Waiting { pending }
    }
}

/// `ready(task, snapshot)`: every declared dependency is satisfied.
pub fn ready(task: &Task, snapshot: &DependencySnapshot) -> bool {
    let sources: Vec<Uuid> = task.dependencies.iter().map(|d| d.task_id).collect();
    evaluate(&sources, snapshot).is_ready()
}

/// Status a task should move to given a fresh verdict, if any.
///
/// Only unclaimed PENDING/BLOCKED tasks move; running and terminal tasks are
/// left alone.
pub fn resolved_status(current: TaskStatus, claimed: bool, readiness: &Readiness) -> Option<TaskStatus> {
    if claimed {
        return None;
    }
    match (current, readiness.is_ready()) {
        (TaskStatus::Blocked, true) => Some(TaskStatus::Pending),
        (TaskStatus::Pending, false) => Some(TaskStatus::Blocked),
        _ => None,
    }
}

/// Initial status for a task created with the given verdict.
pub fn initial_status(readiness: &Readiness) -> TaskStatus {
    if readiness.is_ready() {
        TaskStatus::Pending
    } else {
        TaskStatus::Blocked
    }
}
