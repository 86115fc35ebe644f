use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// An atomic unit of executable work within exactly one component.
///
/// A task's `status` is only ever written by the state machine in
/// [`crate::lifecycle`]; every write is a compare-and-set on `revision`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub component_id: Uuid,
    pub title: String,
    /// Description and approach notes handed to the worker.
    pub description: String,
    pub status: TaskStatus,
    /// Lower is more urgent.
    pub priority: i64,
    pub assigned_worker: Option<String>,
    /// Declared dependencies, in insertion order.
    pub dependencies: Vec<Dependency>,
    /// Acceptance criteria, in insertion order.
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    /// Files whose content is included in every round's context.
    pub read_files: Vec<String>,
    /// Filesystem roots the task's tool calls may touch.
    pub scope: Vec<String>,
    /// Rounds run so far in the current attempt.
    pub iteration: u32,
    /// Per-task override of the runner's iteration budget.
    pub max_iterations: Option<u32>,
    pub failure_reason: Option<FailureReason>,
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// True iff the task has at least one criterion and every criterion is
    /// verified. A task without criteria is never complete on its own; it
    /// needs an explicit completion signal from its worker.
    pub fn is_complete(&self) -> bool {
        !self.acceptance_criteria.is_empty() && self.acceptance_criteria.iter().all(|c| c.verified)
    }

    pub fn criteria_verified(&self) -> usize {
        self.acceptance_criteria.iter().filter(|c| c.verified).count()
    }

    /// Criteria still waiting for verification, with their indexes.
    pub fn unverified_criteria(&self) -> impl Iterator<Item = (usize, &AcceptanceCriterion)> {
        self.acceptance_criteria
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.verified)
    }

    pub fn progress_percent(&self) -> u8 {
        if self.status == TaskStatus::Complete {
            return 100;
        }
        let total = self.acceptance_criteria.len();
        if total == 0 {
            return 0;
        }
        (self.criteria_verified() * 100 / total) as u8
    }
}

/// Lifecycle state of a task.
///
/// ```text
/// PENDING -> IN_PROGRESS -> COMPLETE | FAILED
/// BLOCKED -> PENDING (resolver) | IN_PROGRESS (claim once ready)
/// PENDING -> BLOCKED (resolver, new unmet dependency)
/// FAILED  -> PENDING | BLOCKED (explicit retry)
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::{Blocked, Complete, Failed, InProgress, Pending};
        matches!(
            (*self, to),
            (Pending, InProgress)
                | (Pending, Blocked)
                | (Blocked, Pending)
                | (Blocked, InProgress)
                | (InProgress, Complete)
                | (InProgress, Failed)
                | (Failed, Pending)
                | (Failed, Blocked)
        )
    }

    pub fn ensure_transition(&self, to: TaskStatus) -> Result<()> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(Error::InvalidTransition { from: *self, to })
        }
    }

    /// Roll a set of task statuses up into a component status.
    pub fn aggregate(statuses: &[TaskStatus]) -> TaskStatus {
        if statuses.is_empty() {
            return Self::Pending;
        }
        if statuses.iter().all(|s| *s == Self::Complete) {
            Self::Complete
        } else if statuses.contains(&Self::Failed) {
            Self::Failed
        } else if statuses.contains(&Self::InProgress) {
            Self::InProgress
        } else if statuses
            .iter()
            .filter(|s| **s != Self::Complete)
            .all(|s| *s == Self::Blocked)
        {
            Self::Blocked
        } else {
            Self::Pending
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directed edge: the owning task cannot start until `task_id` is complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// The source task this task waits on.
    pub task_id: Uuid,
    /// Recomputed by the resolver, never set by hand.
    pub satisfied: bool,
}

/// A single verifiable statement attached to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    pub description: String,
    pub verified: bool,
    pub verified_by: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
}

/// Why a task ended up FAILED. Stored with the task and in its audit trail so
/// that cancellations and budget exhaustion stay distinguishable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum FailureReason {
    BudgetExhausted { iterations: u32 },
    TimedOut { elapsed_secs: u64 },
    Cancelled,
    Blocked { reason: String },
    ServiceUnavailable { attempts: u32, message: String },
    ScopeViolations { count: u32 },
    Unrecoverable { message: String },
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::BudgetExhausted { .. } => "budget_exhausted",
            Self::TimedOut { .. } => "timed_out",
            Self::Cancelled => "cancelled",
            Self::Blocked { .. } => "blocked",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::ScopeViolations { .. } => "scope_violations",
            Self::Unrecoverable { .. } => "unrecoverable",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BudgetExhausted { iterations } => {
                write!(f, "budget exhausted after {} iterations", iterations)
            }
            Self::TimedOut { elapsed_secs } => write!(f, "timed out after {}s", elapsed_secs),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Blocked { reason } => write!(f, "blocked: {}", reason),
            Self::ServiceUnavailable { attempts, message } => write!(
                f,
                "reasoning service unavailable after {} attempts: {}",
                attempts, message
            ),
            Self::ScopeViolations { count } => {
                write!(f, "{} scope violations, worker stopped", count)
            }
            Self::Unrecoverable { message } => write!(f, "unrecoverable error: {}", message),
        }
    }
}

/// Input for creating a new task within a component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateTaskInput {
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Defaults to 0.
    pub priority: Option<i64>,
    /// Tasks that must be complete before this one may start.
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub read_files: Vec<String>,
    #[serde(default)]
    pub scope: Vec<String>,
    pub max_iterations: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn criterion(verified: bool) -> AcceptanceCriterion {
        AcceptanceCriterion {
            description: "works".to_string(),
            verified,
            verified_by: None,
            verified_at: None,
        }
    }

    fn task(criteria: Vec<AcceptanceCriterion>) -> Task {
        Task {
            id: Uuid::new_v4(),
            component_id: Uuid::new_v4(),
            title: "t".to_string(),
            description: String::new(),
            status: TaskStatus::InProgress,
            priority: 0,
            assigned_worker: None,
            dependencies: vec![],
            acceptance_criteria: criteria,
            read_files: vec![],
            scope: vec![],
            iteration: 0,
            max_iterations: None,
            failure_reason: None,
            revision: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn complete_requires_every_criterion() {
        assert!(!task(vec![criterion(true), criterion(false)]).is_complete());
        assert!(task(vec![criterion(true), criterion(true)]).is_complete());
    }

    #[test]
    fn zero_criteria_is_never_complete_by_itself() {
        assert!(!task(vec![]).is_complete());
    }

    #[test]
    fn progress_percent_tracks_verified_share() {
        let t = task(vec![criterion(true), criterion(false), criterion(false), criterion(false)]);
        assert_eq!(t.progress_percent(), 25);
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Complete,
            TaskStatus::Failed,
            TaskStatus::Blocked,
        ] {
            assert_eq!(TaskStatus::from_str(s.as_str()), Some(s));
        }
    }

    #[test]
    fn terminal_states_only_leave_through_retry() {
        assert!(!TaskStatus::Complete.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Complete.can_transition_to(TaskStatus::Blocked));
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::InProgress));
    }

    #[test]
    fn aggregate_rolls_up_component_status() {
        use TaskStatus::*;
        assert_eq!(TaskStatus::aggregate(&[]), Pending);
        assert_eq!(TaskStatus::aggregate(&[Complete, Complete]), Complete);
        assert_eq!(TaskStatus::aggregate(&[Complete, Failed, InProgress]), Failed);
        assert_eq!(TaskStatus::aggregate(&[Pending, InProgress]), InProgress);
        assert_eq!(TaskStatus::aggregate(&[Complete, Blocked]), Blocked);
        assert_eq!(TaskStatus::aggregate(&[Pending, Blocked]), Pending);
    }

    #[test]
    fn failure_reason_serializes_with_code_tag() {
        let json = serde_json::to_value(FailureReason::Cancelled).unwrap();
        assert_eq!(json["code"], "cancelled");
        assert_eq!(
            FailureReason::BudgetExhausted { iterations: 3 }.to_string(),
            "budget exhausted after 3 iterations"
        );
    }
}
