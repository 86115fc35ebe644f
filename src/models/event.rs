use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One row of the append-only audit log.
///
/// Rows carrying a `task_id` are that task's execution events. Rows are never
/// updated or deleted, and they outlive the entities they mention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub project_id: Option<Uuid>,
    pub component_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub worker_id: Option<String>,
    pub action: EventKind,
    pub message: String,
    pub level: Severity,
    pub payload: Option<serde_json::Value>,
}

/// Category of an execution event (the log's action tag).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Claimed,
    Iteration,
    ToolAction,
    CriterionVerified,
    Transition,
    Error,
    Finished,
    Retry,
    Checkpoint,
    Planning,
    Phase,
    Note,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Claimed => "claimed",
            Self::Iteration => "iteration",
            Self::ToolAction => "tool_action",
            Self::CriterionVerified => "criterion_verified",
            Self::Transition => "transition",
            Self::Error => "error",
            Self::Finished => "finished",
            Self::Retry => "retry",
            Self::Checkpoint => "checkpoint",
            Self::Planning => "planning",
            Self::Phase => "phase",
            Self::Note => "note",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "claimed" => Some(Self::Claimed),
            "iteration" => Some(Self::Iteration),
            "tool_action" => Some(Self::ToolAction),
            "criterion_verified" => Some(Self::CriterionVerified),
            "transition" => Some(Self::Transition),
            "error" => Some(Self::Error),
            "finished" => Some(Self::Finished),
            "retry" => Some(Self::Retry),
            "checkpoint" => Some(Self::Checkpoint),
            "planning" => Some(Self::Planning),
            "phase" => Some(Self::Phase),
            "note" => Some(Self::Note),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// A log row before it is persisted.
///
/// When only `task_id` is given, the store fills in the owning component and
/// project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLogEntry {
    pub project_id: Option<Uuid>,
    pub component_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub worker_id: Option<String>,
    pub action: EventKind,
    pub message: String,
    pub level: Severity,
    pub payload: Option<serde_json::Value>,
}

impl NewLogEntry {
    pub fn new(action: EventKind, message: impl Into<String>) -> Self {
        Self {
            project_id: None,
            component_id: None,
            task_id: None,
            worker_id: None,
            action,
            message: message.into(),
            level: Severity::Info,
            payload: None,
        }
    }

    pub fn for_task(task_id: Uuid, action: EventKind, message: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id),
            ..Self::new(action, message)
        }
    }

    pub fn project(mut self, project_id: Uuid) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn component(mut self, component_id: Uuid) -> Self {
        self.component_id = Some(component_id);
        self
    }

    pub fn worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn level(mut self, level: Severity) -> Self {
        self.level = level;
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}
