use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::TaskStatus;

/// A node in a project's decomposition tree.
///
/// Components form a forest through `parent_id`: `None` means top-level, and a
/// `Root`-typed component is always top-level. A component's status is the
/// roll-up of its tasks' statuses (see [`TaskStatus::aggregate`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub id: Uuid,
    pub project_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub label: String,
    pub kind: ComponentKind,
    pub status: TaskStatus,
    /// Layout hint for observers; opaque to the core.
    pub position: Option<Position>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Root,
    Node,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Node => "node",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "root" => Some(Self::Root),
            "node" => Some(Self::Node),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Position {
    pub x: i64,
    pub y: i64,
}

/// Input for creating a new component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateComponentInput {
    /// Parent component for nesting. `None` creates a top-level component.
    pub parent_id: Option<Uuid>,
    pub label: String,
    /// Defaults to `Node`.
    pub kind: Option<ComponentKind>,
    pub position: Option<Position>,
}

/// A component with its nested children, used for tree responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentTreeNode {
    #[serde(flatten)]
    pub component: Component,
    pub children: Vec<ComponentTreeNode>,
}

/// What to do with dependency edges that point into a subtree being deleted.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Delete the edges along with their targets; the dependents are
    /// re-resolved afterwards.
    #[default]
    Cascade,
    /// Refuse the delete while tasks outside the subtree depend on it.
    Restrict,
}

/// Outcome of a delete that may have cut dependency edges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub deleted: bool,
    /// Surviving tasks that lost at least one dependency edge.
    pub detached_dependents: Vec<Uuid>,
}
