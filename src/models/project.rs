use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top-level unit of work, created once per engagement.
///
/// A project owns a forest of [`super::Component`]s; deleting it cascades to
/// every component and task beneath it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub phase: Phase,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Coarse project-level stage.
///
/// Phases are orthogonal to task status and only ever move forward via
/// [`Phase::next`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Interview,
    Design,
    Visualize,
    Planning,
    Breakdown,
    Assign,
    Execute,
}

impl Phase {
    const ORDER: [Phase; 7] = [
        Phase::Interview,
        Phase::Design,
        Phase::Visualize,
        Phase::Planning,
        Phase::Breakdown,
        Phase::Assign,
        Phase::Execute,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interview => "interview",
            Self::Design => "design",
            Self::Visualize => "visualize",
            Self::Planning => "planning",
            Self::Breakdown => "breakdown",
            Self::Assign => "assign",
            Self::Execute => "execute",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ORDER.iter().copied().find(|p| p.as_str() == s)
    }

    /// The following phase; `Execute` is the last and stays put.
    pub fn next(&self) -> Phase {
        let idx = Self::ORDER.iter().position(|p| p == self).unwrap_or(0);
        Self::ORDER[(idx + 1).min(Self::ORDER.len() - 1)]
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input for creating a new project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProjectInput {
    pub name: String,
    pub summary: Option<String>,
}

/// Input for updating an existing project. All fields are optional for partial updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateProjectInput {
    pub name: Option<String>,
    pub summary: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_advance_in_order_and_saturate() {
        assert_eq!(Phase::Interview.next(), Phase::Design);
        assert_eq!(Phase::Planning.next(), Phase::Breakdown);
        assert_eq!(Phase::Execute.next(), Phase::Execute);
    }

    #[test]
    fn phase_parses_its_own_name() {
        assert_eq!(Phase::from_str("visualize"), Some(Phase::Visualize));
        assert_eq!(Phase::from_str("shipping"), None);
    }
}
