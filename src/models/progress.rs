use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::TaskStatus;

/// Live view of one task's execution, handed to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub task_id: Uuid,
    pub iteration: u32,
    pub max_iterations: u32,
    pub progress_percent: u8,
    pub criteria_verified: usize,
    pub criteria_total: usize,
    pub recent_events: Vec<RecentEvent>,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentEvent {
    pub time: DateTime<Utc>,
    pub message: String,
}
