//! Registry of active task runs.
//!
//! One mutex guards the whole map; every operation holds it only for a map
//! lookup or update and never across an await. A run is registered when a
//! worker starts and removed when its [`RunGuard`] drops.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<Mutex<HashMap<Uuid, ActiveRun>>>,
}

#[derive(Debug, Clone)]
struct ActiveRun {
    worker_id: String,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

/// Public view of a registered run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunInfo {
    pub task_id: Uuid,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub cancelled: bool,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run for `task_id`. Fails with `Conflict` if one is already
    /// active.
    pub fn register(&self, task_id: Uuid, worker_id: &str) -> Result<RunGuard> {
        let mut runs = self.runs.lock();
        if let Some(existing) = runs.get(&task_id) {
            return Err(Error::Conflict(format!(
                "Task {} is already running on {}",
                task_id, existing.worker_id
            )));
        }

        let cancel = CancellationToken::new();
        runs.insert(
            task_id,
            ActiveRun {
                worker_id: worker_id.to_string(),
                cancel: cancel.clone(),
                started_at: Utc::now(),
            },
        );

        Ok(RunGuard {
            registry: self.clone(),
            task_id,
            cancel,
        })
    }

    /// Request cancellation of a run. The worker stops at the top of its next
    /// round. Returns `false` if nothing is running for the task.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        match self.runs.lock().get(&task_id) {
            Some(run) => {
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let runs = self.runs.lock();
        for run in runs.values() {
            run.cancel.cancel();
        }
        runs.len()
    }

    pub fn get(&self, task_id: Uuid) -> Option<RunInfo> {
        self.runs.lock().get(&task_id).map(|run| info(task_id, run))
    }

    pub fn active(&self) -> Vec<RunInfo> {
        let mut runs: Vec<_> = self
            .runs
            .lock()
            .iter()
            .map(|(id, run)| info(*id, run))
            .collect();
        runs.sort_by_key(|r| r.started_at);
        runs
    }
}

fn info(task_id: Uuid, run: &ActiveRun) -> RunInfo {
    RunInfo {
        task_id,
        worker_id: run.worker_id.clone(),
        started_at: run.started_at,
        cancelled: run.cancel.is_cancelled(),
    }
}

/// Keeps a run registered for as long as it lives.
pub struct RunGuard {
    registry: RunRegistry,
    task_id: Uuid,
    cancel: CancellationToken,
}

impl RunGuard {
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry.runs.lock().remove(&self.task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_run_per_task() {
        let registry = RunRegistry::new();
        let task = Uuid::new_v4();

        let guard = registry.register(task, "w1").unwrap();
        assert!(matches!(registry.register(task, "w2"), Err(Error::Conflict(_))));
        assert_eq!(registry.get(task).unwrap().worker_id, "w1");

        drop(guard);
        assert!(registry.active().is_empty());
        assert!(registry.register(task, "w2").is_ok());
    }

    #[test]
    fn cancel_reaches_the_worker_token() {
        let registry = RunRegistry::new();
        let task = Uuid::new_v4();
        let guard = registry.register(task, "w1").unwrap();
        let token = guard.token();

        assert!(registry.cancel(task));
        assert!(token.is_cancelled());
        assert!(registry.get(task).unwrap().cancelled);
        assert!(!registry.cancel(Uuid::new_v4()));
    }
}
