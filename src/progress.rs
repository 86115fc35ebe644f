//! Live progress of running tasks.
//!
//! [`ProgressTracker`] keeps one record per task behind its own lock, so
//! updates to different tasks never contend; the map of records is only
//! locked long enough to find or insert an entry. After every mutation the
//! tracker hands a fresh [`ProgressSnapshot`] to each listener, synchronously
//! and in registration order. A listener that errors or panics is logged and
//! skipped.
//!
//! The in-memory state is not authoritative. Records are flushed to the store
//! as `checkpoint` log rows every few mutations, on a timer, and always when
//! a task reaches a terminal status; [`ProgressTracker::recover`] reads the
//! last one back. A terminal task's record is dropped after that final
//! checkpoint, so the map only holds tasks that can still change.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::TrackerConfig;
use crate::db::Database;
use crate::error::Result;
use crate::models::*;

/// Callback invoked with every new snapshot.
pub type Listener = Box<dyn Fn(&ProgressSnapshot) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<Inner>,
}

struct Inner {
    db: Database,
    config: TrackerConfig,
    records: RwLock<HashMap<Uuid, Arc<Mutex<TaskRecord>>>>,
    listeners: RwLock<Vec<(ListenerId, Arc<Listener>)>>,
    next_listener: AtomicU64,
}

struct TaskRecord {
    task_id: Uuid,
    iteration: u32,
    max_iterations: u32,
    criteria_verified: usize,
    criteria_total: usize,
    status: TaskStatus,
    recent: VecDeque<RecentEvent>,
    unflushed: u32,
}

impl TaskRecord {
    fn new(task: &Task) -> Self {
        Self {
            task_id: task.id,
            iteration: task.iteration,
            max_iterations: task.max_iterations.unwrap_or(0),
            criteria_verified: task.criteria_verified(),
            criteria_total: task.acceptance_criteria.len(),
            status: task.status,
            recent: VecDeque::new(),
            unflushed: 0,
        }
    }

    fn snapshot(&self) -> ProgressSnapshot {
        let progress_percent = if self.status == TaskStatus::Complete {
            100
        } else if self.criteria_total == 0 {
            0
        } else {
            (self.criteria_verified * 100 / self.criteria_total) as u8
        };

        ProgressSnapshot {
            task_id: self.task_id,
            iteration: self.iteration,
            max_iterations: self.max_iterations,
            progress_percent,
            criteria_verified: self.criteria_verified,
            criteria_total: self.criteria_total,
            recent_events: self.recent.iter().cloned().collect(),
            status: self.status,
        }
    }

    fn push_event(&mut self, event: RecentEvent, capacity: usize) {
        if capacity == 0 {
            return;
        }
        while self.recent.len() >= capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(event);
    }
}

impl ProgressTracker {
    pub fn new(db: Database, config: TrackerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                config,
                records: RwLock::new(HashMap::new()),
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.write().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Start tracking a run of `task` with the given iteration budget.
    pub fn begin_run(&self, task: &Task, max_iterations: u32) -> ProgressSnapshot {
        let record = self.record_for(task);
        let snapshot = {
            let mut record = record.lock();
            record.iteration = task.iteration;
            record.max_iterations = max_iterations;
            record.criteria_verified = task.criteria_verified();
            record.criteria_total = task.acceptance_criteria.len();
            record.status = task.status;
            record.unflushed += 1;
            record.snapshot()
        };
        self.notify(&snapshot);
        snapshot
    }

    /// Fold the latest persisted state of a task into its record. Terminal
    /// statuses force a checkpoint and then evict the record.
    pub fn observe(&self, task: &Task) -> Result<ProgressSnapshot> {
        let record = self.record_for(task);
        let (snapshot, due) = {
            let mut record = record.lock();
            record.iteration = task.iteration;
            if let Some(max) = task.max_iterations {
                record.max_iterations = max;
            }
            record.criteria_verified = task.criteria_verified();
            record.criteria_total = task.acceptance_criteria.len();
            record.status = task.status;
            record.unflushed += 1;
            (
                record.snapshot(),
                task.status.is_terminal() || record.unflushed >= self.inner.config.checkpoint_every,
            )
        };

        self.notify(&snapshot);
        if due {
            self.flush(task.id)?;
        }
        if task.status.is_terminal() {
            self.inner.records.write().remove(&task.id);
        }
        Ok(snapshot)
    }

    /// Append an execution event to the audit log and, if the task is being
    /// tracked, to its ring buffer.
    pub fn record_event(&self, entry: NewLogEntry) -> Result<LogEntry> {
        let logged = self.inner.db.append_log(entry)?;
        self.track(&logged)?;
        Ok(logged)
    }

    /// Fold an already persisted event into its task's ring buffer.
    pub fn track(&self, logged: &LogEntry) -> Result<()> {
        let Some(task_id) = logged.task_id else {
            return Ok(());
        };
        let Some(record) = self.inner.records.read().get(&task_id).cloned() else {
            return Ok(());
        };

        let (snapshot, due) = {
            let mut record = record.lock();
            record.push_event(
                RecentEvent {
                    time: logged.timestamp,
                    message: logged.message.clone(),
                },
                self.inner.config.recent_events,
            );
            record.unflushed += 1;
            (
                record.snapshot(),
                record.unflushed >= self.inner.config.checkpoint_every,
            )
        };

        self.notify(&snapshot);
        if due {
            self.flush(task_id)?;
        }
        Ok(())
    }

    /// Bump the round counter and log the round.
    pub fn begin_iteration(&self, task_id: Uuid, iteration: u32, worker_id: &str) -> Result<LogEntry> {
        let max = match self.inner.records.read().get(&task_id) {
            Some(record) => {
                let mut record = record.lock();
                record.iteration = iteration;
                record.max_iterations
            }
            None => 0,
        };

        self.record_event(
            NewLogEntry::for_task(
                task_id,
                EventKind::Iteration,
                format!("Iteration {}/{}", iteration, max),
            )
            .worker(worker_id)
            .payload(serde_json::json!({ "iteration": iteration, "max_iterations": max })),
        )
    }

    pub fn snapshot(&self, task_id: Uuid) -> Option<ProgressSnapshot> {
        self.inner
            .records
            .read()
            .get(&task_id)
            .map(|record| record.lock().snapshot())
    }

    /// Snapshots of every tracked task, running ones first.
    pub fn snapshots(&self) -> Vec<ProgressSnapshot> {
        let records: Vec<_> = self.inner.records.read().values().cloned().collect();
        let mut snapshots: Vec<_> = records.iter().map(|r| r.lock().snapshot()).collect();
        snapshots.sort_by_key(|s| (s.status != TaskStatus::InProgress, s.task_id));
        snapshots
    }

    /// Write the task's current record to the store as a checkpoint row.
    pub fn flush(&self, task_id: Uuid) -> Result<()> {
        let Some(record) = self.inner.records.read().get(&task_id).cloned() else {
            return Ok(());
        };
        let snapshot = {
            let mut record = record.lock();
            record.unflushed = 0;
            record.snapshot()
        };

        self.inner.db.append_log(
            NewLogEntry::for_task(
                task_id,
                EventKind::Checkpoint,
                format!(
                    "Checkpoint: iteration {}, {}/{} criteria verified",
                    snapshot.iteration, snapshot.criteria_verified, snapshot.criteria_total
                ),
            )
            .level(Severity::Debug)
            .payload(serde_json::to_value(&snapshot)?),
        )?;
        Ok(())
    }

    /// Flush every record that changed since its last checkpoint.
    pub fn flush_dirty(&self) -> Result<usize> {
        let dirty: Vec<Uuid> = self
            .inner
            .records
            .read()
            .iter()
            .filter(|(_, record)| record.lock().unflushed > 0)
            .map(|(id, _)| *id)
            .collect();

        for task_id in &dirty {
            self.flush(*task_id)?;
        }
        Ok(dirty.len())
    }

    /// Last durable snapshot of a task, if one was ever flushed.
    pub fn recover(&self, task_id: Uuid) -> Result<Option<ProgressSnapshot>> {
        let checkpoint = self.inner.db.latest_log(task_id, EventKind::Checkpoint)?;
        Ok(checkpoint
            .and_then(|entry| entry.payload)
            .and_then(|payload| serde_json::from_value(payload).ok()))
    }

    /// Best available view of `task`: the live record, then the last
    /// checkpoint, then a snapshot computed from the stored task.
    pub fn progress_of(&self, task: &Task) -> Result<ProgressSnapshot> {
        if let Some(snapshot) = self.snapshot(task.id) {
            return Ok(snapshot);
        }
        if let Some(snapshot) = self.recover(task.id)? {
            return Ok(snapshot);
        }
        Ok(TaskRecord::new(task).snapshot())
    }

    /// Periodically flush dirty records until `shutdown` fires, then flush
    /// once more.
    pub fn spawn_checkpointer(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let tracker = self.clone();
        let period = Duration::from_secs(self.inner.config.checkpoint_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = tracker.flush_dirty() {
                            tracing::warn!("Periodic progress checkpoint failed: {}", e);
                        }
                    }
                }
            }
            if let Err(e) = tracker.flush_dirty() {
                tracing::warn!("Final progress checkpoint failed: {}", e);
            }
        })
    }

    fn record_for(&self, task: &Task) -> Arc<Mutex<TaskRecord>> {
        if let Some(record) = self.inner.records.read().get(&task.id) {
            return record.clone();
        }
        self.inner
            .records
            .write()
            .entry(task.id)
            .or_insert_with(|| Arc::new(Mutex::new(TaskRecord::new(task))))
            .clone()
    }

    fn notify(&self, snapshot: &ProgressSnapshot) {
        let listeners: Vec<(ListenerId, Arc<Listener>)> = self.inner.listeners.read().clone();
        for (id, listener) in listeners {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(snapshot))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(listener = id.0, task_id = %snapshot.task_id, "Progress listener failed: {:#}", e);
                }
                Err(_) => {
                    tracing::error!(listener = id.0, task_id = %snapshot.task_id, "Progress listener panicked");
                }
            }
        }
    }
}
