use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::logs::insert_log;
use super::{parse_datetime, parse_uuid, Database};
use crate::error::{Error, Result};
use crate::models::*;
use crate::resolver::{self, DependencySnapshot, Readiness};

const TASK_COLUMNS: &str = "id, component_id, title, description, status, priority, assigned_worker,
     read_files, scope, iteration, max_iterations, failure_reason, revision,
     created_at, started_at, completed_at";

/// Terminal write requested by the state machine.
#[derive(Debug, Clone)]
pub(crate) enum TerminalUpdate {
    Complete,
    Failed(FailureReason),
}

impl TerminalUpdate {
    fn status(&self) -> TaskStatus {
        match self {
            Self::Complete => TaskStatus::Complete,
            Self::Failed(_) => TaskStatus::Failed,
        }
    }
}

/// Result of re-running the resolver against one task.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub task: Task,
    pub readiness: Readiness,
    /// `(from, to)` when the task's status flipped.
    pub transition: Option<(TaskStatus, TaskStatus)>,
}

impl Database {
    // ============================================================
    // Task reads
    // ============================================================

    pub fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        load_task(&conn, id)
    }

    /// Tasks of one component in execution order.
    pub fn get_tasks_by_component(&self, component_id: Uuid) -> Result<Vec<Task>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        load_tasks(
            &conn,
            &format!(
                "SELECT {} FROM tasks WHERE component_id = ?
                 ORDER BY priority, created_at, rowid",
                TASK_COLUMNS
            ),
            [component_id.to_string()],
        )
    }

    /// Unclaimed PENDING tasks across all projects in execution order.
    pub fn get_ready_tasks(&self, limit: usize) -> Result<Vec<Task>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        load_tasks(
            &conn,
            &format!(
                "SELECT {} FROM tasks
                 WHERE status = 'pending' AND assigned_worker IS NULL
                 ORDER BY priority, created_at, rowid
                 LIMIT ?",
                TASK_COLUMNS
            ),
            [limit as i64],
        )
    }

    pub fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        load_tasks(
            &conn,
            &format!(
                "SELECT {} FROM tasks WHERE status = ? ORDER BY priority, created_at, rowid",
                TASK_COLUMNS
            ),
            [status.as_str()],
        )
    }

    /// Ids of tasks that declare a dependency on `source`.
    pub fn get_dependents(&self, source: Uuid) -> Result<Vec<Uuid>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT d.task_id FROM task_dependencies d
             JOIN tasks t ON t.id = d.task_id
             WHERE d.depends_on = ?
             ORDER BY t.priority, t.created_at, t.rowid",
        )?;
        let ids = stmt
            .query_map([source.to_string()], |row| row.get::<_, String>(0))?
            .map(|r| r.map(parse_uuid))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Evaluate a task's dependencies without changing anything.
    pub fn readiness(&self, task_id: Uuid) -> Result<Readiness> {
        let conn = self.conn.lock().expect("database lock poisoned");
        ensure_task_exists(&conn, task_id)?;
        let (sources, snapshot) = dependency_snapshot(&conn, task_id)?;
        Ok(resolver::evaluate(&sources, &snapshot))
    }

    // ============================================================
    // Task writes
    // ============================================================

    /// Insert a task with its criteria and dependency edges.
    ///
    /// The task starts PENDING when every source is already COMPLETE and
    /// BLOCKED otherwise.
    pub(crate) fn insert_task(&self, component_id: Uuid, input: CreateTaskInput) -> Result<Task> {
        if input.title.trim().is_empty() {
            return Err(Error::validation("Task title must not be empty"));
        }
        if input.max_iterations == Some(0) {
            return Err(Error::validation("max_iterations must be at least 1"));
        }
        if input.acceptance_criteria.iter().any(|c| c.trim().is_empty()) {
            return Err(Error::validation("Acceptance criteria must not be empty"));
        }

        let mut depends_on: Vec<Uuid> = Vec::with_capacity(input.depends_on.len());
        for dep in input.depends_on {
            if !depends_on.contains(&dep) {
                depends_on.push(dep);
            }
        }

        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        let component_exists = tx
            .query_row(
                "SELECT 1 FROM components WHERE id = ?",
                [component_id.to_string()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !component_exists {
            return Err(Error::not_found("Component", component_id));
        }

        let mut snapshot = DependencySnapshot::new();
        for dep in &depends_on {
            let status = task_status(&tx, *dep)?.ok_or_else(|| Error::not_found("Task", dep))?;
            snapshot.insert(*dep, status);
        }
        let status = resolver::initial_status(&resolver::evaluate(&depends_on, &snapshot));

        let id = Uuid::new_v4();
        let now = Utc::now();
        tx.execute(
            "INSERT INTO tasks (id, component_id, title, description, status, priority,
                                read_files, scope, max_iterations, revision, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)",
            (
                id.to_string(),
                component_id.to_string(),
                &input.title,
                &input.description,
                status.as_str(),
                input.priority.unwrap_or(0),
                serde_json::to_string(&input.read_files)?,
                serde_json::to_string(&input.scope)?,
                input.max_iterations,
                now.to_rfc3339(),
            ),
        )?;

        for (position, (source, satisfied)) in resolver::satisfaction(&depends_on, &snapshot)
            .into_iter()
            .enumerate()
        {
            tx.execute(
                "INSERT INTO task_dependencies (task_id, depends_on, position, satisfied)
                 VALUES (?, ?, ?, ?)",
                (id.to_string(), source.to_string(), position as i64, satisfied),
            )?;
        }

        for (position, description) in input.acceptance_criteria.iter().enumerate() {
            tx.execute(
                "INSERT INTO acceptance_criteria (task_id, position, description)
                 VALUES (?, ?, ?)",
                (id.to_string(), position as i64, description),
            )?;
        }

        let task = load_task(&tx, id)?.ok_or_else(|| Error::not_found("Task", id))?;
        tx.commit()?;
        Ok(task)
    }

    /// Atomically assign an unclaimed, ready task to `worker_id` and move it
    /// to IN_PROGRESS. Of several concurrent claimants exactly one wins; the
    /// rest get [`Error::Conflict`].
    ///
    /// This and the other status writes take an `events` builder: the audit
    /// rows it returns are inserted in the same transaction as the change.
    pub(crate) fn claim_task(
        &self,
        id: Uuid,
        worker_id: &str,
        events: impl FnOnce(TaskStatus, &Task) -> Vec<NewLogEntry>,
    ) -> Result<(Task, Vec<LogEntry>)> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        let (status, holder, revision) = tx
            .query_row(
                "SELECT status, assigned_worker, revision FROM tasks WHERE id = ?",
                [id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| Error::not_found("Task", id))?;
        let status = TaskStatus::from_str(&status).unwrap_or(TaskStatus::Pending);

        if let Some(holder) = holder {
            return Err(Error::Conflict(format!(
                "Task {} is already claimed by {}",
                id, holder
            )));
        }
        status.ensure_transition(TaskStatus::InProgress)?;

        let (sources, snapshot) = dependency_snapshot(&tx, id)?;
        let readiness = resolver::evaluate(&sources, &snapshot);
        if !readiness.is_ready() {
            return Err(Error::NotReady {
                task_id: id,
                waiting: readiness.blockers().to_vec(),
            });
        }

        let rows = tx.execute(
            "UPDATE tasks
             SET status = 'in_progress', assigned_worker = ?, started_at = ?,
                 iteration = 0, revision = revision + 1
             WHERE id = ? AND revision = ? AND assigned_worker IS NULL",
            (worker_id, Utc::now().to_rfc3339(), id.to_string(), revision),
        )?;
        if rows == 0 {
            return Err(Error::Conflict(format!("Task {} was claimed concurrently", id)));
        }

        let task = load_task(&tx, id)?.ok_or_else(|| Error::not_found("Task", id))?;
        let logged = log_all(&tx, events(status, &task))?;
        tx.commit()?;
        Ok((task, logged))
    }

    /// Move an IN_PROGRESS task to COMPLETE or FAILED, guarded by the revision
    /// the caller last read.
    pub(crate) fn finish_task(
        &self,
        id: Uuid,
        expected_revision: i64,
        update: TerminalUpdate,
        events: impl FnOnce(TaskStatus, &Task) -> Vec<NewLogEntry>,
    ) -> Result<(Task, Vec<LogEntry>)> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        let current = load_task(&tx, id)?.ok_or_else(|| Error::not_found("Task", id))?;
        if current.revision != expected_revision {
            return Err(stale(id, expected_revision, current.revision));
        }
        current.status.ensure_transition(update.status())?;

        let now = Utc::now().to_rfc3339();
        match &update {
            TerminalUpdate::Complete => tx.execute(
                "UPDATE tasks
                 SET status = 'complete', completed_at = ?, failure_reason = NULL,
                     revision = revision + 1
                 WHERE id = ? AND revision = ?",
                (now, id.to_string(), expected_revision),
            )?,
            TerminalUpdate::Failed(reason) => tx.execute(
                "UPDATE tasks
                 SET status = 'failed', completed_at = ?, failure_reason = ?,
                     revision = revision + 1
                 WHERE id = ? AND revision = ?",
                (
                    now,
                    serde_json::to_string(reason)?,
                    id.to_string(),
                    expected_revision,
                ),
            )?,
        };

        let task = load_task(&tx, id)?.ok_or_else(|| Error::not_found("Task", id))?;
        let logged = log_all(&tx, events(current.status, &task))?;
        tx.commit()?;
        Ok((task, logged))
    }

    /// Reset a FAILED task for another attempt. It lands in PENDING or BLOCKED
    /// depending on its dependencies; criteria verification is kept.
    pub(crate) fn retry_task(
        &self,
        id: Uuid,
        expected_revision: i64,
        events: impl FnOnce(TaskStatus, &Task) -> Vec<NewLogEntry>,
    ) -> Result<(Task, Vec<LogEntry>)> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        let current = load_task(&tx, id)?.ok_or_else(|| Error::not_found("Task", id))?;
        if current.revision != expected_revision {
            return Err(stale(id, expected_revision, current.revision));
        }

        let (sources, snapshot) = dependency_snapshot(&tx, id)?;
        let next = resolver::initial_status(&resolver::evaluate(&sources, &snapshot));
        current.status.ensure_transition(next)?;

        write_satisfaction(&tx, id, &resolver::satisfaction(&sources, &snapshot))?;
        tx.execute(
            "UPDATE tasks
             SET status = ?, assigned_worker = NULL, failure_reason = NULL, iteration = 0,
                 started_at = NULL, completed_at = NULL, revision = revision + 1
             WHERE id = ? AND revision = ?",
            (next.as_str(), id.to_string(), expected_revision),
        )?;

        let task = load_task(&tx, id)?.ok_or_else(|| Error::not_found("Task", id))?;
        let logged = log_all(&tx, events(current.status, &task))?;
        tx.commit()?;
        Ok((task, logged))
    }

    /// Re-run the resolver for one task: refresh its `satisfied` flags and
    /// flip PENDING/BLOCKED when the verdict changed. Snapshot and write
    /// share a transaction.
    pub(crate) fn resolve_task(&self, id: Uuid) -> Result<Resolution> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        let current = load_task(&tx, id)?.ok_or_else(|| Error::not_found("Task", id))?;
        let (sources, snapshot) = dependency_snapshot(&tx, id)?;
        let readiness = resolver::evaluate(&sources, &snapshot);
        let flags = resolver::satisfaction(&sources, &snapshot);

        let flags_changed = current
            .dependencies
            .iter()
            .zip(flags.iter())
            .any(|(dep, (_, satisfied))| dep.satisfied != *satisfied);
        let next = resolver::resolved_status(
            current.status,
            current.assigned_worker.is_some(),
            &readiness,
        );

        if flags_changed {
            write_satisfaction(&tx, id, &flags)?;
        }
        if let Some(next) = next {
            current.status.ensure_transition(next)?;
            tx.execute(
                "UPDATE tasks SET status = ?, revision = revision + 1 WHERE id = ? AND revision = ?",
                (next.as_str(), id.to_string(), current.revision),
            )?;
        } else if flags_changed {
            tx.execute(
                "UPDATE tasks SET revision = revision + 1 WHERE id = ?",
                [id.to_string()],
            )?;
        }

        let task = load_task(&tx, id)?.ok_or_else(|| Error::not_found("Task", id))?;
        tx.commit()?;

        Ok(Resolution {
            task,
            readiness,
            transition: next.map(|to| (current.status, to)),
        })
    }

    /// Add a dependency edge `task_id -> source`. Rejects self-edges and
    /// edges that would close a cycle. Only tasks that have not started may
    /// gain dependencies.
    pub(crate) fn add_dependency(&self, task_id: Uuid, source: Uuid) -> Result<bool> {
        if task_id == source {
            return Err(Error::validation("A task cannot depend on itself"));
        }

        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        let status = task_status(&tx, task_id)?.ok_or_else(|| Error::not_found("Task", task_id))?;
        let source_status =
            task_status(&tx, source)?.ok_or_else(|| Error::not_found("Task", source))?;
        if !matches!(status, TaskStatus::Pending | TaskStatus::Blocked) {
            return Err(Error::validation(format!(
                "Cannot add dependencies to a task that is {}",
                status
            )));
        }

        let exists = tx
            .query_row(
                "SELECT 1 FROM task_dependencies WHERE task_id = ? AND depends_on = ?",
                [task_id.to_string(), source.to_string()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Ok(false);
        }

        // The edge closes a cycle if the source already (transitively)
        // depends on this task.
        let cycle = tx
            .query_row(
                "WITH RECURSIVE upstream(id) AS (
                    SELECT depends_on FROM task_dependencies WHERE task_id = ?1
                    UNION
                    SELECT d.depends_on FROM task_dependencies d JOIN upstream u ON d.task_id = u.id
                 )
                 SELECT 1 FROM upstream WHERE id = ?2",
                [source.to_string(), task_id.to_string()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if cycle {
            return Err(Error::validation(format!(
                "Dependency on {} would create a cycle",
                source
            )));
        }

        tx.execute(
            "INSERT INTO task_dependencies (task_id, depends_on, position, satisfied)
             VALUES (?1, ?2,
                     (SELECT COALESCE(MAX(position) + 1, 0) FROM task_dependencies WHERE task_id = ?1),
                     ?3)",
            (
                task_id.to_string(),
                source.to_string(),
                resolver::is_satisfied(Some(source_status)),
            ),
        )?;
        tx.execute(
            "UPDATE tasks SET revision = revision + 1 WHERE id = ?",
            [task_id.to_string()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Mark one acceptance criterion verified. Returns `false` when it
    /// already was.
    pub(crate) fn verify_criterion(&self, task_id: Uuid, index: usize, worker_id: &str) -> Result<bool> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        let status = task_status(&tx, task_id)?.ok_or_else(|| Error::not_found("Task", task_id))?;
        if status != TaskStatus::InProgress {
            return Err(Error::validation(format!(
                "Criteria can only be verified on a running task, task is {}",
                status
            )));
        }

        let verified = tx
            .query_row(
                "SELECT verified FROM acceptance_criteria WHERE task_id = ? AND position = ?",
                (task_id.to_string(), index as i64),
                |row| row.get::<_, bool>(0),
            )
            .optional()?
            .ok_or_else(|| Error::not_found("Acceptance criterion", format!("{}#{}", task_id, index)))?;
        if verified {
            return Ok(false);
        }

        tx.execute(
            "UPDATE acceptance_criteria SET verified = 1, verified_by = ?, verified_at = ?
             WHERE task_id = ? AND position = ?",
            (
                worker_id,
                Utc::now().to_rfc3339(),
                task_id.to_string(),
                index as i64,
            ),
        )?;
        tx.execute(
            "UPDATE tasks SET revision = revision + 1 WHERE id = ?",
            [task_id.to_string()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Persist the round counter of a running task.
    pub(crate) fn record_iteration(&self, task_id: Uuid, iteration: u32) -> Result<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute(
            "UPDATE tasks SET iteration = ? WHERE id = ? AND status = 'in_progress'",
            (iteration, task_id.to_string()),
        )?;
        if rows == 0 {
            ensure_task_exists(&conn, task_id)?;
        }
        Ok(())
    }

    pub(crate) fn delete_task(&self, id: Uuid, policy: DeletePolicy) -> Result<DeleteOutcome> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        let dependents = {
            let mut stmt = tx.prepare(
                "SELECT task_id FROM task_dependencies WHERE depends_on = ? ORDER BY task_id",
            )?;
            let ids = stmt
                .query_map([id.to_string()], |row| row.get::<_, String>(0))?
                .map(|r| r.map(parse_uuid))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            ids
        };
        if policy == DeletePolicy::Restrict && !dependents.is_empty() {
            return Err(Error::Conflict(format!(
                "{} tasks depend on task {}",
                dependents.len(),
                id
            )));
        }

        let rows = tx.execute("DELETE FROM tasks WHERE id = ?", [id.to_string()])?;
        tx.commit()?;

        Ok(DeleteOutcome {
            deleted: rows > 0,
            detached_dependents: if rows > 0 { dependents } else { vec![] },
        })
    }
}

fn log_all(conn: &Connection, entries: Vec<NewLogEntry>) -> Result<Vec<LogEntry>> {
    entries.into_iter().map(|entry| insert_log(conn, entry)).collect()
}

fn stale(id: Uuid, expected: i64, actual: i64) -> Error {
    Error::Conflict(format!(
        "Task {} changed underneath the caller (revision {} != {})",
        id, expected, actual
    ))
}

fn task_status(conn: &Connection, id: Uuid) -> Result<Option<TaskStatus>> {
    let status = conn
        .query_row(
            "SELECT status FROM tasks WHERE id = ?",
            [id.to_string()],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(status.map(|s| TaskStatus::from_str(&s).unwrap_or(TaskStatus::Pending)))
}

fn ensure_task_exists(conn: &Connection, id: Uuid) -> Result<()> {
    task_status(conn, id)?
        .map(|_| ())
        .ok_or_else(|| Error::not_found("Task", id))
}

/// Declared sources of a task, in order, plus their current statuses.
fn dependency_snapshot(conn: &Connection, task_id: Uuid) -> Result<(Vec<Uuid>, DependencySnapshot)> {
    let mut stmt = conn.prepare(
        "SELECT d.depends_on, t.status
         FROM task_dependencies d
         JOIN tasks t ON t.id = d.depends_on
         WHERE d.task_id = ?
         ORDER BY d.position",
    )?;
    let rows = stmt
        .query_map([task_id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut sources = Vec::with_capacity(rows.len());
    let mut snapshot = DependencySnapshot::new();
    for (source, status) in rows {
        let source = parse_uuid(source);
        sources.push(source);
        snapshot.insert(source, TaskStatus::from_str(&status).unwrap_or(TaskStatus::Pending));
    }
    Ok((sources, snapshot))
}

fn write_satisfaction(conn: &Connection, task_id: Uuid, flags: &[(Uuid, bool)]) -> Result<()> {
    for (source, satisfied) in flags {
        conn.execute(
            "UPDATE task_dependencies SET satisfied = ? WHERE task_id = ? AND depends_on = ?",
            (*satisfied, task_id.to_string(), source.to_string()),
        )?;
    }
    Ok(())
}

fn load_task(conn: &Connection, id: Uuid) -> Result<Option<Task>> {
    let task = conn
        .query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS),
            [id.to_string()],
            task_from_row,
        )
        .optional()?;
    match task {
        Some(mut task) => {
            load_children(conn, &mut task)?;
            Ok(Some(task))
        }
        None => Ok(None),
    }
}

fn load_tasks<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(sql)?;
    let mut tasks = stmt
        .query_map(params, task_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for task in &mut tasks {
        load_children(conn, task)?;
    }
    Ok(tasks)
}

fn load_children(conn: &Connection, task: &mut Task) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT depends_on, satisfied FROM task_dependencies WHERE task_id = ? ORDER BY position",
    )?;
    task.dependencies = stmt
        .query_map([task.id.to_string()], |row| {
            Ok(Dependency {
                task_id: parse_uuid(row.get::<_, String>(0)?),
                satisfied: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT description, verified, verified_by, verified_at
         FROM acceptance_criteria WHERE task_id = ? ORDER BY position",
    )?;
    task.acceptance_criteria = stmt
        .query_map([task.id.to_string()], |row| {
            Ok(AcceptanceCriterion {
                description: row.get(0)?,
                verified: row.get(1)?,
                verified_by: row.get(2)?,
                verified_at: row.get::<_, Option<String>>(3)?.map(parse_datetime),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(())
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let read_files: String = row.get(7)?;
    let scope: String = row.get(8)?;
    let failure_reason: Option<String> = row.get(11)?;

    Ok(Task {
        id: parse_uuid(row.get::<_, String>(0)?),
        component_id: parse_uuid(row.get::<_, String>(1)?),
        title: row.get(2)?,
        description: row.get(3)?,
        status: TaskStatus::from_str(&row.get::<_, String>(4)?).unwrap_or(TaskStatus::Pending),
        priority: row.get(5)?,
        assigned_worker: row.get(6)?,
        dependencies: vec![],
        acceptance_criteria: vec![],
        read_files: serde_json::from_str(&read_files).unwrap_or_default(),
        scope: serde_json::from_str(&scope).unwrap_or_default(),
        iteration: row.get(9)?,
        max_iterations: row.get(10)?,
        failure_reason: failure_reason.and_then(|s| serde_json::from_str(&s).ok()),
        revision: row.get(12)?,
        created_at: parse_datetime(row.get::<_, String>(13)?),
        started_at: row.get::<_, Option<String>>(14)?.map(parse_datetime),
        completed_at: row.get::<_, Option<String>>(15)?.map(parse_datetime),
    })
}
