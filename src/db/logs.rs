use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{parse_datetime, parse_uuid, Database};
use crate::error::Result;
use crate::models::*;

const LOG_COLUMNS: &str =
    "id, timestamp, project_id, component_id, task_id, worker_id, action, message, level, payload";

impl Database {
    // ============================================================
    // Audit log
    // ============================================================

    /// Append one row to the audit log. A row that names only a task gets
    /// the task's component and project filled in.
    pub fn append_log(&self, entry: NewLogEntry) -> Result<LogEntry> {
        let conn = self.conn.lock().expect("database lock poisoned");
        insert_log(&conn, entry)
    }

    /// A task's execution events, oldest first.
    pub fn get_logs_by_task(&self, task_id: Uuid) -> Result<Vec<LogEntry>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM logs WHERE task_id = ? ORDER BY id",
            LOG_COLUMNS
        ))?;
        let logs = stmt
            .query_map([task_id.to_string()], log_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(logs)
    }

    /// The most recent `limit` rows mentioning a project, oldest first.
    pub fn get_logs_by_project(&self, project_id: Uuid, limit: usize) -> Result<Vec<LogEntry>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM (
                SELECT {} FROM logs WHERE project_id = ? ORDER BY id DESC LIMIT ?
             ) ORDER BY id",
            LOG_COLUMNS
        ))?;
        let logs = stmt
            .query_map((project_id.to_string(), limit as i64), log_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(logs)
    }

    /// Newest row of one kind for a task.
    pub fn latest_log(&self, task_id: Uuid, action: EventKind) -> Result<Option<LogEntry>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let log = conn
            .query_row(
                &format!(
                    "SELECT {} FROM logs WHERE task_id = ? AND action = ? ORDER BY id DESC LIMIT 1",
                    LOG_COLUMNS
                ),
                [task_id.to_string(), action.as_str().to_string()],
                log_from_row,
            )
            .optional()?;
        Ok(log)
    }
}

/// Insert one log row on `conn`, which may be an open transaction.
pub(super) fn insert_log(conn: &Connection, mut entry: NewLogEntry) -> Result<LogEntry> {
    if let Some(task_id) = entry.task_id {
        if entry.component_id.is_none() || entry.project_id.is_none() {
            if let Some((component_id, project_id)) = task_owner(conn, task_id)? {
                entry.component_id.get_or_insert(component_id);
                entry.project_id.get_or_insert(project_id);
            }
        }
    }

    let now = Utc::now();
    let payload = entry
        .payload
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO logs (timestamp, project_id, component_id, task_id, worker_id, action, message, level, payload)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            now.to_rfc3339(),
            entry.project_id.map(|u| u.to_string()),
            entry.component_id.map(|u| u.to_string()),
            entry.task_id.map(|u| u.to_string()),
            &entry.worker_id,
            entry.action.as_str(),
            &entry.message,
            entry.level.as_str(),
            payload,
        ),
    )?;

    Ok(LogEntry {
        id: conn.last_insert_rowid(),
        timestamp: now,
        project_id: entry.project_id,
        component_id: entry.component_id,
        task_id: entry.task_id,
        worker_id: entry.worker_id,
        action: entry.action,
        message: entry.message,
        level: entry.level,
        payload: entry.payload,
    })
}

fn task_owner(conn: &Connection, task_id: Uuid) -> Result<Option<(Uuid, Uuid)>> {
    let owner = conn
        .query_row(
            "SELECT c.id, c.project_id FROM tasks t
             JOIN components c ON c.id = t.component_id
             WHERE t.id = ?",
            [task_id.to_string()],
            |row| {
                Ok((
                    parse_uuid(row.get::<_, String>(0)?),
                    parse_uuid(row.get::<_, String>(1)?),
                ))
            },
        )
        .optional()?;
    Ok(owner)
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<LogEntry> {
    let payload: Option<String> = row.get(9)?;
    Ok(LogEntry {
        id: row.get(0)?,
        timestamp: parse_datetime(row.get::<_, String>(1)?),
        project_id: row.get::<_, Option<String>>(2)?.map(parse_uuid),
        component_id: row.get::<_, Option<String>>(3)?.map(parse_uuid),
        task_id: row.get::<_, Option<String>>(4)?.map(parse_uuid),
        worker_id: row.get(5)?,
        action: EventKind::from_str(&row.get::<_, String>(6)?).unwrap_or(EventKind::Note),
        message: row.get(7)?,
        level: Severity::from_str(&row.get::<_, String>(8)?).unwrap_or(Severity::Info),
        payload: payload.and_then(|p| serde_json::from_str(&p).ok()),
    })
}
