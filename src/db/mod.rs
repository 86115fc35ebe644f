mod lease;
mod logs;
mod schema;
mod tasks;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, Transaction};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::*;

pub use lease::Lease;
pub(crate) use tasks::TerminalUpdate;
pub use tasks::Resolution;

/// Durable store for projects, components, tasks and the audit log.
///
/// Clones share one SQLite connection behind a mutex, so writers are
/// serialised and every multi-row write runs in a single transaction: a
/// concurrent reader sees either none or all of it.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::from_connection(conn)
    }

    pub fn open_default() -> Result<Self> {
        Self::open(Self::default_path()?)
    }

    pub fn default_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "foreman")
            .ok_or_else(|| Error::validation("Could not determine data directory"))?;
        Ok(dirs.data_dir().join("foreman.db"))
    }

    pub fn open_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        schema::run_migrations(&conn)
    }

    // ============================================================
    // Project operations
    // ============================================================

    pub fn get_all_projects(&self) -> Result<Vec<Project>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, name, phase, summary, created_at, updated_at
             FROM projects ORDER BY name",
        )?;

        let projects = stmt
            .query_map([], project_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(projects)
    }

    pub fn get_project(&self, id: Uuid) -> Result<Option<Project>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let project = conn
            .query_row(
                "SELECT id, name, phase, summary, created_at, updated_at
                 FROM projects WHERE id = ?",
                [id.to_string()],
                project_from_row,
            )
            .optional()?;
        Ok(project)
    }

    pub fn create_project(&self, input: CreateProjectInput) -> Result<Project> {
        if input.name.trim().is_empty() {
            return Err(Error::validation("Project name must not be empty"));
        }

        let conn = self.conn.lock().expect("database lock poisoned");
        let id = Uuid::new_v4();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO projects (id, name, phase, summary, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            (
                id.to_string(),
                &input.name,
                Phase::Interview.as_str(),
                &input.summary,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ),
        )?;

        Ok(Project {
            id,
            name: input.name,
            phase: Phase::Interview,
            summary: input.summary,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn update_project(&self, id: Uuid, input: UpdateProjectInput) -> Result<Project> {
        let existing = self
            .get_project(id)?
            .ok_or_else(|| Error::not_found("Project", id))?;

        let conn = self.conn.lock().expect("database lock poisoned");
        let now = Utc::now();
        let name = input.name.unwrap_or(existing.name);
        let summary = input.summary.or(existing.summary);

        conn.execute(
            "UPDATE projects SET name = ?, summary = ?, updated_at = ? WHERE id = ?",
            (&name, &summary, now.to_rfc3339(), id.to_string()),
        )?;

        Ok(Project {
            id,
            name,
            phase: existing.phase,
            summary,
            created_at: existing.created_at,
            updated_at: now,
        })
    }

    /// Move the project to its next phase. The phase is read and written in
    /// one transaction so concurrent advances never skip a phase.
    pub fn advance_phase(&self, id: Uuid) -> Result<Project> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        let mut project = tx
            .query_row(
                "SELECT id, name, phase, summary, created_at, updated_at
                 FROM projects WHERE id = ?",
                [id.to_string()],
                project_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::not_found("Project", id))?;

        let now = Utc::now();
        project.phase = project.phase.next();
        project.updated_at = now;

        tx.execute(
            "UPDATE projects SET phase = ?, updated_at = ? WHERE id = ?",
            (project.phase.as_str(), now.to_rfc3339(), id.to_string()),
        )?;
        tx.commit()?;

        Ok(project)
    }

    /// Delete a project and everything beneath it.
    pub fn delete_project(&self, id: Uuid, policy: DeletePolicy) -> Result<DeleteOutcome> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        let detached = external_dependents(
            &tx,
            "WITH scope_components(id) AS (
                SELECT id FROM components WHERE project_id = ?1
             )",
            id,
        )?;
        if policy == DeletePolicy::Restrict && !detached.is_empty() {
            return Err(Error::Conflict(format!(
                "{} tasks in other projects depend on project {}",
                detached.len(),
                id
            )));
        }

        let rows = tx.execute("DELETE FROM projects WHERE id = ?", [id.to_string()])?;
        tx.commit()?;

        Ok(DeleteOutcome {
            deleted: rows > 0,
            detached_dependents: if rows > 0 { detached } else { vec![] },
        })
    }

    // ============================================================
    // Component operations
    // ============================================================

    pub fn get_component(&self, id: Uuid) -> Result<Option<Component>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let component = conn
            .query_row(
                &format!("SELECT {} FROM components WHERE id = ?", COMPONENT_COLUMNS),
                [id.to_string()],
                component_from_row,
            )
            .optional()?;
        Ok(component)
    }

    pub fn get_components_by_project(&self, project_id: Uuid) -> Result<Vec<Component>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM components WHERE project_id = ? ORDER BY created_at, rowid",
            COMPONENT_COLUMNS
        ))?;

        let components = stmt
            .query_map([project_id.to_string()], component_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(components)
    }

    pub fn get_children(&self, parent_id: Uuid) -> Result<Vec<Component>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM components WHERE parent_id = ? ORDER BY created_at, rowid",
            COMPONENT_COLUMNS
        ))?;

        let components = stmt
            .query_map([parent_id.to_string()], component_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(components)
    }

    pub fn create_component(
        &self,
        project_id: Uuid,
        input: CreateComponentInput,
    ) -> Result<Component> {
        if input.label.trim().is_empty() {
            return Err(Error::validation("Component label must not be empty"));
        }
        let kind = input.kind.unwrap_or(ComponentKind::Node);
        if kind == ComponentKind::Root && input.parent_id.is_some() {
            return Err(Error::validation("Root components cannot have a parent"));
        }

        self.get_project(project_id)?
            .ok_or_else(|| Error::not_found("Project", project_id))?;

        if let Some(parent_id) = input.parent_id {
            let parent = self
                .get_component(parent_id)?
                .ok_or_else(|| Error::not_found("Component", parent_id))?;
            if parent.project_id != project_id {
                return Err(Error::validation(
                    "Parent component belongs to a different project",
                ));
            }
        }

        let conn = self.conn.lock().expect("database lock poisoned");
        let id = Uuid::new_v4();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO components (id, project_id, parent_id, label, kind, status, position_x, position_y, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                id.to_string(),
                project_id.to_string(),
                input.parent_id.map(|u| u.to_string()),
                &input.label,
                kind.as_str(),
                TaskStatus::Pending.as_str(),
                input.position.map(|p| p.x),
                input.position.map(|p| p.y),
                now.to_rfc3339(),
                now.to_rfc3339(),
            ),
        )?;

        Ok(Component {
            id,
            project_id,
            parent_id: input.parent_id,
            label: input.label,
            kind,
            status: TaskStatus::Pending,
            position: input.position,
            created_at: now,
            updated_at: now,
        })
    }

    /// Re-parent a component. Rejects moves that would leave the forest
    /// (cycles, cross-project parents, parented roots).
    pub fn move_component(&self, id: Uuid, new_parent: Option<Uuid>) -> Result<Component> {
        let mut component = self
            .get_component(id)?
            .ok_or_else(|| Error::not_found("Component", id))?;

        if let Some(parent_id) = new_parent {
            if component.kind == ComponentKind::Root {
                return Err(Error::validation("Root components cannot have a parent"));
            }
            let parent = self
                .get_component(parent_id)?
                .ok_or_else(|| Error::not_found("Component", parent_id))?;
            if parent.project_id != component.project_id {
                return Err(Error::validation(
                    "Parent component belongs to a different project",
                ));
            }

            // Walk up from the new parent; meeting ourselves means a cycle.
            let mut cursor = Some(parent);
            while let Some(ancestor) = cursor {
                if ancestor.id == id {
                    return Err(Error::validation(
                        "Moving a component under its own descendant would create a cycle",
                    ));
                }
                cursor = match ancestor.parent_id {
                    Some(next) => self.get_component(next)?,
                    None => None,
                };
            }
        }

        let conn = self.conn.lock().expect("database lock poisoned");
        let now = Utc::now();
        conn.execute(
            "UPDATE components SET parent_id = ?, updated_at = ? WHERE id = ?",
            (
                new_parent.map(|u| u.to_string()),
                now.to_rfc3339(),
                id.to_string(),
            ),
        )?;

        component.parent_id = new_parent;
        component.updated_at = now;
        Ok(component)
    }

    /// Delete a component, its descendants and all of their tasks.
    pub fn delete_component(&self, id: Uuid, policy: DeletePolicy) -> Result<DeleteOutcome> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        let detached = external_dependents(
            &tx,
            "WITH RECURSIVE scope_components(id) AS (
                SELECT id FROM components WHERE id = ?1
                UNION ALL
                SELECT c.id FROM components c JOIN scope_components s ON c.parent_id = s.id
             )",
            id,
        )?;
        if policy == DeletePolicy::Restrict && !detached.is_empty() {
            return Err(Error::Conflict(format!(
                "{} tasks outside component {} depend on its tasks",
                detached.len(),
                id
            )));
        }

        let rows = tx.execute("DELETE FROM components WHERE id = ?", [id.to_string()])?;
        tx.commit()?;

        Ok(DeleteOutcome {
            deleted: rows > 0,
            detached_dependents: if rows > 0 { detached } else { vec![] },
        })
    }

    pub fn get_component_tree(&self, project_id: Uuid) -> Result<Vec<ComponentTreeNode>> {
        let components = self.get_components_by_project(project_id)?;

        let mut children_map: std::collections::HashMap<Option<Uuid>, Vec<Component>> =
            std::collections::HashMap::new();
        for component in components {
            children_map
                .entry(component.parent_id)
                .or_default()
                .push(component);
        }

        fn build_subtree(
            parent_id: Option<Uuid>,
            children_map: &std::collections::HashMap<Option<Uuid>, Vec<Component>>,
        ) -> Vec<ComponentTreeNode> {
            children_map
                .get(&parent_id)
                .map(|components| {
                    components
                        .iter()
                        .map(|c| ComponentTreeNode {
                            component: c.clone(),
                            children: build_subtree(Some(c.id), children_map),
                        })
                        .collect()
                })
                .unwrap_or_default()
        }

        Ok(build_subtree(None, &children_map))
    }

    /// Recompute a component's status from its tasks.
    pub fn refresh_component_status(&self, component_id: Uuid) -> Result<TaskStatus> {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        let statuses = {
            let mut stmt = tx.prepare("SELECT status FROM tasks WHERE component_id = ?")?;
            let rows = stmt
                .query_map([component_id.to_string()], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.iter()
                .filter_map(|s| TaskStatus::from_str(s))
                .collect::<Vec<_>>()
        };
        let status = TaskStatus::aggregate(&statuses);

        tx.execute(
            "UPDATE components SET status = ?, updated_at = ? WHERE id = ? AND status != ?",
            (
                status.as_str(),
                Utc::now().to_rfc3339(),
                component_id.to_string(),
                status.as_str(),
            ),
        )?;
        tx.commit()?;

        Ok(status)
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
        }
    }
}

const COMPONENT_COLUMNS: &str =
    "id, project_id, parent_id, label, kind, status, position_x, position_y, created_at, updated_at";

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: parse_uuid(row.get::<_, String>(0)?),
        name: row.get(1)?,
        phase: Phase::from_str(&row.get::<_, String>(2)?).unwrap_or(Phase::Interview),
        summary: row.get(3)?,
        created_at: parse_datetime(row.get::<_, String>(4)?),
        updated_at: parse_datetime(row.get::<_, String>(5)?),
    })
}

fn component_from_row(row: &Row<'_>) -> rusqlite::Result<Component> {
    let x: Option<i64> = row.get(6)?;
    let y: Option<i64> = row.get(7)?;
    Ok(Component {
        id: parse_uuid(row.get::<_, String>(0)?),
        project_id: parse_uuid(row.get::<_, String>(1)?),
        parent_id: row.get::<_, Option<String>>(2)?.map(parse_uuid),
        label: row.get(3)?,
        kind: ComponentKind::from_str(&row.get::<_, String>(4)?).unwrap_or(ComponentKind::Node),
        status: TaskStatus::from_str(&row.get::<_, String>(5)?).unwrap_or(TaskStatus::Pending),
        position: x.zip(y).map(|(x, y)| Position { x, y }),
        created_at: parse_datetime(row.get::<_, String>(8)?),
        updated_at: parse_datetime(row.get::<_, String>(9)?),
    })
}

/// Tasks outside a set of components that depend on tasks inside it.
/// `scope_cte` defines `scope_components(id)` and binds the root id as `?1`.
fn external_dependents(tx: &Transaction<'_>, scope_cte: &str, root: Uuid) -> Result<Vec<Uuid>> {
    let sql = format!(
        "{scope_cte}
         SELECT DISTINCT d.task_id
         FROM task_dependencies d
         JOIN tasks src ON src.id = d.depends_on
         JOIN tasks dep ON dep.id = d.task_id
         WHERE src.component_id IN (SELECT id FROM scope_components)
           AND dep.component_id NOT IN (SELECT id FROM scope_components)
         ORDER BY d.task_id"
    );
    let mut stmt = tx.prepare(&sql)?;
    let ids = stmt
        .query_map([root.to_string()], |row| row.get::<_, String>(0))?
        .map(|r| r.map(parse_uuid))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn parse_uuid(s: String) -> Uuid {
    Uuid::parse_str(&s).unwrap_or_else(|_| Uuid::nil())
}

fn parse_datetime(s: String) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
