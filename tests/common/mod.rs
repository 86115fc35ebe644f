#![allow(dead_code)]

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use foreman::config::TrackerConfig;
use foreman::db::Database;
use foreman::error::ServiceError;
use foreman::executor::Executor;
use foreman::lifecycle::Lifecycle;
use foreman::models::*;
use foreman::progress::ProgressTracker;

/// Executor double that replays canned responses in order and records every
/// prompt it was sent. Once the script runs out it answers with a note.
#[derive(Default)]
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Result<String, ServiceError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(responses.into_iter().map(|r| Ok(r.into())).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn push_ok(&self, response: impl Into<String>) {
        self.script.lock().push_back(Ok(response.into()));
    }

    pub fn push_err(&self, error: ServiceError) {
        self.script.lock().push_back(Err(error));
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().len()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn invoke(&self, prompt: &str, _system: &str) -> Result<String, ServiceError> {
        self.prompts.lock().push(prompt.to_string());
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(r#"{"action": "note", "message": "nothing to do"}"#.to_string()))
    }
}

pub fn setup_db() -> Database {
    let db = Database::open_memory().expect("Failed to create in-memory database");
    db.migrate().expect("Failed to run migrations");
    db
}

pub fn setup_lifecycle() -> Lifecycle {
    let db = setup_db();
    let tracker = ProgressTracker::new(db.clone(), TrackerConfig::default());
    Lifecycle::new(db, tracker)
}

/// Lifecycle over a database file, so several handles can share it.
pub fn setup_lifecycle_at(path: &std::path::Path) -> Lifecycle {
    let db = Database::open(path.to_path_buf()).expect("Failed to open database");
    db.migrate().expect("Failed to run migrations");
    let tracker = ProgressTracker::new(db.clone(), TrackerConfig::default());
    Lifecycle::new(db, tracker)
}

pub fn create_project(db: &Database, name: &str) -> Project {
    db.create_project(CreateProjectInput {
        name: name.to_string(),
        summary: None,
    })
    .expect("Failed to create project")
}

pub fn create_component(db: &Database, project_id: Uuid, label: &str) -> Component {
    db.create_component(
        project_id,
        CreateComponentInput {
            parent_id: None,
            label: label.to_string(),
            kind: None,
            position: None,
        },
    )
    .expect("Failed to create component")
}

/// Project plus one component, ready for tasks.
pub fn create_workspace(db: &Database) -> Component {
    let project = create_project(db, "Test Project");
    create_component(db, project.id, "Backend")
}

pub fn task_input(title: &str) -> CreateTaskInput {
    CreateTaskInput {
        title: title.to_string(),
        ..Default::default()
    }
}

pub fn create_task(
    lifecycle: &Lifecycle,
    component_id: Uuid,
    title: &str,
    criteria: &[&str],
    depends_on: Vec<Uuid>,
) -> Task {
    lifecycle
        .create_task(
            component_id,
            CreateTaskInput {
                title: title.to_string(),
                acceptance_criteria: criteria.iter().map(|c| c.to_string()).collect(),
                depends_on,
                ..Default::default()
            },
        )
        .expect("Failed to create task")
}

pub fn events_of(lifecycle: &Lifecycle, task_id: Uuid, kind: EventKind) -> Vec<LogEntry> {
    lifecycle
        .db()
        .get_logs_by_task(task_id)
        .expect("Failed to read logs")
        .into_iter()
        .filter(|e| e.action == kind)
        .collect()
}
