mod handlers;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::db::Database;
use crate::lifecycle::Lifecycle;
use crate::models::DeletePolicy;
use crate::progress::ProgressTracker;
use crate::registry::RunRegistry;

/// Shared handles for the observer API.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Lifecycle,
    pub registry: RunRegistry,
    pub delete_policy: DeletePolicy,
}

impl AppState {
    pub fn new(lifecycle: Lifecycle, registry: RunRegistry, delete_policy: DeletePolicy) -> Self {
        Self {
            lifecycle,
            registry,
            delete_policy,
        }
    }

    fn db(&self) -> &Database {
        self.lifecycle.db()
    }

    fn tracker(&self) -> &ProgressTracker {
        self.lifecycle.tracker()
    }
}

pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        // Projects
        .route("/projects", get(handlers::list_projects))
        .route("/projects", post(handlers::create_project))
        .route("/projects/{id}/advance", post(handlers::advance_phase))
        .route("/projects/{id}/components", post(handlers::create_component))
        .route("/projects/{id}/components/tree", get(handlers::get_component_tree))
        .route("/projects/{id}/logs", get(handlers::list_project_logs))
        // Components
        .route("/components/{id}", delete(handlers::delete_component))
        .route("/components/{id}/tasks", get(handlers::list_component_tasks))
        .route("/components/{id}/tasks", post(handlers::create_task))
        // Tasks
        .route("/tasks/{id}", get(handlers::get_task))
        .route("/tasks/{id}/progress", get(handlers::get_task_progress))
        .route("/tasks/{id}/events", get(handlers::list_task_events))
        .route("/tasks/{id}/retry", post(handlers::retry_task))
        .route("/tasks/{id}/cancel", post(handlers::cancel_task))
        // Live progress
        .route("/progress", get(handlers::list_progress))
        .route("/runs", get(handlers::list_runs))
        // Health
        .route("/health", get(handlers::health));

    Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
