mod common;

use axum::http::StatusCode;
use axum_test::TestServer;
use common::*;
use foreman::api::{create_router, AppState};
use foreman::lifecycle::Lifecycle;
use foreman::models::*;
use foreman::registry::RunRegistry;
use uuid::Uuid;

struct TestApp {
    server: TestServer,
    lifecycle: Lifecycle,
    registry: RunRegistry,
}

fn setup_with_policy(delete_policy: DeletePolicy) -> TestApp {
    let lifecycle = setup_lifecycle();
    let registry = RunRegistry::new();
    let app = create_router(AppState::new(lifecycle.clone(), registry.clone(), delete_policy));
    TestApp {
        server: TestServer::new(app).expect("Failed to create test server"),
        lifecycle,
        registry,
    }
}

fn setup() -> TestApp {
    setup_with_policy(DeletePolicy::Cascade)
}

async fn create_test_project(server: &TestServer) -> Project {
    server
        .post("/api/v1/projects")
        .json(&CreateProjectInput {
            name: "Test Project".to_string(),
            summary: None,
        })
        .await
        .json::<Project>()
}

async fn create_test_component(server: &TestServer, project_id: Uuid, label: &str) -> Component {
    server
        .post(&format!("/api/v1/projects/{}/components", project_id))
        .json(&CreateComponentInput {
            parent_id: None,
            label: label.to_string(),
            kind: None,
            position: None,
        })
        .await
        .json::<Component>()
}

async fn create_test_task(server: &TestServer, component_id: Uuid, input: CreateTaskInput) -> Task {
    server
        .post(&format!("/api/v1/components/{}/tasks", component_id))
        .json(&input)
        .await
        .json::<Task>()
}

mod health {
    use super::*;

    #[tokio::test]
    async fn reports_ok() {
        let app = setup();
        let response = app.server.get("/api/v1/health").await;

        response.assert_status_ok();
        response.assert_json(&serde_json::json!({ "status": "ok" }));
    }
}

mod projects {
    use super::*;

    #[tokio::test]
    async fn creates_and_lists_projects() {
        let app = setup();

        let response = app
            .server
            .post("/api/v1/projects")
            .json(&CreateProjectInput {
                name: "Rocket".to_string(),
                summary: Some("Launch it".to_string()),
            })
            .await;
        response.assert_status(StatusCode::CREATED);

        let projects: Vec<Project> = app.server.get("/api/v1/projects").await.json();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].name, "Rocket");
    }

    #[tokio::test]
    async fn rejects_an_empty_name() {
        let app = setup();
        let response = app
            .server
            .post("/api/v1/projects")
            .json(&CreateProjectInput {
                name: String::new(),
                summary: None,
            })
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn advances_the_phase() {
        let app = setup();
        let project = create_test_project(&app.server).await;

        let response = app
            .server
            .post(&format!("/api/v1/projects/{}/advance", project.id))
            .await;

        response.assert_status_ok();
        assert_eq!(response.json::<Project>().phase, Phase::Design);
    }

    #[tokio::test]
    async fn advancing_a_missing_project_is_not_found() {
        let app = setup();
        let response = app
            .server
            .post(&format!("/api/v1/projects/{}/advance", Uuid::new_v4()))
            .await;

        response.assert_status_not_found();
    }

    #[tokio::test]
    async fn returns_the_newest_log_entries() {
        let app = setup();
        let project = create_test_project(&app.server).await;
        let component = create_test_component(&app.server, project.id, "Core").await;
        for title in ["One", "Two", "Three"] {
            create_test_task(&app.server, component.id, task_input(title)).await;
        }

        let logs: Vec<LogEntry> = app
            .server
            .get(&format!("/api/v1/projects/{}/logs", project.id))
            .add_query_param("limit", 2)
            .await
            .json();

        assert_eq!(logs.len(), 2);
        assert!(logs[1].message.contains("Three"));
    }
}

mod components {
    use super::*;

    #[tokio::test]
    async fn builds_the_component_tree() {
        let app = setup();
        let project = create_test_project(&app.server).await;
        let parent = create_test_component(&app.server, project.id, "Parent").await;
        app.server
            .post(&format!("/api/v1/projects/{}/components", project.id))
            .json(&CreateComponentInput {
                parent_id: Some(parent.id),
                label: "Child".to_string(),
                kind: None,
                position: None,
            })
            .await
            .assert_status(StatusCode::CREATED);

        let tree: Vec<ComponentTreeNode> = app
            .server
            .get(&format!("/api/v1/projects/{}/components/tree", project.id))
            .await
            .json();

        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].component.label, "Parent");
        assert_eq!(tree[0].children[0].component.label, "Child");
    }

    #[tokio::test]
    async fn deletes_a_component() {
        let app = setup();
        let project = create_test_project(&app.server).await;
        let component = create_test_component(&app.server, project.id, "Doomed").await;

        app.server
            .delete(&format!("/api/v1/components/{}", component.id))
            .await
            .assert_status(StatusCode::NO_CONTENT);
        app.server
            .delete(&format!("/api/v1/components/{}", component.id))
            .await
            .assert_status_not_found();
    }

    #[tokio::test]
    async fn restrict_policy_reports_a_conflict() {
        let app = setup_with_policy(DeletePolicy::Restrict);
        let project = create_test_project(&app.server).await;
        let doomed = create_test_component(&app.server, project.id, "Doomed").await;
        let survivor = create_test_component(&app.server, project.id, "Survivor").await;
        let source = create_test_task(&app.server, doomed.id, task_input("Source")).await;
        create_test_task(
            &app.server,
            survivor.id,
            CreateTaskInput {
                title: "Dependent".to_string(),
                depends_on: vec![source.id],
                ..Default::default()
            },
        )
        .await;

        app.server
            .delete(&format!("/api/v1/components/{}", doomed.id))
            .await
            .assert_status(StatusCode::CONFLICT);
    }
}

mod tasks {
    use super::*;

    #[tokio::test]
    async fn creates_tasks_with_their_initial_status() {
        let app = setup();
        let project = create_test_project(&app.server).await;
        let component = create_test_component(&app.server, project.id, "Core").await;

        let response = app
            .server
            .post(&format!("/api/v1/components/{}/tasks", component.id))
            .json(&task_input("First"))
            .await;
        response.assert_status(StatusCode::CREATED);
        let first = response.json::<Task>();
        assert_eq!(first.status, TaskStatus::Pending);

        let second = create_test_task(
            &app.server,
            component.id,
            CreateTaskInput {
                title: "Second".to_string(),
                depends_on: vec![first.id],
                ..Default::default()
            },
        )
        .await;
        assert_eq!(second.status, TaskStatus::Blocked);

        let listed: Vec<Task> = app
            .server
            .get(&format!("/api/v1/components/{}/tasks", component.id))
            .await
            .json();
        assert_eq!(listed, vec![first, second]);
    }

    #[tokio::test]
    async fn creating_a_task_in_a_missing_component_is_not_found() {
        let app = setup();
        app.server
            .post(&format!("/api/v1/components/{}/tasks", Uuid::new_v4()))
            .json(&task_input("Lost"))
            .await
            .assert_status_not_found();
    }

    #[tokio::test]
    async fn returns_a_task_record() {
        let app = setup();
        let project = create_test_project(&app.server).await;
        let component = create_test_component(&app.server, project.id, "Core").await;
        let task = create_test_task(&app.server, component.id, task_input("Lookup")).await;

        let found: Task = app.server.get(&format!("/api/v1/tasks/{}", task.id)).await.json();
        assert_eq!(found, task);

        app.server
            .get(&format!("/api/v1/tasks/{}", Uuid::new_v4()))
            .await
            .assert_status_not_found();
    }

    #[tokio::test]
    async fn reports_progress_of_an_untracked_task() {
        let app = setup();
        let project = create_test_project(&app.server).await;
        let component = create_test_component(&app.server, project.id, "Core").await;
        let task = create_test_task(
            &app.server,
            component.id,
            CreateTaskInput {
                title: "Measured".to_string(),
                acceptance_criteria: vec!["a".to_string(), "b".to_string()],
                ..Default::default()
            },
        )
        .await;

        let progress: ProgressSnapshot = app
            .server
            .get(&format!("/api/v1/tasks/{}/progress", task.id))
            .await
            .json();

        assert_eq!(progress.task_id, task.id);
        assert_eq!(progress.criteria_total, 2);
        assert_eq!(progress.progress_percent, 0);
        assert_eq!(progress.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn lists_execution_events() {
        let app = setup();
        let project = create_test_project(&app.server).await;
        let component = create_test_component(&app.server, project.id, "Core").await;
        let task = create_test_task(&app.server, component.id, task_input("Eventful")).await;
        app.lifecycle.claim(task.id, "w1").unwrap();

        let events: Vec<LogEntry> = app
            .server
            .get(&format!("/api/v1/tasks/{}/events", task.id))
            .await
            .json();

        let kinds: Vec<EventKind> = events.iter().map(|e| e.action).collect();
        assert_eq!(
            kinds,
            vec![EventKind::Created, EventKind::Claimed, EventKind::Transition]
        );
    }

    #[tokio::test]
    async fn retries_failed_tasks_only() {
        let app = setup();
        let project = create_test_project(&app.server).await;
        let component = create_test_component(&app.server, project.id, "Core").await;
        let task = create_test_task(&app.server, component.id, task_input("Flaky")).await;

        app.server
            .post(&format!("/api/v1/tasks/{}/retry", task.id))
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        app.lifecycle.claim(task.id, "w1").unwrap();
        app.lifecycle
            .fail(task.id, Some("w1"), FailureReason::Cancelled)
            .unwrap();

        let response = app
            .server
            .post(&format!("/api/v1/tasks/{}/retry", task.id))
            .await;
        response.assert_status_ok();
        assert_eq!(response.json::<Task>().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn cancels_a_running_task() {
        let app = setup();
        let project = create_test_project(&app.server).await;
        let component = create_test_component(&app.server, project.id, "Core").await;
        let task = create_test_task(&app.server, component.id, task_input("Long")).await;

        app.server
            .post(&format!("/api/v1/tasks/{}/cancel", task.id))
            .await
            .assert_status(StatusCode::CONFLICT);

        let guard = app.registry.register(task.id, "w1").unwrap();
        let response = app
            .server
            .post(&format!("/api/v1/tasks/{}/cancel", task.id))
            .await;

        response.assert_status(StatusCode::ACCEPTED);
        let run: serde_json::Value = response.json();
        assert_eq!(run["worker_id"], "w1");
        assert_eq!(run["cancelled"], true);
        assert!(guard.token().is_cancelled());
    }
}

mod progress {
    use super::*;

    #[tokio::test]
    async fn lists_tracked_tasks() {
        let app = setup();
        let project = create_test_project(&app.server).await;
        let component = create_test_component(&app.server, project.id, "Core").await;
        let task = create_test_task(&app.server, component.id, task_input("Tracked")).await;

        let empty: Vec<ProgressSnapshot> = app.server.get("/api/v1/progress").await.json();
        assert!(empty.is_empty());

        app.lifecycle.claim(task.id, "w1").unwrap();
        let tracked: Vec<ProgressSnapshot> = app.server.get("/api/v1/progress").await.json();
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn drops_tasks_once_they_finish() {
        let app = setup();
        let project = create_test_project(&app.server).await;
        let component = create_test_component(&app.server, project.id, "Core").await;
        let task = create_test_task(&app.server, component.id, task_input("Short")).await;
        app.lifecycle.claim(task.id, "w1").unwrap();
        app.lifecycle
            .fail(task.id, Some("w1"), FailureReason::Cancelled)
            .unwrap();

        let tracked: Vec<ProgressSnapshot> = app.server.get("/api/v1/progress").await.json();
        assert!(tracked.is_empty());

        let progress: ProgressSnapshot = app
            .server
            .get(&format!("/api/v1/tasks/{}/progress", task.id))
            .await
            .json();
        assert_eq!(progress.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn lists_active_runs() {
        let app = setup();
        let project = create_test_project(&app.server).await;
        let component = create_test_component(&app.server, project.id, "Core").await;
        let task = create_test_task(&app.server, component.id, task_input("Running")).await;

        let none: Vec<serde_json::Value> = app.server.get("/api/v1/runs").await.json();
        assert!(none.is_empty());

        let _guard = app.registry.register(task.id, "w1").unwrap();
        let runs: Vec<serde_json::Value> = app.server.get("/api/v1/runs").await.json();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0]["task_id"], task.id.to_string());
        assert_eq!(runs[0]["worker_id"], "w1");
    }
}
