mod common;

use std::path::Path;
use std::sync::Arc;

use common::*;
use foreman::db::Database;
use foreman::error::Error;
use foreman::lifecycle::Lifecycle;
use foreman::models::*;
use foreman::planner::Planner;
use uuid::Uuid;

fn planner(lifecycle: &Lifecycle, executor: &Arc<ScriptedExecutor>, root: &Path) -> Planner<Arc<ScriptedExecutor>> {
    Planner::new(lifecycle.clone(), executor.clone(), root.to_path_buf())
}

fn component(db: &Database, project_id: Uuid, parent_id: Option<Uuid>, label: &str, kind: ComponentKind) -> Component {
    db.create_component(
        project_id,
        CreateComponentInput {
            parent_id,
            label: label.to_string(),
            kind: Some(kind),
            position: None,
        },
    )
    .expect("Failed to create component")
}

fn single_task_plan(title: &str) -> String {
    format!(r#"Plan: {{"tasks": [{{"title": "{}", "acceptance_criteria": ["works"]}}]}}"#, title)
}

mod plan_component {
    use super::*;

    #[tokio::test]
    async fn creates_tasks_with_dependencies_and_a_default_scope() {
        let lifecycle = setup_lifecycle();
        let component = create_workspace(lifecycle.db());
        let root = tempfile::tempdir().unwrap();
        let executor = Arc::new(ScriptedExecutor::new([r#"Here you go:
{"tasks": [
    {"title": "Schema", "priority": 0, "acceptance_criteria": ["migrations run"]},
    {"title": "Queries", "priority": 1, "depends_on": [0], "scope": ["/srv/queries"]}
]}"#]));

        let tasks = planner(&lifecycle, &executor, root.path())
            .plan_component(component.id)
            .await
            .unwrap();

        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        assert_eq!(
            tasks[0].scope,
            vec![root.path().join("backend").to_string_lossy().into_owned()]
        );
        assert_eq!(tasks[1].status, TaskStatus::Blocked);
        assert_eq!(tasks[1].dependencies[0].task_id, tasks[0].id);
        assert_eq!(tasks[1].scope, vec!["/srv/queries".to_string()]);
        assert!(executor.prompts()[0].contains("Component: Backend"));
    }

    #[tokio::test]
    async fn creates_nothing_from_an_unusable_plan() {
        let lifecycle = setup_lifecycle();
        let component = create_workspace(lifecycle.db());
        let root = tempfile::tempdir().unwrap();
        let executor = Arc::new(ScriptedExecutor::new([
            r#"{"tasks": [{"title": "a", "depends_on": [1]}, {"title": "b"}]}"#,
        ]));

        let result = planner(&lifecycle, &executor, root.path())
            .plan_component(component.id)
            .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(lifecycle.db().get_tasks_by_component(component.id).unwrap().is_empty());
    }
}

mod plan_project {
    use super::*;

    #[tokio::test]
    async fn plans_non_root_components_parents_first() {
        let lifecycle = setup_lifecycle();
        let db = lifecycle.db().clone();
        let project = create_project(&db, "Shop");
        let app = component(&db, project.id, None, "App", ComponentKind::Root);
        let backend = component(&db, project.id, Some(app.id), "Backend", ComponentKind::Node);
        let frontend = component(&db, project.id, Some(app.id), "Frontend", ComponentKind::Node);
        let api = component(&db, project.id, Some(backend.id), "Api", ComponentKind::Node);
        let root = tempfile::tempdir().unwrap();
        let executor = Arc::new(ScriptedExecutor::new([
            single_task_plan("Build backend"),
            single_task_plan("Build api"),
            single_task_plan("Build frontend"),
        ]));

        let plan = planner(&lifecycle, &executor, root.path())
            .plan_project(project.id)
            .await
            .unwrap();

        let order: Vec<Uuid> = plan.components.iter().map(|c| c.component_id).collect();
        assert_eq!(order, vec![backend.id, api.id, frontend.id]);
        assert_eq!(plan.task_count(), 3);
        assert!(plan.skipped.is_empty());
        assert!(db.get_tasks_by_component(app.id).unwrap().is_empty());
        assert_eq!(db.get_tasks_by_component(api.id).unwrap()[0].title, "Build api");

        let prompts = executor.prompts();
        assert_eq!(prompts.len(), 3);
        assert!(prompts[1].contains("Component: Api"));

        let planning: Vec<LogEntry> = db
            .get_logs_by_project(project.id, 100)
            .unwrap()
            .into_iter()
            .filter(|e| e.action == EventKind::Planning)
            .collect();
        let summary = planning.last().unwrap();
        assert!(summary.component_id.is_none());
        let execution_order = &summary.payload.as_ref().unwrap()["execution_order"];
        assert_eq!(execution_order[0]["label"], "Backend");
        assert_eq!(execution_order[2]["phase"], 3);
    }

    #[tokio::test]
    async fn skips_components_that_already_have_tasks() {
        let lifecycle = setup_lifecycle();
        let db = lifecycle.db().clone();
        let project = create_project(&db, "Shop");
        let done = create_component(&db, project.id, "Done");
        let fresh = create_component(&db, project.id, "Fresh");
        create_task(&lifecycle, done.id, "Existing", &[], vec![]);
        let root = tempfile::tempdir().unwrap();
        let executor = Arc::new(ScriptedExecutor::new([single_task_plan("New work")]));

        let plan = planner(&lifecycle, &executor, root.path())
            .plan_project(project.id)
            .await
            .unwrap();

        assert_eq!(plan.skipped, vec![done.id]);
        assert_eq!(plan.components.len(), 1);
        assert_eq!(plan.components[0].component_id, fresh.id);
        assert_eq!(executor.calls(), 1);
        assert_eq!(db.get_tasks_by_component(done.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_project_is_not_found() {
        let lifecycle = setup_lifecycle();
        let root = tempfile::tempdir().unwrap();
        let executor = Arc::new(ScriptedExecutor::default());

        let result = planner(&lifecycle, &executor, root.path())
            .plan_project(Uuid::new_v4())
            .await;

        assert!(matches!(result, Err(Error::NotFound { .. })));
        assert_eq!(executor.calls(), 0);
    }
}
