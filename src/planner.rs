//! Manager-level planning: breaking components down into tasks.
//!
//! [`Planner::plan_component`] plans one component. [`Planner::plan_project`]
//! walks a project's forest parents-first, skipping root-kind components and
//! components that already have tasks, and records the resulting execution
//! order in the audit log.

use std::path::PathBuf;

use serde::Deserialize;
use uuid::Uuid;

use crate::action;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::lifecycle::Lifecycle;
use crate::models::*;

const PLANNER_INSTRUCTIONS: &str = "You are a technical lead breaking a component into small, \
independently verifiable tasks. Respond with a single JSON object: \
{\"tasks\": [{\"title\": \"...\", \"description\": \"...\", \"priority\": 0, \
\"acceptance_criteria\": [\"...\"], \"depends_on\": [0], \"read_files\": [], \"scope\": []}]}. \
depends_on lists indexes of earlier tasks in the same array.";

#[derive(Debug, Clone, Deserialize)]
struct Plan {
    tasks: Vec<PlannedTask>,
}

#[derive(Debug, Clone, Deserialize)]
struct PlannedTask {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default)]
    acceptance_criteria: Vec<String>,
    #[serde(default)]
    depends_on: Vec<usize>,
    #[serde(default)]
    read_files: Vec<String>,
    #[serde(default)]
    scope: Vec<String>,
}

/// Tasks created for one component.
#[derive(Debug, Clone)]
pub struct ComponentPlan {
    pub component_id: Uuid,
    pub label: String,
    pub tasks: Vec<Task>,
}

/// Outcome of planning a whole project. `components` is in execution order.
#[derive(Debug, Clone, Default)]
pub struct ProjectPlan {
    pub components: Vec<ComponentPlan>,
    /// Components left alone because they already had tasks.
    pub skipped: Vec<Uuid>,
}

impl ProjectPlan {
    pub fn task_count(&self) -> usize {
        self.components.iter().map(|c| c.tasks.len()).sum()
    }
}

pub struct Planner<E> {
    lifecycle: Lifecycle,
    executor: E,
    workspace_root: PathBuf,
}

impl<E: Executor> Planner<E> {
    pub fn new(lifecycle: Lifecycle, executor: E, workspace_root: PathBuf) -> Self {
        Self {
            lifecycle,
            executor,
            workspace_root,
        }
    }

    /// Ask the reasoning service for a task breakdown of `component_id` and
    /// create the tasks. The whole plan is validated before anything is
    /// created.
    pub async fn plan_component(&self, component_id: Uuid) -> Result<Vec<Task>> {
        let db = self.lifecycle.db();
        let component = db
            .get_component(component_id)?
            .ok_or_else(|| Error::not_found("Component", component_id))?;
        let project = db
            .get_project(component.project_id)?
            .ok_or_else(|| Error::not_found("Project", component.project_id))?;
        let existing = db.get_tasks_by_component(component_id)?;

        let mut prompt = format!(
            "Project: {}\n{}\n\nComponent: {} ({})\n",
            project.name,
            project.summary.as_deref().unwrap_or_default(),
            component.label,
            component.kind.as_str()
        );
        if !existing.is_empty() {
            prompt.push_str("\nExisting tasks:\n");
            for task in &existing {
                prompt.push_str(&format!("- {} [{}]\n", task.title, task.status));
            }
        }

        self.lifecycle.tracker().record_event(
            NewLogEntry::new(
                EventKind::Planning,
                format!("Planning component '{}'", component.label),
            )
            .project(project.id)
            .component(component.id),
        )?;

        let response = self.executor.invoke(&prompt, PLANNER_INSTRUCTIONS).await?;
        let plan = decode_plan(&response)?;
        validate(&plan)?;

        let default_scope = self
            .workspace_root
            .join(slug(&component.label))
            .to_string_lossy()
            .into_owned();

        let mut created: Vec<Task> = Vec::with_capacity(plan.tasks.len());
        for planned in plan.tasks {
            let depends_on = planned.depends_on.iter().map(|i| created[*i].id).collect();
            let scope = if planned.scope.is_empty() {
                vec![default_scope.clone()]
            } else {
                planned.scope
            };

            let task = self.lifecycle.create_task(
                component_id,
                CreateTaskInput {
                    title: planned.title,
                    description: planned.description,
                    priority: planned.priority,
                    depends_on,
                    acceptance_criteria: planned.acceptance_criteria,
                    read_files: planned.read_files,
                    scope,
                    max_iterations: None,
                },
            )?;
            created.push(task);
        }

        self.lifecycle.tracker().record_event(
            NewLogEntry::new(
                EventKind::Planning,
                format!("Planned {} tasks for '{}'", created.len(), component.label),
            )
            .project(project.id)
            .component(component.id),
        )?;
        tracing::info!(component_id = %component_id, tasks = created.len(), "Component planned");
        Ok(created)
    }

    /// Plan every plannable component of `project_id`, parents before
    /// children. A rejected component plan stops the walk; components planned
    /// before it keep their tasks.
    pub async fn plan_project(&self, project_id: Uuid) -> Result<ProjectPlan> {
        let db = self.lifecycle.db();
        let project = db
            .get_project(project_id)?
            .ok_or_else(|| Error::not_found("Project", project_id))?;

        let mut order = Vec::new();
        flatten(db.get_component_tree(project_id)?, &mut order);
        let plannable: Vec<Component> = order
            .into_iter()
            .filter(|c| c.kind != ComponentKind::Root)
            .collect();

        self.lifecycle.tracker().record_event(
            NewLogEntry::new(
                EventKind::Planning,
                format!(
                    "Planning project '{}': {} components",
                    project.name,
                    plannable.len()
                ),
            )
            .project(project_id),
        )?;

        let mut plan = ProjectPlan::default();
        for component in plannable {
            if !db.get_tasks_by_component(component.id)?.is_empty() {
                tracing::debug!(component_id = %component.id, "Component already has tasks, skipping");
                plan.skipped.push(component.id);
                continue;
            }
            let tasks = self.plan_component(component.id).await?;
            plan.components.push(ComponentPlan {
                component_id: component.id,
                label: component.label,
                tasks,
            });
        }

        let execution_order: Vec<_> = plan
            .components
            .iter()
            .enumerate()
            .map(|(i, c)| {
                serde_json::json!({
                    "phase": i + 1,
                    "component_id": c.component_id,
                    "label": c.label,
                    "tasks": c.tasks.len(),
                })
            })
            .collect();
        self.lifecycle.tracker().record_event(
            NewLogEntry::new(
                EventKind::Planning,
                format!(
                    "Planned {} tasks across {} components of '{}'",
                    plan.task_count(),
                    plan.components.len(),
                    project.name
                ),
            )
            .project(project_id)
            .payload(serde_json::json!({
                "execution_order": execution_order,
                "skipped": plan.skipped,
            })),
        )?;
        tracing::info!(project_id = %project_id, components = plan.components.len(), "Project planned");
        Ok(plan)
    }
}

/// Pre-order walk: every component comes before its children.
fn flatten(nodes: Vec<ComponentTreeNode>, out: &mut Vec<Component>) {
    for node in nodes {
        out.push(node.component);
        flatten(node.children, out);
    }
}

/// First fragment of the response that decodes as a plan.
fn decode_plan(response: &str) -> Result<Plan> {
    action::scan(response)
        .into_iter()
        .find_map(|fragment| serde_json::from_str::<Plan>(fragment).ok())
        .ok_or_else(|| Error::validation("Planner response contained no task plan"))
}

fn validate(plan: &Plan) -> Result<()> {
    if plan.tasks.is_empty() {
        return Err(Error::validation("Plan contains no tasks"));
    }
    for (index, task) in plan.tasks.iter().enumerate() {
        if task.title.trim().is_empty() {
            return Err(Error::validation(format!("Planned task {} has no title", index)));
        }
        if let Some(dep) = task.depends_on.iter().find(|dep| **dep >= index) {
            return Err(Error::validation(format!(
                "Planned task {} depends on {}, which is not an earlier task",
                index, dep
            )));
        }
    }
    Ok(())
}

/// Directory name for a component label.
pub fn slug(label: &str) -> String {
    label.trim().to_lowercase().replace(' ', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_matches_directory_naming() {
        assert_eq!(slug("Auth Service"), "auth_service");
        assert_eq!(slug("  API  "), "api");
    }

    #[test]
    fn decodes_first_plan_shaped_fragment() {
        let response = r#"Here is my plan. {"note": "ignore me"}
{"tasks": [{"title": "Schema"}, {"title": "Queries", "depends_on": [0]}]}"#;
        let plan = decode_plan(response).unwrap();
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[1].depends_on, vec![0]);
        assert!(validate(&plan).is_ok());
    }

    #[test]
    fn rejects_forward_dependencies() {
        let plan = decode_plan(r#"{"tasks": [{"title": "a", "depends_on": [1]}, {"title": "b"}]}"#)
            .unwrap();
        assert!(matches!(validate(&plan), Err(Error::Validation(_))));
    }

    #[test]
    fn prose_without_a_plan_is_rejected() {
        assert!(matches!(decode_plan("I could not do it"), Err(Error::Validation(_))));
    }
}
