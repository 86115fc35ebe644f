//! Per-round context for the reasoning service.

use std::fmt::Write as _;

use crate::gateway::ToolGateway;
use crate::models::Task;

/// Instructions sent with every round.
pub const SYSTEM_INSTRUCTIONS: &str = r#"You are a worker completing a single task. Respond with JSON objects tagged by "action", either inline or as {"actions": [...]}:
{"action": "read_file", "path": "..."}
{"action": "write_file", "path": "...", "content": "..."}
{"action": "edit_file", "path": "...", "old": "...", "new": "..."}
{"action": "verify_criterion", "index": N, "evidence": "..."}
{"action": "complete", "summary": "..."}
{"action": "blocked", "reason": "..."}
{"action": "note", "message": "..."}
Only paths inside the task scope are accessible."#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextPayload {
    pub system: String,
    pub prompt: String,
}

/// Where the loop is, for the header of the prompt.
#[derive(Debug, Clone, Copy)]
pub struct RoundInfo {
    pub iteration: u32,
    pub max_iterations: u32,
    pub line_budget: usize,
}

/// Build the payload for one round: the task's description, its unverified
/// criteria, the declared read files (through the gateway, truncated to the
/// line budget) and the results of the previous round's actions.
pub fn assemble(
    task: &Task,
    gateway: &ToolGateway,
    round: RoundInfo,
    feedback: &[String],
) -> ContextPayload {
    let mut prompt = String::new();

    let _ = writeln!(prompt, "# Task: {}", task.title);
    let _ = writeln!(
        prompt,
        "Round {} of {}.",
        round.iteration, round.max_iterations
    );
    if !task.description.trim().is_empty() {
        let _ = writeln!(prompt, "\n{}", task.description.trim());
    }

    if !task.scope.is_empty() {
        let _ = writeln!(prompt, "\n## Scope");
        for root in gateway.roots() {
            let _ = writeln!(prompt, "- {}", root.display());
        }
    }

    let unverified: Vec<_> = task.unverified_criteria().collect();
    if task.acceptance_criteria.is_empty() {
        let _ = writeln!(
            prompt,
            "\n## Completion\nThis task has no acceptance criteria. Send a complete action when done."
        );
    } else if !unverified.is_empty() {
        let _ = writeln!(prompt, "\n## Unverified acceptance criteria");
        for (index, criterion) in unverified {
            let _ = writeln!(prompt, "{}. {}", index, criterion.description);
        }
    }

    for path in &task.read_files {
        let _ = writeln!(prompt, "\n## File: {}", path);
        match gateway.read_truncated(path, round.line_budget) {
            Ok(content) => {
                let _ = writeln!(prompt, "```\n{}\n```", content);
            }
            Err(e) => {
                let _ = writeln!(prompt, "(unavailable: {})", e);
            }
        }
    }

    if !feedback.is_empty() {
        let _ = writeln!(prompt, "\n## Results of your previous actions");
        for line in feedback {
            let _ = writeln!(prompt, "- {}", line);
        }
    }

    ContextPayload {
        system: SYSTEM_INSTRUCTIONS.to_string(),
        prompt,
    }
}
