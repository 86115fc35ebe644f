//! Scoped filesystem access for a single task.
//!
//! A [`ToolGateway`] is bound to one task's allow-list of roots. Every call
//! resolves its path to an absolute, symlink-free form and rejects it unless
//! it lies under one of the roots. The check runs on every call; nothing is
//! cached. Every attempt, successful or not, is logged as a `tool_action`
//! event through the progress tracker.

use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{EventKind, NewLogEntry, Severity, Task};
use crate::progress::ProgressTracker;

pub struct ToolGateway {
    task_id: Uuid,
    worker_id: String,
    roots: Vec<PathBuf>,
    tracker: ProgressTracker,
}

impl ToolGateway {
    /// Relative roots are taken relative to the current directory.
    pub fn new(
        task_id: Uuid,
        worker_id: impl Into<String>,
        roots: Vec<PathBuf>,
        tracker: ProgressTracker,
    ) -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        let roots = roots
            .into_iter()
            .map(|root| if root.is_absolute() { root } else { cwd.join(root) })
            .map(|root| normalize(&root))
            .collect();

        Self {
            task_id,
            worker_id: worker_id.into(),
            roots,
            tracker,
        }
    }

    /// Gateway over the task's declared scope.
    pub fn for_task(task: &Task, worker_id: impl Into<String>, tracker: ProgressTracker) -> Self {
        Self::new(
            task.id,
            worker_id,
            task.scope.iter().map(PathBuf::from).collect(),
            tracker,
        )
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Resolve `path` and check it against the allow-list. Relative paths are
    /// resolved against the first root.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.trim().is_empty() {
            return Err(Error::validation("Path must not be empty"));
        }
        let Some(first_root) = self.roots.first() else {
            return Err(Error::ScopeViolation {
                path: PathBuf::from(path),
            });
        };

        let raw = PathBuf::from(path);
        let absolute = normalize(&if raw.is_absolute() {
            raw
        } else {
            first_root.join(raw)
        });
        let resolved = canonicalize_existing(&absolute);

        for root in &self.roots {
            if resolved.starts_with(canonicalize_existing(root)) {
                return Ok(resolved);
            }
        }
        Err(Error::ScopeViolation { path: absolute })
    }

    pub fn read(&self, path: &str) -> Result<String> {
        let result = self
            .resolve(path)
            .and_then(|resolved| fs::read_to_string(&resolved).map_err(Error::from));
        self.log("read", path, result.as_ref().map(|c| format!("{} bytes", c.len())));
        result
    }

    /// Read a file keeping at most `max_lines` of its first lines; a notice
    /// is appended when lines were dropped.
    pub fn read_truncated(&self, path: &str, max_lines: usize) -> Result<String> {
        let content = self.read(path)?;
        Ok(truncate_lines(&content, max_lines))
    }

    /// Write `content`, creating missing parent directories.
    pub fn write(&self, path: &str, content: &str) -> Result<usize> {
        let result = self.resolve(path).and_then(|resolved| {
            if let Some(parent) = resolved.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&resolved, content)?;
            Ok(content.len())
        });
        self.log("write", path, result.as_ref().map(|n| format!("{} bytes", n)));
        result
    }

    /// Replace every occurrence of `old` with `new` and return how many were
    /// replaced. Fails with `NotFound` if `old` does not occur.
    pub fn edit(&self, path: &str, old: &str, new: &str) -> Result<usize> {
        let result = self.resolve(path).and_then(|resolved| {
            if old.is_empty() {
                return Err(Error::validation("Text to replace must not be empty"));
            }
            let content = fs::read_to_string(&resolved)?;
            let count = content.matches(old).count();
            if count == 0 {
                return Err(Error::not_found("Text", format!("{:?} in {}", old, path)));
            }
            fs::write(&resolved, content.replace(old, new))?;
            Ok(count)
        });
        self.log("edit", path, result.as_ref().map(|n| format!("{} replacements", n)));
        result
    }

    fn log(&self, op: &str, path: &str, outcome: std::result::Result<String, &Error>) {
        let entry = match outcome {
            Ok(detail) => NewLogEntry::for_task(
                self.task_id,
                EventKind::ToolAction,
                format!("{} {}: {}", op, path, detail),
            )
            .payload(serde_json::json!({ "op": op, "path": path, "ok": true })),
            Err(e) => NewLogEntry::for_task(
                self.task_id,
                EventKind::ToolAction,
                format!("{} {} failed: {}", op, path, e),
            )
            .level(Severity::Warn)
            .payload(serde_json::json!({
                "op": op,
                "path": path,
                "ok": false,
                "error": e.to_string(),
                "scope_violation": matches!(e, Error::ScopeViolation { .. }),
            })),
        };

        if let Err(e) = self.tracker.record_event(entry.worker(self.worker_id.as_str())) {
            tracing::error!(task_id = %self.task_id, "Failed to log tool action: {}", e);
        }
    }
}

/// Keep the first `max_lines` lines of `content`.
pub fn truncate_lines(content: &str, max_lines: usize) -> String {
    let total = content.lines().count();
    if total <= max_lines {
        return content.to_string();
    }
    let mut kept: Vec<&str> = content.lines().take(max_lines).collect();
    let notice = format!("[... truncated: {} of {} lines omitted]", total - max_lines, total);
    kept.push(&notice);
    kept.join("\n")
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize the longest existing ancestor of `path` and re-append the
/// rest, so symlinks are resolved even for files that do not exist yet.
fn canonicalize_existing(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut rest: Vec<OsString> = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut out = canonical;
            for part in rest.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_dot_segments() {
        assert_eq!(
            normalize(Path::new("/work/a/./b/../c")),
            PathBuf::from("/work/a/c")
        );
        assert_eq!(normalize(Path::new("/work/../../etc")), PathBuf::from("/etc"));
    }

    #[test]
    fn truncation_keeps_leading_lines() {
        let text = "1\n2\n3\n4\n5";
        assert_eq!(truncate_lines(text, 10), text);

        let cut = truncate_lines(text, 2);
        assert!(cut.starts_with("1\n2\n"));
        assert!(cut.ends_with("[... truncated: 3 of 5 lines omitted]"));
    }

    #[test]
    fn canonicalize_handles_missing_tails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("a/b/c.txt");
        let resolved = canonicalize_existing(&missing);
        assert!(resolved.starts_with(dir.path().canonicalize().unwrap()));
        assert!(resolved.ends_with("a/b/c.txt"));
    }
}
