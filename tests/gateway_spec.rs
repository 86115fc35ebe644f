mod common;

use std::fs;
use std::path::PathBuf;

use common::*;
use foreman::error::Error;
use foreman::gateway::ToolGateway;
use foreman::models::*;
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    lifecycle: foreman::lifecycle::Lifecycle,
    task: Task,
    gateway: ToolGateway,
}

fn setup() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let scope = dir.path().join("work");
    fs::create_dir_all(&scope).unwrap();

    let lifecycle = setup_lifecycle();
    let component = create_workspace(lifecycle.db());
    let task = lifecycle
        .create_task(
            component.id,
            CreateTaskInput {
                title: "Scoped".to_string(),
                scope: vec![scope.to_string_lossy().into_owned()],
                ..Default::default()
            },
        )
        .unwrap();
    let gateway = ToolGateway::for_task(&task, "w1", lifecycle.tracker().clone());

    Fixture {
        dir,
        lifecycle,
        task,
        gateway,
    }
}

fn tool_events(f: &Fixture) -> Vec<LogEntry> {
    events_of(&f.lifecycle, f.task.id, EventKind::ToolAction)
}

mod inside_scope {
    use super::*;

    #[test]
    fn writes_then_reads_back() {
        let f = setup();

        let bytes = f.gateway.write("pkg/lib.rs", "pub fn answer() -> u32 { 42 }\n").unwrap();
        assert_eq!(bytes, 30);
        assert_eq!(
            f.gateway.read("pkg/lib.rs").unwrap(),
            "pub fn answer() -> u32 { 42 }\n"
        );
        assert!(f.dir.path().join("work/pkg/lib.rs").exists());
    }

    #[test]
    fn edits_every_occurrence() {
        let f = setup();
        f.gateway.write("a.txt", "foo bar foo").unwrap();

        assert_eq!(f.gateway.edit("a.txt", "foo", "baz").unwrap(), 2);
        assert_eq!(f.gateway.read("a.txt").unwrap(), "baz bar baz");
        assert!(matches!(
            f.gateway.edit("a.txt", "missing", "x"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn accepts_absolute_paths_under_a_root() {
        let f = setup();
        let absolute = f.dir.path().join("work/abs.txt");

        f.gateway.write(&absolute.to_string_lossy(), "ok").unwrap();
        assert_eq!(fs::read_to_string(absolute).unwrap(), "ok");
    }

    #[test]
    fn logs_every_call() {
        let f = setup();
        f.gateway.write("a.txt", "x").unwrap();
        f.gateway.read("a.txt").unwrap();
        let _ = f.gateway.read("missing.txt");

        let events = tool_events(&f);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].worker_id.as_deref(), Some("w1"));
        assert_eq!(events[2].level, Severity::Warn);
    }
}

mod outside_scope {
    use super::*;

    #[test]
    fn rejects_parent_traversal() {
        let f = setup();
        fs::write(f.dir.path().join("secret.txt"), "hidden").unwrap();

        assert!(matches!(
            f.gateway.read("../secret.txt"),
            Err(Error::ScopeViolation { .. })
        ));
        assert!(matches!(
            f.gateway.write("nested/../../escape.txt", "x"),
            Err(Error::ScopeViolation { .. })
        ));
        assert!(!f.dir.path().join("escape.txt").exists());
    }

    #[test]
    fn rejects_sibling_prefixes() {
        let f = setup();
        let sibling = f.dir.path().join("work-other/file.txt");

        assert!(matches!(
            f.gateway.write(&sibling.to_string_lossy(), "x"),
            Err(Error::ScopeViolation { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlinks_pointing_out() {
        let f = setup();
        let outside = f.dir.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("data.txt"), "outside").unwrap();
        std::os::unix::fs::symlink(&outside, f.dir.path().join("work/link")).unwrap();

        assert!(matches!(
            f.gateway.read("link/data.txt"),
            Err(Error::ScopeViolation { .. })
        ));
    }

    #[test]
    fn rejects_everything_without_roots() {
        let f = setup();
        let gateway = ToolGateway::new(f.task.id, "w1", Vec::<PathBuf>::new(), f.lifecycle.tracker().clone());

        assert!(matches!(gateway.read("a.txt"), Err(Error::ScopeViolation { .. })));
    }

    #[test]
    fn marks_violations_in_the_audit_log() {
        let f = setup();
        let _ = f.gateway.read("/etc/hostname");

        let events = tool_events(&f);
        assert_eq!(events.len(), 1);
        let payload = events[0].payload.as_ref().unwrap();
        assert_eq!(payload["scope_violation"], serde_json::json!(true));
        assert_eq!(payload["op"], serde_json::json!("read"));
    }
}
