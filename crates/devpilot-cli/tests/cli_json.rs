use assert_cmd::Command;
use devpilot_core::{AgentKind, EventKind, ObserveConfig, Session};
use devpilot_observe::Observer;
use devpilot_store::SessionStore;
use serde_json::{Value, json};
use std::path::Path;
use tempfile::TempDir;

fn devpilot(workspace: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("devpilot"));
    cmd.current_dir(workspace)
        .env("HOME", workspace)
        .env_remove("USERPROFILE");
    cmd
}

fn run_json(workspace: &Path, args: &[&str]) -> Value {
    let output = devpilot(workspace)
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("json output")
}

fn seed_session(workspace: &Path, kind: AgentKind) -> String {
    let store = SessionStore::new(workspace).expect("store");
    let mut session = Session::new(kind, json!({"topic": "seeded"}), 10);
    session.set_status("iteration_exceeded");
    store.save(&mut session).expect("save");
    session.id
}

#[test]
fn sessions_list_is_empty_in_fresh_workspace() {
    let workspace = TempDir::new().expect("workspace");
    let out = run_json(workspace.path(), &["--json", "sessions", "list"]);
    assert_eq!(out, json!([]));
}

#[test]
fn first_run_writes_default_project_settings() {
    let workspace = TempDir::new().expect("workspace");
    run_json(workspace.path(), &["--json", "sessions", "list"]);

    let path = workspace.path().join(".devpilot/settings.json");
    let settings: Value =
        serde_json::from_slice(&std::fs::read(&path).expect("settings written")).expect("json");
    assert_eq!(settings["agent_loop"]["max_iterations"], 25);
    assert_eq!(settings["sessions"]["max_keep"], 50);
}

#[test]
fn sessions_show_text_includes_recorded_activity() {
    let workspace = TempDir::new().expect("workspace");
    let id = seed_session(workspace.path(), AgentKind::Debug);
    let observer = Observer::new(workspace.path(), &ObserveConfig::default()).expect("observer");
    observer
        .record(&id, EventKind::IterationStarted { iteration: 1 })
        .expect("record");
    observer
        .record(
            &id,
            EventKind::ToolDispatched {
                name: "read_file".to_string(),
                is_error: true,
                terminal: false,
            },
        )
        .expect("record");

    let output = devpilot(workspace.path())
        .args(["sessions", "show", &id])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&output);
    assert!(text.contains("Status:     iteration_exceeded"));
    assert!(text.contains("Activity:   1 iterations, 1 tool calls (1 failed)"));
}

#[test]
fn sessions_list_and_show_report_stored_session() {
    let workspace = TempDir::new().expect("workspace");
    let id = seed_session(workspace.path(), AgentKind::Report);

    let list = run_json(workspace.path(), &["--json", "sessions", "list"]);
    let entries = list.as_array().expect("array");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["id"], id.as_str());
    assert_eq!(entries[0]["agent_kind"], "report");
    assert_eq!(entries[0]["status"], "iteration_exceeded");

    let show = run_json(workspace.path(), &["--json", "sessions", "show", &id]);
    assert_eq!(show["id"], id.as_str());
    assert_eq!(show["max_iterations"], 10);
    assert_eq!(show["original_request"]["topic"], "seeded");
}

#[test]
fn sessions_delete_and_cleanup() {
    let workspace = TempDir::new().expect("workspace");
    let first = seed_session(workspace.path(), AgentKind::Commit);
    seed_session(workspace.path(), AgentKind::Debug);
    seed_session(workspace.path(), AgentKind::Review);

    let deleted = run_json(workspace.path(), &["--json", "sessions", "delete", &first]);
    assert_eq!(deleted["deleted"], first.as_str());

    let cleanup = run_json(
        workspace.path(),
        &["--json", "sessions", "cleanup", "--keep", "1"],
    );
    assert_eq!(cleanup["deleted"], 1);
    assert_eq!(cleanup["kept"], 1);

    let list = run_json(workspace.path(), &["--json", "sessions", "list"]);
    assert_eq!(list.as_array().map(Vec::len), Some(1));
}

#[test]
fn resume_of_unknown_session_fails() {
    let workspace = TempDir::new().expect("workspace");
    devpilot(workspace.path())
        .args(["--no-input", "resume", "0190aaaa-0000-7000-8000-000000000000"])
        .assert()
        .failure();
}

#[test]
fn help_lists_agent_commands() {
    let workspace = TempDir::new().expect("workspace");
    let output = devpilot(workspace.path())
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&output);
    for command in ["commit", "review", "debug", "report", "resume", "sessions"] {
        assert!(text.contains(command), "missing {command} in help");
    }
}
