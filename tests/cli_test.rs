use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

fn tm(db: &Path) -> Command {
    let mut cmd = Command::cargo_bin("tm").unwrap();
    cmd.env("TM_DB", db)
        .env("TM_ACTOR", "cli-tester")
        .env_remove("TM_CONFIG")
        .env_remove("TM_DB_DIR")
        .env_remove("TM_ASSIGNEE")
        .env_remove("TM_BUSY_TIMEOUT_MS");
    cmd
}

#[test]
fn test_add_depend_complete_flow() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("tasks.db");

    tm(&db).arg("init").assert().success();
    tm(&db)
        .args(["add", "Write parser"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created task 1"));
    tm(&db)
        .args(["add", "Wire CLI", "--depends", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("blocked: Blocked by: 1"));

    tm(&db)
        .args(["start", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Task 2 blocked"));
    tm(&db)
        .args(["complete", "1", "-m", "done"])
        .assert()
        .success()
        .stdout(predicate::str::contains("unblocked 2"));
    tm(&db)
        .args(["start", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Started task 2"));

    tm(&db)
        .args(["list", "--status", "in_progress"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wire CLI"))
        .stdout(predicate::str::contains("Write parser").not());
}

#[test]
fn test_exit_codes() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("tasks.db");
    tm(&db).args(["add", "Only task"]).assert().success();

    tm(&db)
        .args(["show", "42"])
        .assert()
        .code(3)
        .stderr(predicate::str::starts_with("error:"))
        .stderr(predicate::str::contains("task 42 not found"));
    tm(&db)
        .args(["unblock", "1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("cannot unblock task 1"));
    tm(&db)
        .args(["add", "Late", "--due", "tomorrow"])
        .assert()
        .code(2);
}

#[test]
fn test_watch_prints_event_lines() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("tasks.db");
    tm(&db).args(["add", "A", "-a", "alice"]).assert().success();
    tm(&db).args(["add", "B", "-a", "bob"]).assert().success();

    tm(&db)
        .arg("watch")
        .assert()
        .success()
        .stdout(predicate::str::contains("task_created task=1 target=- actor=cli-tester"))
        .stdout(predicate::str::contains("title=B"));

    tm(&db)
        .args(["watch", "--assignee", "alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("title=A"))
        .stdout(predicate::str::contains("title=B").not());

    tm(&db)
        .args(["watch", "--since", "1", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"type\":\"task_created\""))
        .stdout(predicate::str::contains("\"id\":1,").not());
}

#[test]
fn test_doctor_reports_cycle() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("tasks.db");
    tm(&db).args(["add", "T1"]).assert().success();
    tm(&db).args(["add", "T2"]).assert().success();
    tm(&db).args(["depend", "1", "--on", "2"]).assert().success();
    tm(&db).args(["depend", "2", "--on", "1"]).assert().success();

    tm(&db)
        .arg("doctor")
        .assert()
        .success()
        .stdout(predicate::str::contains("cycle detected: 1 -> 2 -> 1"));
}

#[test]
fn test_show_json_and_export() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("tasks.db");
    let export = dir.path().join("snapshot.json");
    tm(&db)
        .args(["add", "X", "--resource", "removes:feature:q", "--link", "src/q.rs"])
        .assert()
        .success();
    tm(&db)
        .args(["show", "1", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"kind\": \"removes\""))
        .stdout(predicate::str::contains("\"resource\": \"file:src/q.rs\""));

    tm(&db).arg("export").arg(&export).assert().success();
    let text = std::fs::read_to_string(&export).unwrap();
    assert!(text.contains("\"title\": \"X\""));
}
