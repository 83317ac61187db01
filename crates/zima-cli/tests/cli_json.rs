use assert_cmd::Command;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

#[test]
fn tools_list_includes_file_tools() {
    let workspace = TempDir::new().expect("workspace");
    let out = run_json(workspace.path(), &["--json", "tools", "list"]);
    let names: Vec<&str> = out
        .as_array()
        .expect("tool array")
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    assert!(names.contains(&"write_text_file"));
    assert!(names.contains(&"list_files"));
}

#[test]
fn tools_list_filters_by_category() {
    let workspace = TempDir::new().expect("workspace");
    let file_tools = run_json(
        workspace.path(),
        &["--json", "tools", "list", "--category", "FILE"],
    );
    let file_tools = file_tools.as_array().expect("tool array");
    assert!(!file_tools.is_empty());
    assert!(file_tools.iter().all(|t| t["category"] == "file"));

    let none = run_json(
        workspace.path(),
        &["--json", "tools", "list", "--category", "no-such-category"],
    );
    assert_eq!(none, Value::Array(Vec::new()));
}

#[test]
fn tools_call_writes_into_generated_files() {
    let workspace = TempDir::new().expect("workspace");
    let out = run_json(
        workspace.path(),
        &[
            "--json",
            "tools",
            "call",
            "write_text_file",
            "--args",
            r#"{"file_path":"hello.txt","content":"hi there"}"#,
        ],
    );
    assert_eq!(out["result"]["success"], true);
    assert_eq!(
        fs::read_to_string(workspace.path().join("generated_files/hello.txt")).expect("file"),
        "hi there"
    );
}

#[test]
fn denied_tool_call_fails_and_leaves_no_file() {
    let workspace = TempDir::new().expect("workspace");
    let runtime = workspace.path().join(".zima");
    fs::create_dir_all(&runtime).expect("runtime dir");
    fs::write(
        runtime.join("settings.json"),
        r#"{"permission":{"rules":[{"permission":"write_*","action":"deny"}]}}"#,
    )
    .expect("settings");

    Command::new(assert_cmd::cargo::cargo_bin!("zima"))
        .current_dir(workspace.path())
        .args([
            "--json",
            "tools",
            "call",
            "write_text_file",
            "--args",
            r#"{"file_path":"nope.txt","content":"x"}"#,
        ])
        .assert()
        .failure();
    assert!(!workspace.path().join("generated_files/nope.txt").exists());
}

#[test]
fn permissions_check_reports_configured_rules() {
    let workspace = TempDir::new().expect("workspace");
    let runtime = workspace.path().join(".zima");
    fs::create_dir_all(&runtime).expect("runtime dir");
    fs::write(
        runtime.join("settings.json"),
        r#"{"permission":{"rules":[{"permission":"delete_file","pattern":"*.env","action":"deny"}]}}"#,
    )
    .expect("settings");

    let denied = run_json(
        workspace.path(),
        &["--json", "permissions", "check", "delete_file", "prod.env"],
    );
    assert_eq!(denied["action"], "deny");
    let allowed = run_json(
        workspace.path(),
        &["--json", "permissions", "check", "delete_file", "notes.txt"],
    );
    assert_eq!(allowed["action"], "allow");
}

#[test]
fn agents_list_shows_builtins() {
    let workspace = TempDir::new().expect("workspace");
    let out = run_json(workspace.path(), &["--json", "agents", "list"]);
    let names: Vec<&str> = out
        .as_array()
        .expect("agent array")
        .iter()
        .filter_map(|a| a["name"].as_str())
        .collect();
    for expected in ["build", "plan", "explore"] {
        assert!(names.contains(&expected), "missing {expected}");
    }
}

#[test]
fn sessions_persist_between_invocations() {
    let workspace = TempDir::new().expect("workspace");
    let created = run_json(
        workspace.path(),
        &["--json", "sessions", "create", "--title", "Quarterly report", "--agent", "plan"],
    );
    let id = created["id"].as_str().expect("session id").to_string();
    assert_eq!(created["agent"], "plan");

    let listed = run_json(workspace.path(), &["--json", "sessions", "list"]);
    assert_eq!(listed[0]["id"], id.as_str());
    assert_eq!(listed[0]["title"], "Quarterly report");

    let forked = run_json(workspace.path(), &["--json", "sessions", "fork", &id]);
    assert_eq!(forked["parent_id"], id.as_str());
    let listed = run_json(workspace.path(), &["--json", "sessions", "list"]);
    let forks: Vec<&Value> = listed
        .as_array()
        .expect("session array")
        .iter()
        .filter(|s| s["fork"] == true)
        .collect();
    assert_eq!(forks.len(), 1);
    assert_eq!(forks[0]["id"], forked["id"]);

    let compacted = run_json(workspace.path(), &["--json", "sessions", "compact", &id]);
    assert_eq!(compacted["compaction"], Value::Null);
}

#[test]
fn serve_stdio_answers_until_eof() {
    let workspace = TempDir::new().expect("workspace");
    let output = Command::new(assert_cmd::cargo::cargo_bin!("zima"))
        .current_dir(workspace.path())
        .args(["serve", "--transport", "stdio"])
        .write_stdin(concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05"}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
            "\n",
        ))
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let lines: Vec<Value> = String::from_utf8(output)
        .expect("utf8")
        .lines()
        .map(|l| serde_json::from_str(l).expect("json line"))
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["result"]["protocolVersion"], "2024-11-05");
    assert!(
        lines[1]["result"]["tools"]
            .as_array()
            .is_some_and(|t| !t.is_empty())
    );
}

#[test]
fn completions_are_generated() {
    Command::new(assert_cmd::cargo::cargo_bin!("zima"))
        .args(["completions", "--shell", "bash"])
        .assert()
        .success();
}

fn run_json(workspace: &Path, args: &[&str]) -> Value {
    let output = Command::new(assert_cmd::cargo::cargo_bin!("zima"))
        .current_dir(workspace)
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("json output")
}
