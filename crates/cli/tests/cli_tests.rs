//! CLI integration tests

use std::process::{Command, Output};

fn clogs(args: &[&str]) -> Output {
    // Keep the user's ~/.config/clogs out of the picture
    let home = tempfile::tempdir().expect("Failed to create temp home");
    Command::new(env!("CARGO_BIN_EXE_clogs"))
        .args(args)
        .env("HOME", home.path())
        .env_remove("CLOGS_SERVER")
        .output()
        .expect("Failed to execute command")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = clogs(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("Clogs"), "Should show app name");
    for command in ["status", "services", "logs", "metrics", "agents", "uptime"] {
        assert!(stdout.contains(command), "Should show {} command", command);
    }
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = clogs(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("clogs"), "Should show binary name");
}

#[test]
fn test_global_options() {
    let output = clogs(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(stdout.contains("--server"), "Should show server option");
    assert!(stdout.contains("CLOGS_SERVER"), "Should show env var");
    assert!(stdout.contains("--format"), "Should show format option");
}

#[test]
fn test_logs_help() {
    let output = clogs(&["logs", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Logs help should succeed");
    assert!(stdout.contains("--limit"), "Should show limit option");
    assert!(stdout.contains("--level"), "Should show level option");
}

#[test]
fn test_status_help() {
    let output = clogs(&["status", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Status help should succeed");
    assert!(stdout.contains("--stack"), "Should show stack option");
}

/// Test invalid command error handling
#[test]
fn test_invalid_command() {
    let output = clogs(&["invalid-command"]);
    assert!(!output.status.success(), "Invalid command should fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error"), "Should show error message");
}

/// Test missing required argument error handling
#[test]
fn test_missing_argument() {
    let output = clogs(&["logs"]);
    assert!(!output.status.success(), "Missing argument should fail");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("required") || stderr.contains("error"),
        "Should show error about missing argument"
    );
}

#[test]
fn test_agents_json_against_server() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("GET", "/api/web/agents")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"[{"agent_id":"node-a","hostname":"node-a.lan","registered_at":1700000000000,"last_seen":1700000030000,"state":"active","live":true,"implicit":false,"containers":["web","shop/api"]}]"#,
        )
        .create();

    let url = server.url();
    let output = clogs(&["--server", &url, "--format", "json", "agents"]);
    mock.assert();

    assert!(output.status.success(), "agents should succeed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let agents: serde_json::Value = serde_json::from_str(&stdout).expect("stdout should be JSON");
    assert_eq!(agents[0]["agent_id"], "node-a");
    assert_eq!(agents[0]["containers"].as_array().map(|c| c.len()), Some(2));
}

#[test]
fn test_unreachable_server_fails() {
    let output = clogs(&["--server", "http://127.0.0.1:1", "status"]);
    assert!(!output.status.success(), "Unreachable server should fail");
}
