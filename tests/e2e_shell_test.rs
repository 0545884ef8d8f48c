//! Binary-level tests for AI Shell
//!
//! Each test runs the compiled binary in a scratch directory that doubles as HOME,
//! feeding the session through stdin.

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::fs;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_ai-shell"))
}

fn shell_command(dir: &Path) -> Command {
    let mut command = Command::new(binary());
    command
        .current_dir(dir)
        .env("HOME", dir)
        .env_remove("OPENAI_API_KEY")
        .env_remove("ANTHROPIC_API_KEY")
        .env_remove("RUST_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command
}

fn run_session(dir: &Path, args: &[&str], stdin: &str) -> Output {
    let mut child = shell_command(dir)
        .args(args)
        .spawn()
        .expect("Failed to spawn ai-shell");

    child
        .stdin
        .take()
        .expect("stdin is piped")
        .write_all(stdin.as_bytes())
        .expect("Failed to write stdin");

    child.wait_with_output().expect("Failed to wait for ai-shell")
}

#[test]
fn test_version_flag() {
    let output = Command::new(binary())
        .arg("--version")
        .output()
        .expect("Failed to run ai-shell");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_first_run_creates_config_and_logs() {
    let temp_dir = TempDir::new().unwrap();

    let output = run_session(temp_dir.path(), &[], "help\nexit\n");
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout.contains("Created default configuration"));
    assert!(stdout.contains("Special Commands"));
    assert!(stdout.contains("Goodbye!"));

    let config = fs::read_to_string(temp_dir.path().join("config.yaml")).unwrap();
    assert!(config.contains("max_background_tasks"));
    assert!(temp_dir.path().join("logs").join("ai_shell.log").exists());
    assert!(temp_dir.path().join(".ai_shell_cache.json").exists());
}

#[test]
fn test_builtins_work_without_llm() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join("custom.yaml"),
        "llm:\n  provider: openai\n  api_key: sk-abcdefghijklmnop\nmonitoring:\n  log_directory: task-logs/\n",
    )
    .unwrap();

    let output = run_session(
        temp_dir.path(),
        &["--config", "custom.yaml"],
        "tasks\nconfig\nkill-task deadbeef\ncache-stats\n",
    );
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("No background tasks"));
    assert!(stdout.contains("Task deadbeef not found"));
    assert!(stdout.contains("No cached commands"));
    // The key is masked in the config listing
    assert!(stdout.contains("sk-abcde..."));
    assert!(!stdout.contains("sk-abcdefghijklmnop"));
    assert!(temp_dir.path().join("task-logs").join("ai_shell.log").exists());
}

#[test]
fn test_unconfigured_llm_reports_failure() {
    let temp_dir = TempDir::new().unwrap();

    let output = run_session(temp_dir.path(), &[], "list all files\nquit\n");
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("No LLM provider is configured"));
    assert!(stdout.contains("Could not generate a command"));
}

fn seed_cache(dir: &Path, request: &str, entry: serde_json::Value) {
    let mut cache = serde_json::Map::new();
    cache.insert(request.to_string(), entry);
    fs::write(dir.join(".ai_shell_cache.json"), serde_json::Value::Object(cache).to_string()).unwrap();
}

fn wait_for_file(path: &Path, limit: Duration) -> String {
    let deadline = Instant::now() + limit;
    loop {
        if let Ok(content) = fs::read_to_string(path) {
            if content.ends_with('\n') {
                return content;
            }
        }
        assert!(Instant::now() < deadline, "{} never appeared", path.display());
        thread::sleep(Duration::from_millis(50));
    }
}

fn find_task_file(logs: &Path, name: &str, limit: Duration) -> PathBuf {
    let deadline = Instant::now() + limit;
    loop {
        let found = fs::read_dir(logs).into_iter().flatten().flatten().find_map(|entry| {
            let candidate = entry.path().join(name);
            candidate.exists().then_some(candidate)
        });
        if let Some(path) = found {
            return path;
        }
        assert!(Instant::now() < deadline, "no task wrote {}", name);
        thread::sleep(Duration::from_millis(50));
    }
}

fn process_running(pid: i32) -> bool {
    match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // State follows the parenthesised command name; zombies count as gone
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}

fn wait_for_exit(child: &mut Child, limit: Duration) -> std::process::ExitStatus {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            panic!("ai-shell did not exit after SIGTERM");
        }
        thread::sleep(Duration::from_millis(50));
    }
}

fn exited_on_sigterm(status: std::process::ExitStatus) -> bool {
    status.code() == Some(143) || status.signal() == Some(Signal::SIGTERM as i32)
}

#[test]
fn test_sigterm_stops_background_tasks() {
    let temp_dir = TempDir::new().unwrap();
    seed_cache(
        temp_dir.path(),
        "watch it",
        serde_json::json!({
            "command": "sleep 1",
            "script": "#!/bin/bash\necho $$ > \"$AI_SHELL_TASK_DIR/leader.pid\"\nwhile true; do sleep 1; done\n",
            "interval": 1,
            "assessment": null,
            "timestamp": "2026-01-01T00:00:00Z",
            "usage_count": 1
        }),
    );

    let mut child = shell_command(temp_dir.path()).spawn().expect("Failed to spawn ai-shell");
    // stdin stays open so the shell is still at its prompt when the signal lands
    let mut stdin = child.stdin.take().expect("stdin is piped");
    stdin.write_all(b"watch it\nyes\n").unwrap();
    stdin.flush().unwrap();

    let pid_file = find_task_file(&temp_dir.path().join("logs"), "leader.pid", Duration::from_secs(10));
    let task_pid: i32 = wait_for_file(&pid_file, Duration::from_secs(5)).trim().parse().unwrap();
    assert!(process_running(task_pid));

    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();
    let status = wait_for_exit(&mut child, Duration::from_secs(15));
    drop(stdin);

    assert!(exited_on_sigterm(status), "unexpected exit status {:?}", status);
    assert!(!process_running(task_pid), "task {} outlived the shell", task_pid);

    let status_log = fs::read_to_string(pid_file.with_file_name("status.log")).unwrap();
    assert!(status_log.contains("STOPPING: Shell is shutting down"));
}

#[test]
fn test_sigterm_kills_running_command() {
    let temp_dir = TempDir::new().unwrap();
    seed_cache(
        temp_dir.path(),
        "hang around",
        serde_json::json!({
            "command": "echo $$ > fg.pid; sleep 30",
            "assessment": null,
            "timestamp": "2026-01-01T00:00:00Z",
            "usage_count": 1
        }),
    );

    let mut child = shell_command(temp_dir.path()).spawn().expect("Failed to spawn ai-shell");
    let mut stdin = child.stdin.take().expect("stdin is piped");
    stdin.write_all(b"hang around\nyes\n").unwrap();
    stdin.flush().unwrap();

    let command_pid: i32 = wait_for_file(&temp_dir.path().join("fg.pid"), Duration::from_secs(10))
        .trim()
        .parse()
        .unwrap();

    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();
    let status = wait_for_exit(&mut child, Duration::from_secs(15));
    drop(stdin);

    assert!(exited_on_sigterm(status), "unexpected exit status {:?}", status);
    // The shell exits right after SIGKILL lands; give the kernel a moment to finish
    let deadline = Instant::now() + Duration::from_secs(2);
    while process_running(command_pid) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
    assert!(!process_running(command_pid), "command {} outlived the shell", command_pid);
}
