use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::types::{TaskId, TaskPaths};

/// Marker the generator leaves in scripts before an id exists
pub const ID_PLACEHOLDER: &str = "PLACEHOLDER";

/// How long to wait for the group to disappear after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Outcome of terminating a task's process group
#[derive(Debug)]
pub struct Termination {
    pub status: Option<ExitStatus>,
    pub forced: bool,
    pub warning: Option<String>,
}

/// Create the task directory and write its script. Log files are created empty.
pub fn prepare_task_dir(paths: &TaskPaths, id: &TaskId, script: &str) -> io::Result<()> {
    fs::create_dir_all(&paths.log_dir)?;

    let body = script.replace(ID_PLACEHOLDER, id.as_str());
    fs::write(&paths.script_path, body)?;

    for log in [&paths.output_log_path, &paths.error_log_path, &paths.status_log_path] {
        OpenOptions::new().create(true).append(true).open(log)?;
    }

    Ok(())
}

/// Append a timestamped lifecycle line to the task's `status.log`
pub fn append_event(paths: &TaskPaths, event: &str, detail: &str) {
    let line = format!("[{}] {}: {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"), event, detail);
    let written = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.status_log_path)
        .and_then(|mut file| file.write_all(line.as_bytes()));
    if let Err(e) = written {
        debug!(path = %paths.status_log_path.display(), error = %e, "Failed to write task status log");
    }
}

/// Spawn `bash script.sh` in a new process group with output appended to the task's logs.
///
/// The log handles are moved into the command and dropped with it, so after this
/// returns only the child process holds them open.
pub fn spawn_script(paths: &TaskPaths, id: &TaskId, interval: u64) -> io::Result<Child> {
    let stdout = OpenOptions::new().append(true).open(&paths.output_log_path)?;
    let stderr = OpenOptions::new().append(true).open(&paths.error_log_path)?;

    let mut cmd = Command::new("bash");
    cmd.arg(&paths.script_path)
        .env("AI_SHELL_TASK_ID", id.as_str())
        .env("AI_SHELL_TASK_DIR", &paths.log_dir)
        .env("AI_SHELL_INTERVAL", interval.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .process_group(0)
        .kill_on_drop(false);

    cmd.spawn()
}

pub(crate) fn signal_group(pid: u32, signal: Signal) -> Result<(), Errno> {
    match killpg(Pid::from_raw(pid as i32), signal) {
        // The group already vanished
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Whether the group leader has exited, without reaping it.
///
/// An unreaped leader keeps its pid, and so the group id, from being handed out again.
pub fn leader_exited(pid: u32) -> bool {
    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
    match waitid(Id::Pid(Pid::from_raw(pid as i32)), flags) {
        Ok(WaitStatus::StillAlive) => false,
        Ok(_) => true,
        Err(e) => {
            debug!(pid, error = %e, "Could not poll process");
            false
        }
    }
}

/// SIGTERM the child's process group, wait up to `grace`, then SIGKILL and reap.
pub async fn terminate_group(child: &mut Child, grace: Duration) -> Termination {
    let Some(pid) = child.id() else {
        // Already reaped by tokio
        return Termination {
            status: child.try_wait().ok().flatten(),
            forced: false,
            warning: None,
        };
    };

    if let Err(e) = signal_group(pid, Signal::SIGTERM) {
        warn!(pid, error = %e, "Failed to send SIGTERM to process group");
    }

    tokio::select! {
        result = child.wait() => {
            return match result {
                Ok(status) => {
                    debug!(pid, ?status, "Process group exited after SIGTERM");
                    Termination { status: Some(status), forced: false, warning: None }
                }
                Err(e) => Termination {
                    status: None,
                    forced: false,
                    warning: Some(format!("Failed to wait for process {}: {}", pid, e)),
                },
            };
        }
        _ = tokio::time::sleep(grace) => {
            debug!(pid, grace_secs = grace.as_secs(), "Grace period elapsed, sending SIGKILL");
        }
    }

    kill_group(child).await
}

/// SIGKILL the child's process group and reap the leader.
///
/// The leader must not have been reaped yet, otherwise its group id may already
/// belong to someone else.
pub async fn kill_group(child: &mut Child) -> Termination {
    let Some(pid) = child.id() else {
        return Termination {
            status: child.try_wait().ok().flatten(),
            forced: false,
            warning: None,
        };
    };

    let mut warning = signal_group(pid, Signal::SIGKILL)
        .err()
        .map(|e| format!("Failed to kill process group {}: {}", pid, e));

    let status = match tokio::time::timeout(KILL_WAIT, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            warning.get_or_insert_with(|| format!("Failed to wait for process {}: {}", pid, e));
            None
        }
        Err(_) => {
            warning.get_or_insert_with(|| format!("Process {} did not exit after SIGKILL", pid));
            None
        }
    };

    Termination {
        status,
        forced: true,
        warning,
    }
}

/// Kill helpers a script left behind. Call only while the leader is exited but unreaped.
pub fn sweep_group(pid: u32) {
    if let Err(e) = signal_group(pid, Signal::SIGKILL) {
        debug!(pid, error = %e, "Could not sweep process group");
    }
}

/// Last `lines` lines of a log file. A missing file reads as empty.
pub async fn read_tail(path: &Path, lines: usize) -> io::Result<Vec<String>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let text = String::from_utf8_lossy(&bytes);
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|l| l.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn paths_in(temp: &TempDir, id: &TaskId) -> TaskPaths {
        TaskPaths::for_task(temp.path(), id)
    }

    #[test]
    fn test_prepare_replaces_placeholder() {
        let temp = TempDir::new().unwrap();
        let id = TaskId::from("1234abcd");
        let paths = paths_in(&temp, &id);

        prepare_task_dir(&paths, &id, "echo PLACEHOLDER > /tmp/PLACEHOLDER.out").unwrap();

        let script = fs::read_to_string(&paths.script_path).unwrap();
        assert_eq!(script, "echo 1234abcd > /tmp/1234abcd.out");
        assert!(paths.output_log_path.exists());
        assert!(paths.error_log_path.exists());
        assert!(paths.status_log_path.exists());
    }

    #[test]
    fn test_append_event_is_timestamped() {
        let temp = TempDir::new().unwrap();
        let id = TaskId::from("e7e7e7e7");
        let paths = paths_in(&temp, &id);
        prepare_task_dir(&paths, &id, "true\n").unwrap();

        append_event(&paths, "STARTED", "pid 42");
        append_event(&paths, "STOPPED", "exit code 0");

        let log = fs::read_to_string(&paths.status_log_path).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] STARTED: pid 42"));
        assert!(lines[1].ends_with("] STOPPED: exit code 0"));
    }

    #[tokio::test]
    async fn test_leader_exit_is_seen_without_reaping() {
        let temp = TempDir::new().unwrap();
        let id = TaskId::from("abcabc12");
        let paths = paths_in(&temp, &id);
        prepare_task_dir(&paths, &id, "exit 3\n").unwrap();

        let mut child = spawn_script(&paths, &id, 1).unwrap();
        let pid = child.id().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !leader_exited(pid) {
            assert!(std::time::Instant::now() < deadline, "script never exited");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // Still a zombie, so the status is there to collect
        assert!(leader_exited(pid));
        let status = child.try_wait().unwrap().expect("exited child is reaped here");
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn test_spawn_writes_to_logs_and_sees_env() {
        let temp = TempDir::new().unwrap();
        let id = TaskId::from("feedf00d");
        let paths = paths_in(&temp, &id);

        prepare_task_dir(
            &paths,
            &id,
            "echo \"id=$AI_SHELL_TASK_ID interval=$AI_SHELL_INTERVAL\"\necho oops >&2\n",
        )
        .unwrap();

        let mut child = spawn_script(&paths, &id, 7).unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());

        let out = fs::read_to_string(&paths.output_log_path).unwrap();
        let err = fs::read_to_string(&paths.error_log_path).unwrap();
        assert_eq!(out.trim(), "id=feedf00d interval=7");
        assert_eq!(err.trim(), "oops");
    }

    #[tokio::test]
    async fn test_terminate_group_stops_sleeping_script() {
        let temp = TempDir::new().unwrap();
        let id = TaskId::from("0badc0de");
        let paths = paths_in(&temp, &id);
        prepare_task_dir(&paths, &id, "while true; do sleep 1; done\n").unwrap();

        let mut child = spawn_script(&paths, &id, 1).unwrap();
        let termination = terminate_group(&mut child, Duration::from_secs(2)).await;

        assert!(termination.warning.is_none());
        assert!(termination.status.is_some());
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_terminate_group_escalates_to_sigkill() {
        let temp = TempDir::new().unwrap();
        let id = TaskId::from("5ca1ab1e");
        let paths = paths_in(&temp, &id);
        prepare_task_dir(&paths, &id, "trap '' TERM\nwhile true; do sleep 0.2; done\n").unwrap();

        let mut child = spawn_script(&paths, &id, 1).unwrap();
        // Let bash install the trap
        tokio::time::sleep(Duration::from_millis(300)).await;
        let termination = terminate_group(&mut child, Duration::from_millis(300)).await;

        assert!(termination.forced);
        assert!(termination.status.is_some());
    }

    #[tokio::test]
    async fn test_read_tail() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out.log");
        let content: String = (1..=30).map(|i| format!("line {}\n", i)).collect();
        fs::write(&path, content).unwrap();

        let tail = read_tail(&path, 3).await.unwrap();
        assert_eq!(tail, vec!["line 28", "line 29", "line 30"]);

        let missing = read_tail(&temp.path().join("missing.log"), 5).await.unwrap();
        assert!(missing.is_empty());
    }
}
