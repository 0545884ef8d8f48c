//! One-shot command execution
//!
//! Commands run under `bash -c` in their own process group so a timeout can take
//! down the whole pipeline. Success is judged with the command's conventions in mind,
//! since tools like `grep` and `diff` use exit status 1 for an ordinary answer.

use serde::{Deserialize, Serialize};
use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::task::process::{kill_group, signal_group};

/// Process group of the one-shot command in flight, 0 when idle
static FOREGROUND_GROUP: AtomicU32 = AtomicU32::new(0);

/// Registers a command's process group for [`kill_foreground`] while it runs
struct ForegroundGroup(u32);

impl ForegroundGroup {
    fn enter(pid: u32) -> Self {
        FOREGROUND_GROUP.store(pid, Ordering::SeqCst);
        Self(pid)
    }
}

impl Drop for ForegroundGroup {
    fn drop(&mut self) {
        let _ = FOREGROUND_GROUP.compare_exchange(self.0, 0, Ordering::SeqCst, Ordering::SeqCst);
    }
}

/// SIGKILL the process group of the one-shot command in flight, if any
pub fn kill_foreground() -> Option<u32> {
    let pid = FOREGROUND_GROUP.swap(0, Ordering::SeqCst);
    if pid == 0 {
        return None;
    }
    if let Err(e) = signal_group(pid, Signal::SIGKILL) {
        warn!(pid, error = %e, "Failed to kill foreground command");
    }
    Some(pid)
}

/// Result of running a one-shot command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub success: bool,
    pub output: String,
    pub error: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl CommandOutcome {
    fn failed(error: String) -> Self {
        Self {
            success: false,
            output: String::new(),
            error,
            exit_code: None,
            timed_out: false,
        }
    }
}

async fn read_all<R>(reader: Option<R>, buf: &mut Vec<u8>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(mut reader) => reader.read_to_end(buf).await.map(|_| ()),
        None => Ok(()),
    }
}

/// Read both pipes to EOF. Bytes read so far stay in the buffers if this is cancelled.
async fn read_pipes(
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    output: &mut Vec<u8>,
    error: &mut Vec<u8>,
) {
    let (out, err) = tokio::join!(read_all(stdout, output), read_all(stderr, error));
    for result in [out, err] {
        if let Err(e) = result {
            warn!(error = %e, "Failed to read command output");
        }
    }
}

/// Run `command` with `bash -c` in the current directory, killing it after `timeout`.
///
/// The deadline covers reading the output as well as waiting: a background job
/// (`cmd &`) keeps the pipes open after the shell itself has exited.
pub async fn run(command: &str, timeout: Duration) -> CommandOutcome {
    info!(command, "Executing command");
    let deadline = Instant::now() + timeout;

    let mut child = match Command::new("bash")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!(command, error = %e, "Failed to spawn command");
            return CommandOutcome::failed(format!("Failed to execute command: {}", e));
        }
    };
    let foreground = child.id().map(ForegroundGroup::enter);

    let mut output = Vec::new();
    let mut error = Vec::new();
    let (stdout, stderr) = (child.stdout.take(), child.stderr.take());

    // The leader is reaped only after the pipes close, so a kill on timeout still
    // targets this command's group
    let drained = tokio::time::timeout_at(deadline, read_pipes(stdout, stderr, &mut output, &mut error))
        .await
        .is_ok();
    let status = if drained {
        tokio::time::timeout_at(deadline, child.wait()).await.ok()
    } else {
        None
    };

    let (exit_code, timed_out) = match status {
        Some(Ok(status)) => (status.code(), false),
        Some(Err(e)) => {
            warn!(command, error = %e, "Failed to wait for command");
            (None, false)
        }
        None => {
            warn!(command, timeout_secs = timeout.as_secs(), "Command timed out");
            let termination = kill_group(&mut child).await;
            if let Some(message) = termination.warning {
                warn!("{}", message);
            }
            (None, true)
        }
    };
    drop(foreground);

    let output = String::from_utf8_lossy(&output).into_owned();
    let mut error = String::from_utf8_lossy(&error).into_owned();

    if timed_out {
        if !error.is_empty() && !error.ends_with('\n') {
            error.push('\n');
        }
        error.push_str(&format!("Command timed out after {} seconds", timeout.as_secs()));
        return CommandOutcome {
            success: false,
            output,
            error,
            exit_code: None,
            timed_out: true,
        };
    }

    let success = match exit_code {
        Some(code) => determine_success(command, code, &output, &error),
        None => false,
    };

    if success && exit_code != Some(0) {
        debug!(command, exit_code = ?exit_code, "Non-zero exit treated as success");
    }
    info!(command, success, exit_code = ?exit_code, "Command finished");

    CommandOutcome {
        success,
        output,
        error,
        exit_code,
        timed_out: false,
    }
}

fn has_word(command: &str, word: &str) -> bool {
    command
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        .any(|w| w == word)
}

/// Shell constructs whose exit status says little about whether the user got an answer
pub fn is_complex_command(command: &str) -> bool {
    const MARKERS: &[&str] = &[
        "for ", "while ", "if ", "case ", " do ", " then ", " else ", "&&", "||", "$(", "`", "{",
        "}", ";", "|", ">", "\n",
    ];
    let lowered = command.to_lowercase();
    MARKERS.iter().any(|m| lowered.contains(m))
}

/// Decide whether a finished command succeeded, given the conventions of the tools it uses
pub fn determine_success(command: &str, code: i32, output: &str, error: &str) -> bool {
    let lowered = command.trim().to_lowercase();
    let quiet_stderr = error.trim().is_empty();
    let has_output = !output.trim().is_empty();

    // diff: 0 identical, 1 different, 2 trouble
    if has_word(&lowered, "diff") {
        if code == 0 || code == 1 {
            return true;
        }
        if code == 2 {
            return quiet_stderr || !error.to_lowercase().contains("no such file");
        }
    }

    // grep: 0 found, 1 nothing found, 2 trouble
    if has_word(&lowered, "grep") || has_word(&lowered, "egrep") || has_word(&lowered, "rg") {
        if code == 0 || code == 1 {
            return true;
        }
        if code == 2 {
            return quiet_stderr;
        }
    }

    if has_word(&lowered, "find") {
        if code == 0 || code == 1 {
            return true;
        }
        if error.to_lowercase().contains("permission denied") && has_output {
            return true;
        }
    }

    // The status is the answer for test expressions
    if lowered.starts_with('[') || lowered.starts_with("test ") || lowered == "test" {
        return true;
    }

    const LENIENT: &[&str] = &["which", "whereis", "ping", "curl", "wget", "sort", "uniq"];
    if LENIENT.iter().any(|cmd| has_word(&lowered, cmd)) {
        if code == 0 || code == 1 {
            return true;
        }
        if has_output && quiet_stderr {
            return true;
        }
    }

    if is_complex_command(command) && quiet_stderr {
        return true;
    }

    code == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_commands_use_exit_status() {
        assert!(determine_success("ls", 0, "a\n", ""));
        assert!(!determine_success("ls missing", 2, "", "ls: cannot access"));
        assert!(!determine_success("false", 1, "", ""));
    }

    #[test]
    fn test_grep_no_match_is_success() {
        assert!(determine_success("grep foo file.txt", 1, "", ""));
        assert!(!determine_success("grep foo missing.txt", 2, "", "No such file"));
        assert!(determine_success("ps aux | grep python", 1, "", ""));
    }

    #[test]
    fn test_diff_conventions() {
        assert!(determine_success("diff a b", 1, "< x\n> y\n", ""));
        assert!(!determine_success("diff a missing", 2, "", "diff: missing: No such file or directory"));
    }

    #[test]
    fn test_find_permission_noise() {
        assert!(determine_success("find / -name x", 1, "/home/x\n", "Permission denied"));
        assert!(determine_success("find /root -name x", 3, "/root/x\n", "find: Permission denied"));
    }

    #[test]
    fn test_test_expressions() {
        assert!(determine_success("[ -f missing ]", 1, "", ""));
        assert!(determine_success("test -d /nope", 1, "", ""));
    }

    #[test]
    fn test_lenient_commands() {
        assert!(determine_success("which nosuchtool", 1, "", ""));
        assert!(determine_success("curl -s example.invalid", 6, "partial", ""));
        assert!(!determine_success("curl -s example.invalid", 6, "", "Could not resolve host"));
    }

    #[test]
    fn test_word_matching_avoids_substrings() {
        // "findmnt" is not find, "grepper" is not grep
        assert!(!determine_success("findmnt --nope", 1, "", "unrecognized option"));
        assert!(!determine_success("grepper x", 1, "", "not found"));
    }

    #[test]
    fn test_complex_commands() {
        assert!(is_complex_command("for f in *; do echo $f; done"));
        assert!(is_complex_command("ls | wc -l"));
        assert!(!is_complex_command("ls -la"));
        assert!(determine_success("for f in *; do [ -f x ] && echo $f; done", 1, "", ""));
        assert!(!determine_success("cat a; cat b", 1, "", "cat: b: No such file"));
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let outcome = run("echo hello; echo warn >&2", Duration::from_secs(10)).await;
        assert!(outcome.success);
        assert_eq!(outcome.output, "hello\n");
        assert_eq!(outcome.error, "warn\n");
        assert_eq!(outcome.exit_code, Some(0));
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_run_reports_failure() {
        let outcome = run("exit 4", Duration::from_secs(10)).await;
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(4));
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let started = std::time::Instant::now();
        let outcome = run("sleep 30 | cat", Duration::from_millis(300)).await;
        assert!(outcome.timed_out);
        assert!(!outcome.success);
        assert!(outcome.error.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    fn process_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.split_whitespace().next())
                .is_some_and(|state| state != "Z" && state != "X"),
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn test_background_job_cannot_outlive_timeout() {
        let started = std::time::Instant::now();
        let outcome = run("sleep 6 & echo $!", Duration::from_secs(1)).await;

        assert!(started.elapsed() < Duration::from_secs(4), "run took {:?}", started.elapsed());
        assert!(outcome.timed_out);
        assert!(!outcome.success);

        // Output written before the deadline is kept, and the job is gone
        let job: u32 = outcome.output.trim().parse().unwrap();
        for _ in 0..30 {
            if !process_running(job) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("background job {} still running", job);
    }
}
