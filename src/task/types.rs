use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::process::Child;

/// Short task identifier, the first eight hex characters of a v4 UUID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        let full = uuid::Uuid::new_v4().simple().to_string();
        TaskId(full[..8].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        TaskId(value.trim().to_string())
    }
}

/// Lifecycle state of a monitoring task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Process spawned and not yet observed to exit
    Running,
    /// Stopped on request, or exited with status 0
    Stopped,
    /// Exited with a non-zero status or was killed by an outside signal
    Failed,
}

impl TaskState {
    pub fn is_running(&self) -> bool {
        matches!(self, TaskState::Running)
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskState::Running => "running",
            TaskState::Stopped => "stopped",
            TaskState::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Files owned by one task under the log directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPaths {
    pub log_dir: PathBuf,
    pub script_path: PathBuf,
    pub output_log_path: PathBuf,
    pub error_log_path: PathBuf,
    /// Timestamped lifecycle events written by the manager
    pub status_log_path: PathBuf,
}

impl TaskPaths {
    pub fn for_task(log_root: &std::path::Path, id: &TaskId) -> Self {
        let log_dir = log_root.join(format!("task_{}", id));
        Self {
            script_path: log_dir.join("script.sh"),
            output_log_path: log_dir.join("output.log"),
            error_log_path: log_dir.join("error.log"),
            status_log_path: log_dir.join("status.log"),
            log_dir,
        }
    }
}

/// A registered monitoring task. The child handle is owned here until the process is reaped.
#[derive(Debug)]
pub(crate) struct Task {
    pub id: TaskId,
    pub script: String,
    pub description: Option<String>,
    pub interval: u64,
    pub pid: Option<u32>,
    pub child: Option<Child>,
    pub state: TaskState,
    pub exit_code: Option<i32>,
    pub paths: TaskPaths,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Creation order within the registry, breaks timestamp ties when listing
    pub sequence: u64,
}

impl Task {
    pub fn summary(&self) -> TaskSummary {
        let text = self
            .description
            .as_deref()
            .unwrap_or_else(|| self.script.lines().find(|l| !l.trim().is_empty()).unwrap_or(""));
        TaskSummary {
            id: self.id.clone(),
            state: self.state,
            created_at: self.created_at,
            pid: self.pid,
            summary: truncate(text.trim(), SUMMARY_WIDTH),
        }
    }

    pub fn detail(&self) -> TaskDetail {
        TaskDetail {
            id: self.id.clone(),
            state: self.state,
            script: self.script.clone(),
            description: self.description.clone(),
            interval: self.interval,
            pid: self.pid,
            exit_code: self.exit_code,
            paths: self.paths.clone(),
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }

    /// Record the end of the task. The first finish time wins.
    pub fn finish(&mut self, state: TaskState, exit_code: Option<i32>) {
        self.state = state;
        if exit_code.is_some() {
            self.exit_code = exit_code;
        }
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }
}

const SUMMARY_WIDTH: usize = 40;

pub(crate) fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        text.to_string()
    } else {
        let cut: String = text.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

/// One row of the task listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub pid: Option<u32>,
    pub summary: String,
}

/// Full task detail for inspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDetail {
    pub id: TaskId,
    pub state: TaskState,
    pub script: String,
    pub description: Option<String>,
    pub interval: u64,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub paths: TaskPaths,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskDetail {
    pub fn runtime(&self) -> chrono::Duration {
        self.finished_at.unwrap_or_else(Utc::now) - self.created_at
    }
}

/// A state change observed while reaping exited processes
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTransition {
    pub id: TaskId,
    pub state: TaskState,
    pub exit_code: Option<i32>,
    pub summary: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_short_hex() {
        let id = TaskId::generate();
        assert_eq!(id.as_str().len(), 8);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_task_state_helpers() {
        assert!(TaskState::Running.is_running());
        assert!(!TaskState::Failed.is_running());
        assert_eq!(TaskState::Stopped.to_string(), "stopped");
    }

    #[test]
    fn test_paths_layout() {
        let id = TaskId::from("abcd1234");
        let paths = TaskPaths::for_task(std::path::Path::new("/tmp/logs"), &id);
        assert_eq!(paths.log_dir, PathBuf::from("/tmp/logs/task_abcd1234"));
        assert_eq!(paths.output_log_path, PathBuf::from("/tmp/logs/task_abcd1234/output.log"));
        assert_eq!(paths.error_log_path, PathBuf::from("/tmp/logs/task_abcd1234/error.log"));
        assert_eq!(paths.script_path, PathBuf::from("/tmp/logs/task_abcd1234/script.sh"));
        assert_eq!(paths.status_log_path, PathBuf::from("/tmp/logs/task_abcd1234/status.log"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 40), "short");
        let long = "x".repeat(50);
        let cut = truncate(&long, 40);
        assert_eq!(cut.chars().count(), 40);
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn test_finish_keeps_first_timestamp() {
        let id = TaskId::from("deadbeef");
        let mut task = Task {
            paths: TaskPaths::for_task(std::path::Path::new("logs"), &id),
            id,
            script: "echo hi".to_string(),
            description: None,
            interval: 5,
            pid: None,
            child: None,
            state: TaskState::Running,
            exit_code: None,
            created_at: Utc::now(),
            finished_at: None,
            sequence: 0,
        };

        task.finish(TaskState::Failed, Some(3));
        let first = task.finished_at;
        task.finish(TaskState::Stopped, None);

        assert_eq!(task.state, TaskState::Stopped);
        assert_eq!(task.exit_code, Some(3));
        assert_eq!(task.finished_at, first);
        assert_eq!(task.summary().summary, "echo hi");
    }
}
