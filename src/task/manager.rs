use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::MonitoringSettings;

use super::error::TaskError;
use super::process::{self, Termination};
use super::types::{Task, TaskDetail, TaskId, TaskPaths, TaskState, TaskSummary, TaskTransition};

/// Limits and locations the manager applies to new operations
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerSettings {
    pub max_tasks: usize,
    pub log_directory: PathBuf,
    pub grace_period: Duration,
}

impl From<&MonitoringSettings> for ManagerSettings {
    fn from(monitoring: &MonitoringSettings) -> Self {
        Self {
            max_tasks: monitoring.max_background_tasks,
            log_directory: monitoring.log_directory.clone(),
            grace_period: Duration::from_secs(monitoring.stop_grace_period),
        }
    }
}

struct Registry {
    tasks: HashMap<TaskId, Task>,
    /// Every id handed out this session, so none is reused
    issued: HashSet<TaskId>,
    next_sequence: u64,
    settings: ManagerSettings,
    /// Set by `shutdown`; no task may start afterwards
    closed: bool,
}

impl Registry {
    fn running_count(&self) -> usize {
        self.tasks.values().filter(|t| t.state.is_running()).count()
    }

    fn fresh_id(&mut self) -> TaskId {
        loop {
            let id = TaskId::generate();
            if self.issued.insert(id.clone()) {
                return id;
            }
        }
    }

    /// Reap children that exited on their own
    fn reap(&mut self) -> Vec<TaskTransition> {
        let mut transitions = Vec::new();

        for task in self.tasks.values_mut() {
            if !task.state.is_running() {
                continue;
            }
            let Some(child) = task.child.as_mut() else {
                continue;
            };

            // Sweep while the leader is still a zombie holding the group id
            if let Some(pid) = task.pid {
                if process::leader_exited(pid) {
                    process::sweep_group(pid);
                }
            }

            match child.try_wait() {
                Ok(Some(status)) => {
                    let code = status.code();
                    let state = if code == Some(0) {
                        TaskState::Stopped
                    } else {
                        TaskState::Failed
                    };
                    task.child = None;
                    task.finish(state, code);
                    let detail = match code {
                        Some(code) => format!("Process exited with code {}", code),
                        None => "Process killed by a signal".to_string(),
                    };
                    process::append_event(&task.paths, "FINISHED", &detail);
                    info!(task_id = %task.id, state = %state, exit_code = ?code, "Background task exited");
                    transitions.push(TaskTransition {
                        id: task.id.clone(),
                        state,
                        exit_code: code,
                        summary: task.summary().summary,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Failed to poll background task");
                }
            }
        }

        transitions
    }
}

/// Registry of background monitoring tasks for one shell session.
///
/// All mutation happens behind a single async mutex, so `start`, `stop`, `refresh`
/// and `shutdown` are serialized. Exit detection is a non-blocking poll on each access.
pub struct TaskManager {
    registry: Mutex<Registry>,
}

impl TaskManager {
    pub fn new(settings: ManagerSettings) -> Self {
        Self {
            registry: Mutex::new(Registry {
                tasks: HashMap::new(),
                issued: HashSet::new(),
                next_sequence: 0,
                settings,
                closed: false,
            }),
        }
    }

    pub fn from_config(monitoring: &MonitoringSettings) -> Self {
        Self::new(ManagerSettings::from(monitoring))
    }

    /// Start a monitoring script in the background
    #[instrument(skip(self, script), fields(script_len = script.len()))]
    pub async fn start(
        &self,
        script: &str,
        interval: u64,
        description: Option<&str>,
    ) -> Result<TaskId, TaskError> {
        if script.trim().is_empty() {
            return Err(TaskError::EmptyScript);
        }

        let mut registry = self.registry.lock().await;
        if registry.closed {
            return Err(TaskError::spawn("the task manager has shut down"));
        }
        registry.reap();

        let limit = registry.settings.max_tasks;
        if registry.running_count() >= limit {
            warn!(limit, "Background task limit reached");
            return Err(TaskError::CapacityExceeded { limit });
        }

        let id = registry.fresh_id();
        let paths = TaskPaths::for_task(&registry.settings.log_directory, &id);

        process::prepare_task_dir(&paths, &id, script).map_err(|e| {
            TaskError::spawn(format!("cannot prepare {}: {}", paths.log_dir.display(), e))
        })?;

        let child = process::spawn_script(&paths, &id, interval).map_err(TaskError::spawn)?;
        let pid = child.id();
        process::append_event(
            &paths,
            "STARTED",
            &format!(
                "pid {}, interval {}s",
                pid.map(|p| p.to_string()).unwrap_or_else(|| "unknown".to_string()),
                interval
            ),
        );

        let sequence = registry.next_sequence;
        registry.next_sequence += 1;

        let task = Task {
            id: id.clone(),
            script: script.to_string(),
            description: description.map(|d| d.to_string()),
            interval,
            pid,
            child: Some(child),
            state: TaskState::Running,
            exit_code: None,
            paths,
            created_at: Utc::now(),
            finished_at: None,
            sequence,
        };
        registry.tasks.insert(id.clone(), task);

        info!(task_id = %id, pid = ?pid, interval, "Started background task");
        Ok(id)
    }

    /// Stop a task, terminating its process group. Stopping a finished task is a no-op
    /// apart from marking it stopped.
    #[instrument(skip(self), fields(task_id = %id))]
    pub async fn stop(&self, id: &TaskId) -> Result<TaskDetail, TaskError> {
        let mut registry = self.registry.lock().await;
        let grace = registry.settings.grace_period;

        let task = registry
            .tasks
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.clone()))?;

        if let Some(mut child) = task.child.take() {
            process::append_event(&task.paths, "STOPPING", "Task stop requested");
            let termination = terminate(task, &mut child, grace).await;
            if let Some(message) = &termination.warning {
                warn!(task_id = %id, "{}", message);
            }
            task.finish(TaskState::Stopped, termination.status.and_then(|s| s.code()));
            info!(task_id = %id, "Stopped background task");
        } else {
            task.finish(TaskState::Stopped, None);
            debug!(task_id = %id, "Task already finished");
        }

        Ok(task.detail())
    }

    /// Every task of the session, most recently created first
    pub async fn list(&self) -> Vec<TaskSummary> {
        let mut registry = self.registry.lock().await;
        registry.reap();

        let mut tasks: Vec<&Task> = registry.tasks.values().collect();
        tasks.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.sequence.cmp(&a.sequence))
        });
        tasks.into_iter().map(Task::summary).collect()
    }

    pub async fn status(&self, id: &TaskId) -> Result<TaskDetail, TaskError> {
        let mut registry = self.registry.lock().await;
        registry.reap();

        registry
            .tasks
            .get(id)
            .map(Task::detail)
            .ok_or_else(|| TaskError::NotFound(id.clone()))
    }

    /// Number of tasks currently running
    pub async fn running_count(&self) -> usize {
        let mut registry = self.registry.lock().await;
        registry.reap();
        registry.running_count()
    }

    /// Ids of all known tasks, for completion
    pub async fn ids(&self) -> Vec<TaskId> {
        let registry = self.registry.lock().await;
        let mut ids: Vec<TaskId> = registry.tasks.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn tail_output(&self, id: &TaskId, lines: usize) -> Result<Vec<String>, TaskError> {
        let path = self.log_path(id, |p| &p.output_log_path).await?;
        Ok(read_log(&path, lines).await)
    }

    pub async fn tail_errors(&self, id: &TaskId, lines: usize) -> Result<Vec<String>, TaskError> {
        let path = self.log_path(id, |p| &p.error_log_path).await?;
        Ok(read_log(&path, lines).await)
    }

    async fn log_path(
        &self,
        id: &TaskId,
        pick: impl Fn(&TaskPaths) -> &PathBuf,
    ) -> Result<PathBuf, TaskError> {
        let registry = self.registry.lock().await;
        registry
            .tasks
            .get(id)
            .map(|t| pick(&t.paths).clone())
            .ok_or_else(|| TaskError::NotFound(id.clone()))
    }

    /// Reap exited tasks and report what changed since the last call
    pub async fn refresh(&self) -> Vec<TaskTransition> {
        self.registry.lock().await.reap()
    }

    /// Swap in new limits. Running tasks are left alone.
    pub async fn apply_config(&self, monitoring: &MonitoringSettings) {
        let mut registry = self.registry.lock().await;
        let settings = ManagerSettings::from(monitoring);
        if registry.settings != settings {
            info!(
                max_tasks = settings.max_tasks,
                log_directory = %settings.log_directory.display(),
                "Task manager configuration updated"
            );
        }
        registry.settings = settings;
    }

    pub async fn settings(&self) -> ManagerSettings {
        self.registry.lock().await.settings.clone()
    }

    /// Stop every running task and refuse new ones. Returns warnings for processes
    /// that could not be terminated.
    pub async fn shutdown(&self) -> Vec<String> {
        let mut registry = self.registry.lock().await;
        registry.closed = true;
        registry.reap();
        let grace = registry.settings.grace_period;
        let mut warnings = Vec::new();

        for task in registry.tasks.values_mut() {
            let Some(mut child) = task.child.take() else {
                continue;
            };

            process::append_event(&task.paths, "STOPPING", "Shell is shutting down");
            let termination = terminate(task, &mut child, grace).await;
            if let Some(message) = termination.warning {
                warn!(task_id = %task.id, "{}", message);
                warnings.push(format!("Task {}: {}", task.id, message));
            }
            task.finish(TaskState::Stopped, termination.status.and_then(|s| s.code()));
        }

        info!(tasks = registry.tasks.len(), "Task manager shut down");
        warnings
    }
}

/// Terminate the task's process group, recording each step in its status log
async fn terminate(task: &Task, child: &mut tokio::process::Child, grace: Duration) -> Termination {
    let group = task.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
    process::append_event(&task.paths, "SIGNAL", &format!("SIGTERM sent to process group {}", group));

    let termination = process::terminate_group(child, grace).await;
    debug!(task_id = %task.id, forced = termination.forced, status = ?termination.status, "Terminated background task");

    if termination.forced {
        process::append_event(
            &task.paths,
            "KILLED",
            &format!("SIGKILL sent to process group {} after {}s grace period", group, grace.as_secs()),
        );
    }
    let detail = match (&termination.warning, termination.status.and_then(|s| s.code())) {
        (Some(warning), _) => warning.clone(),
        (None, Some(code)) => format!("Process exited with code {}", code),
        (None, None) => "Process terminated".to_string(),
    };
    process::append_event(&task.paths, "STOPPED", &detail);
    termination
}

async fn read_log(path: &Path, lines: usize) -> Vec<String> {
    match process::read_tail(path, lines).await {
        Ok(lines) => lines,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read task log");
            vec![format!("Error reading log: {}", e)]
        }
    }
}

#[cfg(test)]
#[path = "manager.test.rs"]
mod manager_test;
