use super::*;
use std::collections::HashSet;
use tempfile::TempDir;

const LONG_RUNNING: &str = "while true; do echo tick; sleep 1; done\n";

fn create_test_manager(max_tasks: usize) -> (TaskManager, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let manager = TaskManager::new(ManagerSettings {
        max_tasks,
        log_directory: temp_dir.path().join("logs"),
        grace_period: Duration::from_secs(2),
    });
    (manager, temp_dir)
}

fn process_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

async fn wait_for_state(manager: &TaskManager, id: &TaskId, state: TaskState) -> TaskDetail {
    for _ in 0..50 {
        let detail = manager.status(id).await.expect("task should exist");
        if detail.state == state {
            return detail;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("task {} never reached {:?}", id, state);
}

#[tokio::test]
async fn test_start_registers_running_task() {
    let (manager, _temp_dir) = create_test_manager(5);

    let id = manager
        .start(LONG_RUNNING, 5, Some("print ticks"))
        .await
        .expect("Failed to start task");

    // Visible immediately, no gap between start and list
    let tasks = manager.list().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, id);
    assert_eq!(tasks[0].state, TaskState::Running);
    assert_eq!(tasks[0].summary, "print ticks");

    let detail = manager.status(&id).await.unwrap();
    assert!(detail.paths.log_dir.is_dir());
    assert!(detail.paths.output_log_path.exists());
    assert!(detail.paths.error_log_path.exists());
    assert!(detail.paths.script_path.exists());
    assert_eq!(detail.interval, 5);
    assert!(detail.pid.is_some());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_empty_script_is_rejected() {
    let (manager, _temp_dir) = create_test_manager(5);

    assert_eq!(manager.start("", 5, None).await, Err(TaskError::EmptyScript));
    assert_eq!(manager.start("  \n\t", 5, None).await, Err(TaskError::EmptyScript));
    assert!(manager.list().await.is_empty());
}

#[tokio::test]
async fn test_ids_are_unique_across_lifetime() {
    let (manager, _temp_dir) = create_test_manager(3);
    let mut seen = HashSet::new();

    for _ in 0..6 {
        let id = manager.start("exit 0\n", 1, None).await.unwrap();
        assert!(seen.insert(id.clone()), "id {} was reused", id);
        manager.stop(&id).await.unwrap();
    }

    assert_eq!(manager.list().await.len(), 6);
}

#[tokio::test]
async fn test_capacity_limit_and_recovery() {
    let (manager, _temp_dir) = create_test_manager(2);

    let first = manager.start(LONG_RUNNING, 1, None).await.unwrap();
    let _second = manager.start(LONG_RUNNING, 1, None).await.unwrap();

    let result = manager.start(LONG_RUNNING, 1, None).await;
    assert_eq!(result, Err(TaskError::CapacityExceeded { limit: 2 }));
    // The rejected start registered nothing
    assert_eq!(manager.list().await.len(), 2);

    manager.stop(&first).await.unwrap();
    let third = manager.start(LONG_RUNNING, 1, None).await;
    assert!(third.is_ok());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_stop_unknown_task() {
    let (manager, _temp_dir) = create_test_manager(2);
    let missing = TaskId::from("nothere1");

    assert_eq!(
        manager.stop(&missing).await,
        Err(TaskError::NotFound(missing.clone()))
    );
    assert!(matches!(
        manager.status(&missing).await,
        Err(TaskError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_stop_is_idempotent_and_terminates_process() {
    let (manager, _temp_dir) = create_test_manager(2);
    let id = manager.start(LONG_RUNNING, 1, None).await.unwrap();
    let pid = manager.status(&id).await.unwrap().pid.unwrap();
    assert!(process_alive(pid));

    let first = manager.stop(&id).await.expect("first stop");
    assert_eq!(first.state, TaskState::Stopped);
    assert!(first.finished_at.is_some());
    assert!(!process_alive(pid));

    let second = manager.stop(&id).await.expect("second stop");
    assert_eq!(second.state, TaskState::Stopped);
    assert_eq!(second.finished_at, first.finished_at);

    // Still queryable after stopping
    assert_eq!(manager.status(&id).await.unwrap().state, TaskState::Stopped);
}

#[tokio::test]
async fn test_non_zero_exit_becomes_failed() {
    let (manager, _temp_dir) = create_test_manager(2);
    let id = manager.start("echo broken >&2\nexit 3\n", 1, None).await.unwrap();

    let detail = wait_for_state(&manager, &id, TaskState::Failed).await;
    assert_eq!(detail.exit_code, Some(3));
    assert!(detail.finished_at.is_some());

    let errors = manager.tail_errors(&id, 20).await.unwrap();
    assert_eq!(errors, vec!["broken".to_string()]);
}

#[tokio::test]
async fn test_clean_exit_becomes_stopped() {
    let (manager, _temp_dir) = create_test_manager(2);
    let id = manager.start("echo done\n", 1, None).await.unwrap();

    let detail = wait_for_state(&manager, &id, TaskState::Stopped).await;
    assert_eq!(detail.exit_code, Some(0));

    let output = manager.tail_output(&id, 20).await.unwrap();
    assert_eq!(output, vec!["done".to_string()]);
}

#[tokio::test]
async fn test_failed_task_can_still_be_stopped() {
    let (manager, _temp_dir) = create_test_manager(2);
    let id = manager.start("exit 1\n", 1, None).await.unwrap();
    wait_for_state(&manager, &id, TaskState::Failed).await;

    let detail = manager.stop(&id).await.unwrap();
    assert_eq!(detail.state, TaskState::Stopped);
    assert_eq!(detail.exit_code, Some(1));
}

#[tokio::test]
async fn test_refresh_reports_transitions_once() {
    let (manager, _temp_dir) = create_test_manager(2);
    let id = manager.start("exit 2\n", 1, Some("quick failure")).await.unwrap();

    let mut transitions = Vec::new();
    for _ in 0..50 {
        transitions = manager.refresh().await;
        if !transitions.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(transitions.len(), 1);
    assert_eq!(transitions[0].id, id);
    assert_eq!(transitions[0].state, TaskState::Failed);
    assert_eq!(transitions[0].exit_code, Some(2));
    assert_eq!(transitions[0].summary, "quick failure");

    assert!(manager.refresh().await.is_empty());
}

#[tokio::test]
async fn test_list_is_newest_first() {
    let (manager, _temp_dir) = create_test_manager(5);
    let a = manager.start("exit 0\n", 1, Some("a")).await.unwrap();
    let b = manager.start("exit 0\n", 1, Some("b")).await.unwrap();
    let c = manager.start("exit 0\n", 1, Some("c")).await.unwrap();

    let ids: Vec<TaskId> = manager.list().await.into_iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![c, b, a]);
}

#[tokio::test]
async fn test_placeholder_replaced_with_task_id() {
    let (manager, _temp_dir) = create_test_manager(2);
    let id = manager.start("echo task=PLACEHOLDER\n", 1, None).await.unwrap();

    wait_for_state(&manager, &id, TaskState::Stopped).await;
    let output = manager.tail_output(&id, 5).await.unwrap();
    assert_eq!(output, vec![format!("task={}", id)]);
}

#[tokio::test]
async fn test_spawn_failure_registers_nothing() {
    let temp_dir = TempDir::new().unwrap();
    // A regular file where the log directory should be
    let blocker = temp_dir.path().join("logs");
    std::fs::write(&blocker, "not a directory").unwrap();

    let manager = TaskManager::new(ManagerSettings {
        max_tasks: 2,
        log_directory: blocker,
        grace_period: Duration::from_secs(1),
    });

    let result = manager.start("echo hi\n", 1, None).await;
    assert!(matches!(result, Err(TaskError::SpawnFailure { .. })));
    assert!(manager.list().await.is_empty());
}

#[tokio::test]
async fn test_apply_config_changes_limit() {
    let (manager, temp_dir) = create_test_manager(1);
    let _first = manager.start(LONG_RUNNING, 1, None).await.unwrap();
    assert!(matches!(
        manager.start(LONG_RUNNING, 1, None).await,
        Err(TaskError::CapacityExceeded { limit: 1 })
    ));

    let monitoring = MonitoringSettings {
        max_background_tasks: 3,
        log_directory: temp_dir.path().join("other_logs"),
        stop_grace_period: 1,
        ..Default::default()
    };
    manager.apply_config(&monitoring).await;

    let second = manager.start(LONG_RUNNING, 1, None).await.unwrap();
    let detail = manager.status(&second).await.unwrap();
    assert!(detail.paths.log_dir.starts_with(temp_dir.path().join("other_logs")));
    assert_eq!(manager.settings().await.grace_period, Duration::from_secs(1));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_terminates_everything() {
    let (manager, _temp_dir) = create_test_manager(3);
    let mut pids = Vec::new();
    for _ in 0..3 {
        let id = manager.start(LONG_RUNNING, 1, None).await.unwrap();
        pids.push(manager.status(&id).await.unwrap().pid.unwrap());
    }

    let warnings = manager.shutdown().await;
    assert!(warnings.is_empty());
    assert_eq!(manager.running_count().await, 0);
    for pid in pids {
        assert!(!process_alive(pid));
    }
    assert!(manager.list().await.iter().all(|t| t.state == TaskState::Stopped));
}

#[tokio::test]
async fn test_outside_signal_marks_task_failed() {
    let (manager, _temp_dir) = create_test_manager(2);
    let id = manager.start(LONG_RUNNING, 1, None).await.unwrap();
    let pid = manager.status(&id).await.unwrap().pid.unwrap();

    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();

    let detail = wait_for_state(&manager, &id, TaskState::Failed).await;
    assert_eq!(detail.exit_code, None);
    assert!(detail.finished_at.is_some());
}

/// Running and not a zombie waiting for a reaper
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
async fn test_helpers_left_by_finished_script_are_swept() {
    let (manager, _temp_dir) = create_test_manager(2);
    let id = manager
        .start("sleep 30 &\necho $! > \"$AI_SHELL_TASK_DIR/helper.pid\"\nexit 0\n", 1, None)
        .await
        .unwrap();

    let detail = wait_for_state(&manager, &id, TaskState::Stopped).await;
    let helper: u32 = std::fs::read_to_string(detail.paths.log_dir.join("helper.pid"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();

    for _ in 0..50 {
        if !process_running(helper) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("helper process {} survived its task", helper);
}

#[tokio::test]
async fn test_status_log_records_lifecycle() {
    let (manager, _temp_dir) = create_test_manager(2);

    let stopped = manager.start(LONG_RUNNING, 4, None).await.unwrap();
    let detail = manager.stop(&stopped).await.unwrap();
    let log = std::fs::read_to_string(&detail.paths.status_log_path).unwrap();
    let events: Vec<&str> = log
        .lines()
        .filter_map(|line| line.split("] ").nth(1))
        .filter_map(|rest| rest.split(':').next())
        .collect();
    assert_eq!(events, vec!["STARTED", "STOPPING", "SIGNAL", "STOPPED"]);
    assert!(log.contains("interval 4s"));
    assert!(log.contains(&format!("SIGTERM sent to process group {}", detail.pid.unwrap())));

    let failed = manager.start("exit 3\n", 1, None).await.unwrap();
    let detail = wait_for_state(&manager, &failed, TaskState::Failed).await;
    let log = std::fs::read_to_string(&detail.paths.status_log_path).unwrap();
    assert!(log.contains("FINISHED: Process exited with code 3"));
}

#[tokio::test]
async fn test_status_log_records_sigkill_escalation() {
    let temp_dir = TempDir::new().unwrap();
    let manager = TaskManager::new(ManagerSettings {
        max_tasks: 1,
        log_directory: temp_dir.path().join("logs"),
        grace_period: Duration::from_millis(300),
    });
    let id = manager
        .start("trap '' TERM\nwhile true; do sleep 0.2; done\n", 1, None)
        .await
        .unwrap();
    // Let bash install the trap
    tokio::time::sleep(Duration::from_millis(300)).await;

    let detail = manager.stop(&id).await.unwrap();
    let log = std::fs::read_to_string(&detail.paths.status_log_path).unwrap();
    assert!(log.contains("KILLED: SIGKILL sent to process group"));
    assert!(log.lines().last().unwrap().contains("STOPPED:"));
}

#[tokio::test]
async fn test_start_after_shutdown_is_refused() {
    let (manager, _temp_dir) = create_test_manager(2);
    manager.shutdown().await;

    let result = manager.start(LONG_RUNNING, 1, None).await;
    assert!(matches!(result, Err(TaskError::SpawnFailure { .. })));
    assert!(manager.list().await.is_empty());
}
