//! End-to-end flows through the shell with a stub generator and scripted input

use super::*;
use crate::safety::RiskLevel;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const MONITOR_SCRIPT: &str = "#!/bin/bash\nINTERVAL=1\nwhile true; do\n  echo \"checking python cpu usage\"\n  ps aux | grep python | grep -v grep\n  sleep $INTERVAL\ndone\n";

struct StubGenerator {
    reply: GeneratedCommand,
    review: Option<RiskAssessment>,
    calls: Arc<AtomicUsize>,
}

impl StubGenerator {
    fn new(reply: GeneratedCommand) -> Self {
        Self {
            reply,
            review: Some(RiskAssessment::low()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl CommandGenerator for StubGenerator {
    async fn generate(
        &self,
        _request: &str,
        _context: &GenerationContext,
    ) -> Result<GeneratedCommand, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.clone())
    }

    async fn review(&self, _command: &str) -> Result<RiskAssessment, GenerationError> {
        self.review
            .clone()
            .ok_or_else(|| GenerationError::Request("review offline".to_string()))
    }
}

/// Replays answers and records every prompt shown
struct ScriptedInput {
    lines: VecDeque<String>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedInput {
    fn new(lines: &[&str]) -> (Self, Arc<Mutex<Vec<String>>>) {
        let prompts = Arc::new(Mutex::new(Vec::new()));
        let input = Self {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            prompts: prompts.clone(),
        };
        (input, prompts)
    }
}

impl LineSource for ScriptedInput {
    fn read_line(&mut self, prompt: &str) -> Input {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match self.lines.pop_front() {
            Some(line) => Input::Line(line),
            None => Input::Eof,
        }
    }
}

fn test_config(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.monitoring.log_directory = dir.join("logs");
    config.monitoring.stop_grace_period = 1;
    config.safety.blocked_commands = vec!["rm -rf /".to_string()];
    config.shell.colored_output = false;
    config
}

fn create_shell(
    dir: &TempDir,
    config: AppConfig,
    generator: Option<StubGenerator>,
    answers: &[&str],
) -> (Shell<ScriptedInput>, Arc<Mutex<Vec<String>>>) {
    let (input, prompts) = ScriptedInput::new(answers);
    let generator = generator.map(|g| Box::new(g) as Box<dyn CommandGenerator>);
    let cache = CommandCache::load(dir.path().join("cache.json"));
    let shell = Shell::new(config, dir.path().join("config.yaml"), generator, cache, input)
        .expect("shell should build");
    (shell, prompts)
}

fn process_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

fn monitoring() -> GeneratedCommand {
    GeneratedCommand::Monitoring {
        command: "ps aux | grep python".to_string(),
        script: MONITOR_SCRIPT.to_string(),
        interval: 1,
    }
}

fn one_shot(command: &str) -> GeneratedCommand {
    GeneratedCommand::OneShot {
        command: command.to_string(),
    }
}

#[tokio::test]
async fn test_monitoring_request_starts_and_stops_task() {
    let dir = TempDir::new().unwrap();
    let (mut shell, prompts) = create_shell(&dir, test_config(dir.path()), Some(StubGenerator::new(monitoring())), &["yes"]);

    let outcome = shell
        .process_request("monitor cpu usage of all python processes and notify if exceeds 80%")
        .await;
    let id = match outcome {
        RequestOutcome::Started(id) => id,
        other => panic!("expected a started task, got {:?}", other),
    };
    assert_eq!(prompts.lock().unwrap().as_slice(), ["Start this monitoring task? (yes/no): "]);

    let tasks = shell.tasks().list().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, id);
    assert_eq!(tasks[0].state, TaskState::Running);

    let pid = tasks[0].pid.expect("running task has a pid");
    let detail = shell.tasks().stop(&id).await.unwrap();
    assert_eq!(detail.state, TaskState::Stopped);
    assert!(!process_alive(pid));
}

#[tokio::test]
async fn test_blocked_command_is_refused_without_prompt() {
    let dir = TempDir::new().unwrap();
    let mut stub = StubGenerator::new(one_shot("rm -rf /"));
    // Even a benign AI opinion does not get past the block-list
    stub.review = Some(RiskAssessment::low());
    let (mut shell, prompts) = create_shell(&dir, test_config(dir.path()), Some(stub), &["yes", "yes"]);

    let outcome = shell.process_request("wipe everything").await;

    assert!(matches!(outcome, RequestOutcome::Refused(_)));
    assert!(prompts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_declined_confirmation_cancels() {
    let dir = TempDir::new().unwrap();
    let (mut shell, _prompts) = create_shell(&dir, test_config(dir.path()), Some(StubGenerator::new(monitoring())), &["no"]);

    let outcome = shell.process_request("watch python processes").await;

    assert!(matches!(outcome, RequestOutcome::Cancelled));
    assert!(shell.tasks().list().await.is_empty());
}

#[tokio::test]
async fn test_high_risk_needs_second_confirmation() {
    let dir = TempDir::new().unwrap();
    let (mut shell, prompts) = create_shell(
        &dir,
        test_config(dir.path()),
        Some(StubGenerator::new(one_shot("rm -r /etc/nginx"))),
        &["y", "no"],
    );

    let outcome = shell.process_request("remove nginx config").await;

    assert!(matches!(outcome, RequestOutcome::Cancelled));
    let prompts = prompts.lock().unwrap();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("Type 'yes'"));
}

#[tokio::test]
async fn test_low_risk_runs_without_prompt_when_confirmation_is_off() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.safety.always_confirm = false;
    let (mut shell, prompts) = create_shell(&dir, config, Some(StubGenerator::new(one_shot("echo hello"))), &[]);

    let outcome = shell.process_request("say hello").await;

    match outcome {
        RequestOutcome::Executed(result) => {
            assert!(result.success);
            assert_eq!(result.output.trim(), "hello");
        }
        other => panic!("expected execution, got {:?}", other),
    }
    assert!(prompts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_ai_opinion_raises_risk() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.safety.always_confirm = false;
    let mut stub = StubGenerator::new(one_shot("echo hello"));
    stub.review = Some(RiskAssessment::new(RiskLevel::Medium, "Suspicious"));
    let (mut shell, prompts) = create_shell(&dir, config, Some(stub), &["no"]);

    let outcome = shell.process_request("say hello").await;

    // Medium is no longer auto-approved
    assert!(matches!(outcome, RequestOutcome::Cancelled));
    assert_eq!(prompts.lock().unwrap().len(), 1);
    let cached = shell.cache().get("say hello").unwrap();
    assert_eq!(cached.assessment.as_ref().unwrap().level, RiskLevel::Medium);
}

#[tokio::test]
async fn test_failed_review_keeps_pattern_verdict() {
    let dir = TempDir::new().unwrap();
    let mut stub = StubGenerator::new(one_shot("rm -rf /"));
    stub.review = None;
    let mut config = test_config(dir.path());
    config.safety.blocked_commands.clear();
    let (mut shell, prompts) = create_shell(&dir, config, Some(stub), &[]);

    // Critical by pattern alone
    let outcome = shell.process_request("wipe everything").await;
    assert!(matches!(outcome, RequestOutcome::Refused(_)));
    assert!(prompts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_cached_request_skips_generator() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.safety.always_confirm = false;
    let stub = StubGenerator::new(one_shot("echo cached"));
    let calls = stub.calls.clone();
    let (mut shell, _prompts) = create_shell(&dir, config, Some(stub), &[]);

    shell.process_request("Say Cached").await;
    let outcome = shell.process_request("  say cached ").await;

    assert!(matches!(outcome, RequestOutcome::Executed(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(shell.cache().get("say cached").unwrap().usage_count, 2);
    assert!(dir.path().join("cache.json").exists());
}

#[tokio::test]
async fn test_missing_generator_reports_unavailable() {
    let dir = TempDir::new().unwrap();
    let (mut shell, _prompts) = create_shell(&dir, test_config(dir.path()), None, &[]);

    let outcome = shell.process_request("list files").await;
    assert!(matches!(
        outcome,
        RequestOutcome::GenerationFailed(GenerationError::Unavailable(_))
    ));
}

#[tokio::test]
async fn test_loop_handles_builtins_and_tears_down() {
    let dir = TempDir::new().unwrap();
    let (mut shell, prompts) = create_shell(
        &dir,
        test_config(dir.path()),
        Some(StubGenerator::new(monitoring())),
        &["help", "watch python", "yes", "tasks", "kill-task", "task nosuchid", "exit"],
    );

    shell.run().await.unwrap();

    // Teardown stopped the task started during the session
    let tasks = shell.tasks().list().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].state, TaskState::Stopped);
    assert!(!process_alive(tasks[0].pid.unwrap()));

    let prompts = prompts.lock().unwrap();
    assert!(prompts.iter().any(|p| p.starts_with("Start this monitoring task")));
    assert!(dir.path().join("cache.json").exists());
}

#[tokio::test]
async fn test_reload_swaps_policy_and_limits() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    // A fixed key keeps the environment from changing the llm section on reload
    config.llm.api_key = "sk-test-key".to_string();
    let (mut shell, prompts) = create_shell(
        &dir,
        config.clone(),
        Some(StubGenerator::new(one_shot("echo hello"))),
        &["reload-config", "exit"],
    );

    let mut updated = config;
    updated.safety.blocked_commands = vec!["echo hello".to_string()];
    updated.monitoring.max_background_tasks = 2;
    // A roundabout spelling of <dir>/reloaded that only resolves through the filesystem
    let dir_name = dir.path().file_name().unwrap();
    updated.monitoring.log_directory = dir.path().join("..").join(dir_name).join("reloaded");
    updated.save(&dir.path().join("config.yaml")).unwrap();

    shell.run().await.unwrap();

    assert_eq!(shell.config().monitoring.max_background_tasks, 2);
    let settings = shell.tasks().settings().await;
    assert_eq!(settings.max_tasks, 2);
    assert!(settings.log_directory.is_absolute());
    assert_eq!(
        settings.log_directory,
        std::fs::canonicalize(dir.path().join("reloaded")).unwrap()
    );
    assert_eq!(shell.config().monitoring.log_directory, settings.log_directory);

    let before = prompts.lock().unwrap().len();
    let outcome = shell.process_request("say hello").await;
    assert!(matches!(outcome, RequestOutcome::Refused(_)));
    assert_eq!(prompts.lock().unwrap().len(), before);
}
