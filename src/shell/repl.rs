//! The interactive loop: read a line, dispatch built-ins, otherwise turn the request
//! into a command, gate it, and run it.

use anyhow::Result;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{CompletionType, EditMode, Editor};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, ShellSettings};
use crate::exec::{self, CommandOutcome};
use crate::llm::{CommandGenerator, GeneratedCommand, GenerationContext, GenerationError, LlmClient, LlmGenerator};
use crate::safety::{GateDecision, RiskAssessment, RiskClassifier, SafetyPolicy};
use crate::task::{TaskError, TaskId, TaskManager, TaskState};

use super::cache::CommandCache;
use super::commands::{SpecialCommand, help_text};
use super::completer::ShellHelper;

pub const HISTORY_FILE_NAME: &str = ".ai_shell_history";
const HISTORY_CONTEXT: usize = 5;
const SCRIPT_PREVIEW_LINES: usize = 12;
const TAIL_OUTPUT_LINES: usize = 10;
const TAIL_ERROR_LINES: usize = 5;

/// One read from the user
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Line(String),
    Interrupted,
    Eof,
}

/// Where the shell reads lines from: the terminal editor, or a script in tests
pub trait LineSource {
    fn read_line(&mut self, prompt: &str) -> Input;

    fn remember(&mut self, _line: &str) {}

    fn set_task_ids(&mut self, _ids: Vec<String>) {}

    fn persist(&mut self) {}
}

/// `rustyline` editor with file history and completion
pub struct EditorSource {
    editor: Editor<ShellHelper, DefaultHistory>,
    history_path: PathBuf,
}

impl EditorSource {
    pub fn default_history_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(HISTORY_FILE_NAME)
    }

    pub fn new(settings: &ShellSettings, history_path: PathBuf) -> Result<Self> {
        let config = rustyline::Config::builder()
            .completion_type(CompletionType::List)
            .edit_mode(EditMode::Emacs)
            .max_history_size(settings.history_size.max(1))?
            .history_ignore_dups(true)?
            .auto_add_history(false)
            .build();

        let mut editor = Editor::<ShellHelper, DefaultHistory>::with_config(config)?;
        editor.set_helper(Some(ShellHelper::new(settings.auto_suggest)));
        if let Err(e) = editor.load_history(&history_path) {
            debug!(path = %history_path.display(), error = %e, "No history loaded");
        }

        Ok(Self { editor, history_path })
    }
}

impl LineSource for EditorSource {
    fn read_line(&mut self, prompt: &str) -> Input {
        match self.editor.readline(prompt) {
            Ok(line) => Input::Line(line),
            Err(ReadlineError::Interrupted) => Input::Interrupted,
            Err(ReadlineError::Eof) => Input::Eof,
            Err(e) => {
                warn!(error = %e, "Failed to read input");
                Input::Eof
            }
        }
    }

    fn remember(&mut self, line: &str) {
        if let Err(e) = self.editor.add_history_entry(line) {
            debug!(error = %e, "Failed to add history entry");
        }
    }

    fn set_task_ids(&mut self, ids: Vec<String>) {
        if let Some(helper) = self.editor.helper_mut() {
            helper.set_task_ids(ids);
        }
    }

    fn persist(&mut self) {
        if let Err(e) = self.editor.save_history(&self.history_path) {
            warn!(path = %self.history_path.display(), error = %e, "Failed to save history");
        }
    }
}

/// What happened to a natural-language request
#[derive(Debug)]
pub enum RequestOutcome {
    GenerationFailed(GenerationError),
    Refused(String),
    Cancelled,
    Executed(CommandOutcome),
    Started(TaskId),
    StartFailed(TaskError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Flow {
    Continue,
    Exit,
}

/// Build the network-backed generator, or `None` when the LLM is not usable
pub fn build_generator(config: &AppConfig) -> Option<Box<dyn CommandGenerator>> {
    if !config.is_llm_configured() {
        return None;
    }
    match LlmClient::from_settings(&config.llm) {
        Ok(client) => {
            info!(provider = client.provider().name(), model = client.model(), "LLM client ready");
            let generator: Box<dyn CommandGenerator> = Box::new(LlmGenerator::new(client));
            Some(generator)
        }
        Err(e) => {
            warn!(error = %e, "Failed to build LLM client");
            None
        }
    }
}

pub struct Shell<S: LineSource> {
    config: AppConfig,
    config_path: PathBuf,
    generator: Option<Box<dyn CommandGenerator>>,
    classifier: RiskClassifier,
    policy: SafetyPolicy,
    tasks: Arc<TaskManager>,
    cache: CommandCache,
    input: S,
    history: Vec<String>,
}

impl<S: LineSource> Shell<S> {
    pub fn new(
        config: AppConfig,
        config_path: PathBuf,
        generator: Option<Box<dyn CommandGenerator>>,
        cache: CommandCache,
        input: S,
    ) -> Result<Self> {
        let method = &config.monitoring.notifications.method;
        if !method.eq_ignore_ascii_case("console") {
            warn!(method = %method, "Unsupported notification method, using console");
        }

        Ok(Self {
            classifier: RiskClassifier::with_builtin_rules()?,
            policy: SafetyPolicy::from_config(&config.safety),
            tasks: Arc::new(TaskManager::from_config(&config.monitoring)),
            config,
            config_path,
            generator,
            cache,
            input,
            history: Vec::new(),
        })
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    /// Shared handle for teardown outside the loop
    pub fn task_handle(&self) -> Arc<TaskManager> {
        Arc::clone(&self.tasks)
    }

    pub fn cache(&self) -> &CommandCache {
        &self.cache
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn prompt(&self) -> String {
        if self.config.shell.colored_output {
            format!("\x1b[32m{}>\x1b[0m ", self.config.shell.prompt_style)
        } else {
            format!("{}> ", self.config.shell.prompt_style)
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        print_banner();
        if self.generator.is_none() {
            println!(
                "⚠️  No LLM provider is configured. Set llm.api_key in {} (only cached requests will work).",
                self.config_path.display()
            );
        }

        loop {
            self.announce_transitions().await;
            let ids = self.tasks.ids().await.iter().map(|id| id.to_string()).collect();
            self.input.set_task_ids(ids);

            let prompt = self.prompt();
            let line = match self.input.read_line(&prompt) {
                Input::Line(line) => line.trim().to_string(),
                Input::Interrupted => {
                    println!("Use 'exit' to quit.");
                    continue;
                }
                Input::Eof => {
                    println!("Goodbye!");
                    break;
                }
            };
            if line.is_empty() {
                continue;
            }
            self.input.remember(&line);

            if let Some(command) = SpecialCommand::parse(&line) {
                if self.handle_special(command).await == Flow::Exit {
                    println!("Goodbye!");
                    break;
                }
                continue;
            }

            let outcome = self.process_request(&line).await;
            report_outcome(&outcome);
            self.history.push(line);
        }

        self.teardown().await;
        Ok(())
    }

    /// Announce tasks that exited since the last prompt
    async fn announce_transitions(&self) {
        let transitions = self.tasks.refresh().await;
        if !self.config.monitoring.notifications.enabled {
            return;
        }
        for transition in transitions {
            let code = transition
                .exit_code
                .map(|c| format!(" (exit code {})", c))
                .unwrap_or_default();
            match transition.state {
                TaskState::Failed => println!("🔔 ⚠️  Task {} failed{}: {}", transition.id, code, transition.summary),
                _ => println!("🔔 Task {} finished{}: {}", transition.id, code, transition.summary),
            }
        }
    }

    async fn handle_special(&mut self, command: SpecialCommand) -> Flow {
        match command {
            SpecialCommand::Exit => return Flow::Exit,
            SpecialCommand::Help => println!("{}", help_text()),
            SpecialCommand::Tasks => self.show_tasks().await,
            SpecialCommand::Task(id) => self.show_task(&id).await,
            SpecialCommand::KillTask(id) => match self.tasks.stop(&id).await {
                Ok(detail) => {
                    let code = detail.exit_code.map(|c| format!(" (exit code {})", c)).unwrap_or_default();
                    println!("🛑 Task {} stopped{}.", detail.id, code);
                }
                Err(e) => println!("❌ {}", e),
            },
            SpecialCommand::Config => self.show_config(),
            SpecialCommand::ReloadConfig => self.reload_config().await,
            SpecialCommand::CacheStats => self.show_cache_stats(),
            SpecialCommand::ClearCache => self.clear_cache(),
            SpecialCommand::Usage(usage) => println!("Usage: {}", usage),
        }
        Flow::Continue
    }

    /// Turn a request into a command, gate it, and run it
    pub async fn process_request(&mut self, request: &str) -> RequestOutcome {
        let (generated, ai_opinion) = match self.cache.hit(request) {
            Some(entry) => {
                println!("📚 Using cached command...");
                (entry.generated(), entry.assessment)
            }
            None => match self.generate(request).await {
                Ok(generated) => {
                    let opinion = self.ai_review(generated.text()).await;
                    self.cache.insert(request, &generated, opinion.clone());
                    if let Err(e) = self.cache.save() {
                        warn!(error = %e, "Failed to save command cache");
                    }
                    (generated, opinion)
                }
                Err(e) => {
                    warn!(error = %e, "Command generation failed");
                    return RequestOutcome::GenerationFailed(e);
                }
            },
        };

        self.show_generated(&generated);

        let pattern = self.classifier.classify_script(generated.text());
        let assessment = match &ai_opinion {
            Some(ai) => RiskClassifier::merge(&pattern, ai),
            None => pattern,
        };
        show_assessment(generated.text(), &assessment);

        let decision = self.policy.decide(generated.text(), &assessment);
        debug!(?decision, level = %assessment.level, "Safety gate");

        let confirmed = match decision {
            GateDecision::Refuse(reason) => {
                info!(reason = %reason, "Command refused");
                return RequestOutcome::Refused(reason);
            }
            GateDecision::Proceed => true,
            GateDecision::Confirm => self.confirm(confirm_question(&generated)),
            GateDecision::ConfirmExplicit => {
                self.confirm("Do you still want to proceed? (yes/no): ")
                    && self.confirm_exact("This is a high-risk command. Type 'yes' to confirm: ", "yes")
            }
        };
        if !confirmed {
            return RequestOutcome::Cancelled;
        }

        match generated {
            GeneratedCommand::OneShot { command } => {
                println!("🚀 Executing command...");
                let outcome = exec::run(&command, Duration::from_secs(self.config.shell.command_timeout)).await;
                RequestOutcome::Executed(outcome)
            }
            GeneratedCommand::Monitoring { script, interval, .. } => {
                match self.tasks.start(&script, interval, Some(request)).await {
                    Ok(id) => RequestOutcome::Started(id),
                    Err(e) => RequestOutcome::StartFailed(e),
                }
            }
        }
    }

    async fn generate(&self, request: &str) -> Result<GeneratedCommand, GenerationError> {
        let generator = self.generator.as_ref().ok_or_else(|| {
            GenerationError::Unavailable(format!(
                "no LLM provider is configured, set llm.api_key in {}",
                self.config_path.display()
            ))
        })?;

        println!("🤖 Converting to bash command...");
        let recent: Vec<String> = self
            .history
            .iter()
            .rev()
            .take(HISTORY_CONTEXT)
            .rev()
            .cloned()
            .collect();
        let context = GenerationContext::current(recent, self.config.monitoring.default_interval);
        generator.generate(request, &context).await
    }

    /// Second opinion from the LLM; failures keep the pattern verdict
    async fn ai_review(&self, command: &str) -> Option<RiskAssessment> {
        if !self.config.safety.ai_review {
            return None;
        }
        let generator = self.generator.as_ref()?;
        println!("🔍 Checking command safety...");
        match generator.review(command).await {
            Ok(assessment) => Some(assessment),
            Err(e) => {
                warn!(error = %e, "AI safety review failed");
                println!("⚠️  AI safety review unavailable, using pattern analysis only");
                None
            }
        }
    }

    fn show_generated(&self, generated: &GeneratedCommand) {
        match generated {
            GeneratedCommand::OneShot { command } => println!("Generated command: {}", command),
            GeneratedCommand::Monitoring { command, script, interval } => {
                println!("🔄 This appears to be a monitoring task.");
                println!("Base command: {}", command);
                println!("Interval: {}s", interval);
                println!("Generated monitoring script:");
                let lines: Vec<&str> = script.lines().collect();
                for line in lines.iter().take(SCRIPT_PREVIEW_LINES) {
                    println!("  {}", line);
                }
                if lines.len() > SCRIPT_PREVIEW_LINES {
                    println!("  ... ({} more lines)", lines.len() - SCRIPT_PREVIEW_LINES);
                }
            }
        }
    }

    fn ask(&mut self, question: &str) -> Option<String> {
        match self.input.read_line(question) {
            Input::Line(answer) => Some(answer.trim().to_string()),
            Input::Interrupted | Input::Eof => None,
        }
    }

    fn confirm(&mut self, question: &str) -> bool {
        self.ask(question)
            .map(|answer| matches!(answer.to_lowercase().as_str(), "yes" | "y"))
            .unwrap_or(false)
    }

    fn confirm_exact(&mut self, question: &str, expected: &str) -> bool {
        self.ask(question)
            .map(|answer| answer.eq_ignore_ascii_case(expected))
            .unwrap_or(false)
    }

    async fn show_tasks(&self) {
        let tasks = self.tasks.list().await;
        if tasks.is_empty() {
            println!("📋 No background tasks.");
            return;
        }

        let running = tasks.iter().filter(|t| t.state.is_running()).count();
        println!("📋 Background tasks ({} running, {} total):", running, tasks.len());
        println!("  {:<10} {:<8} {:<9} {:<8} {}", "ID", "STATE", "STARTED", "PID", "DESCRIPTION");
        for task in tasks {
            let pid = task.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
            println!(
                "  {:<10} {:<8} {:<9} {:<8} {}",
                task.id.as_str(),
                task.state.label(),
                task.created_at.with_timezone(&chrono::Local).format("%H:%M:%S"),
                pid,
                task.summary
            );
        }
    }

    async fn show_task(&self, id: &TaskId) {
        let detail = match self.tasks.status(id).await {
            Ok(detail) => detail,
            Err(e) => {
                println!("❌ {}", e);
                return;
            }
        };

        println!("📋 Task {}", detail.id);
        println!("  State:       {}", detail.state);
        if let Some(code) = detail.exit_code {
            println!("  Exit code:   {}", code);
        }
        if let Some(description) = &detail.description {
            println!("  Request:     {}", description);
        }
        println!("  Interval:    {}s", detail.interval);
        if let Some(pid) = detail.pid {
            println!("  PID:         {}", pid);
        }
        println!("  Started:     {}", detail.created_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"));
        if let Some(finished) = detail.finished_at {
            println!("  Finished:    {}", finished.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"));
        }
        println!("  Runtime:     {}s", detail.runtime().num_seconds());
        println!("  Logs:        {}", detail.paths.log_dir.display());

        print_tail("Recent output", self.tasks.tail_output(id, TAIL_OUTPUT_LINES).await);
        print_tail("Recent errors", self.tasks.tail_errors(id, TAIL_ERROR_LINES).await);
    }

    fn show_config(&self) {
        match self.config.render_masked() {
            Ok(rendered) => {
                println!("📋 Configuration ({}):", self.config_path.display());
                println!("{}", rendered);
            }
            Err(e) => println!("❌ Could not render configuration: {}", e),
        }
    }

    /// Build a fresh configuration and swap it in. The old one stays on failure.
    async fn reload_config(&mut self) {
        let mut config = match AppConfig::load(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                println!("❌ Failed to reload configuration: {}", e);
                return;
            }
        };
        for warning in config.validate() {
            println!("⚠️  {}", warning);
        }
        match config.prepare_log_directory() {
            Ok(log_directory) => config.monitoring.log_directory = log_directory,
            Err(e) => {
                println!("❌ Failed to reload configuration: {}", e);
                return;
            }
        }

        if config.llm != self.config.llm {
            self.generator = build_generator(&config);
        }
        self.policy = SafetyPolicy::from_config(&config.safety);
        self.tasks.apply_config(&config.monitoring).await;
        self.config = config;

        info!(path = %self.config_path.display(), "Configuration reloaded");
        println!("✅ Configuration reloaded successfully.");
    }

    fn show_cache_stats(&self) {
        if self.cache.is_empty() {
            println!("📊 No cached commands.");
            return;
        }
        let stats = self.cache.stats(5);
        println!("📊 Command Cache Statistics:");
        println!("  Total cached commands: {}", stats.entries);
        println!("  Total cache hits: {}", stats.total_usage);
        println!("  Commands with cached safety checks: {}", stats.with_assessment);
        println!("  Dangerous commands cached: {}", stats.dangerous);
        println!("  Cache file: {}", self.cache.path().display());
        println!("  Most used:");
        for (request, count) in stats.top {
            println!("    {} ({} uses)", request, count);
        }
    }

    fn clear_cache(&mut self) {
        let question = format!("Clear {} cached commands? (yes/no): ", self.cache.len());
        if !self.confirm(&question) {
            println!("Cache clear cancelled.");
            return;
        }
        self.cache.clear();
        match self.cache.save() {
            Ok(()) => println!("✅ Command cache cleared."),
            Err(e) => println!("❌ Could not save command cache: {}", e),
        }
    }

    async fn teardown(&mut self) {
        println!("Saving command cache...");
        if let Err(e) = self.cache.save() {
            warn!(error = %e, "Failed to save command cache");
            println!("⚠️  Could not save command cache: {}", e);
        }
        self.input.persist();

        let running = self.tasks.running_count().await;
        if running > 0 {
            println!("🛑 Stopping {} background task(s)...", running);
        }
        for warning in self.tasks.shutdown().await {
            println!("⚠️  {}", warning);
        }
        info!("Shell session ended");
    }
}

fn confirm_question(generated: &GeneratedCommand) -> &'static str {
    if generated.is_monitoring() {
        "Start this monitoring task? (yes/no): "
    } else {
        "Execute this command? (yes/no): "
    }
}

fn show_assessment(command: &str, assessment: &RiskAssessment) {
    if !assessment.is_dangerous() {
        println!("{} Risk level: {}", assessment.level.icon(), assessment.level);
        return;
    }

    println!(
        "{} WARNING: This command may be harmful! (risk: {})",
        assessment.level.icon(),
        assessment.level
    );
    if let Some(reason) = &assessment.reason {
        println!("Reason: {}", reason);
    }
    if let Some(suggestion) = &assessment.suggestion {
        println!("Suggestion: {}", suggestion);
    }
    for hint in RiskClassifier::recommendations(command) {
        println!("  💡 {}", hint);
    }
}

fn report_outcome(outcome: &RequestOutcome) {
    match outcome {
        RequestOutcome::GenerationFailed(e) => println!("❌ Could not generate a command, try again ({})", e),
        RequestOutcome::Refused(reason) => println!("🛑 Command refused: {}", reason),
        RequestOutcome::Cancelled => println!("Command cancelled."),
        RequestOutcome::Executed(result) => show_outcome(result),
        RequestOutcome::Started(id) => {
            println!("✅ Background task started with ID: {}", id);
            println!("Use 'tasks' to view tasks, 'task {}' for its output, or 'kill-task {}' to stop it.", id, id);
        }
        RequestOutcome::StartFailed(e) => println!("❌ Failed to start task: {}", e),
    }
}

fn show_outcome(outcome: &CommandOutcome) {
    let code = outcome.exit_code.unwrap_or(-1);
    if outcome.success {
        if outcome.output.trim().is_empty() {
            if code != 0 {
                println!("✅ Command executed successfully. (exit code: {})", code);
            } else {
                println!("✅ Command executed successfully.");
            }
        } else {
            println!("Output:\n{}", outcome.output.trim_end());
            if code != 0 {
                println!("ℹ️  Command completed successfully (exit code: {})", code);
            }
        }
    } else if outcome.timed_out {
        println!("⏱️  Command did not finish in time and was stopped.");
        if !outcome.output.trim().is_empty() {
            println!("{}", outcome.output.trim_end());
        }
        println!("{}", outcome.error.trim_end());
    } else {
        println!("❌ Command failed (exit code: {}):", code);
        if !outcome.output.trim().is_empty() {
            println!("{}", outcome.output.trim_end());
        }
        println!("{}", outcome.error.trim_end());
    }
}

fn print_tail(title: &str, lines: Result<Vec<String>, TaskError>) {
    match lines {
        Ok(lines) if lines.is_empty() => println!("  {}: (empty)", title),
        Ok(lines) => {
            println!("  {}:", title);
            for line in lines {
                println!("    {}", line);
            }
        }
        Err(e) => println!("  {}: unavailable ({})", title, e),
    }
}

fn print_banner() {
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                          AI Shell                            ║");
    println!("║              Natural Language Command Line Interface         ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    println!("Type 'help' for commands, 'exit' to quit");
    println!();
}

#[cfg(test)]
#[path = "scenario.test.rs"]
mod scenario_test;
