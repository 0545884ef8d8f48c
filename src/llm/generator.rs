//! Command and script generation on top of the LLM client
//!
//! The shell only talks to the [`CommandGenerator`] trait, so tests can swap the
//! network-backed [`LlmGenerator`] for a scripted stand-in.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::llm::client::{LlmClient, LlmRequest};
use crate::llm::error_handler::LlmError;
use crate::llm::prompt::{PromptContext, PromptEngine, PromptType};
use crate::safety::{RiskAssessment, RiskLevel};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("LLM is not available: {0}")]
    Unavailable(String),

    #[error("LLM request failed: {0}")]
    Request(String),

    #[error("Malformed LLM response: {0}")]
    Malformed(String),
}

impl From<LlmError> for GenerationError {
    fn from(error: LlmError) -> Self {
        match error {
            LlmError::ParseError { message, .. } => GenerationError::Malformed(message),
            other => GenerationError::Request(other.to_string()),
        }
    }
}

/// What the generator proposes for a request
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratedCommand {
    OneShot {
        command: String,
    },
    Monitoring {
        /// The underlying check the script repeats
        command: String,
        script: String,
        /// Suggested seconds between iterations
        interval: u64,
    },
}

impl GeneratedCommand {
    pub fn is_monitoring(&self) -> bool {
        matches!(self, GeneratedCommand::Monitoring { .. })
    }

    /// The text that goes through the safety gate
    pub fn text(&self) -> &str {
        match self {
            GeneratedCommand::OneShot { command } => command,
            GeneratedCommand::Monitoring { script, .. } => script,
        }
    }
}

/// Session facts the generator may use
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub working_directory: String,
    pub platform: String,
    pub recent_history: Vec<String>,
    pub default_interval: u64,
}

impl GenerationContext {
    pub fn current(recent_history: Vec<String>, default_interval: u64) -> Self {
        Self {
            working_directory: std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| ".".to_string()),
            platform: std::env::consts::OS.to_string(),
            recent_history,
            default_interval,
        }
    }

    fn prompt_context(&self, request: &str, command: &str) -> PromptContext {
        PromptContext {
            request: request.to_string(),
            command: command.to_string(),
            working_directory: self.working_directory.clone(),
            platform: self.platform.clone(),
            recent_history: self.recent_history.clone(),
            default_interval: self.default_interval,
        }
    }
}

#[async_trait]
pub trait CommandGenerator: Send + Sync {
    async fn generate(
        &self,
        request: &str,
        context: &GenerationContext,
    ) -> Result<GeneratedCommand, GenerationError>;

    /// AI opinion on a command's risk
    async fn review(&self, command: &str) -> Result<RiskAssessment, GenerationError>;
}

/// A single text completion. Implemented by the HTTP client and by test doubles.
#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(&self, system_prompt: &str, prompt: &str) -> Result<String, LlmError>;
}

#[async_trait]
impl Completion for LlmClient {
    async fn complete(&self, system_prompt: &str, prompt: &str) -> Result<String, LlmError> {
        let response = self
            .generate(LlmRequest {
                prompt: prompt.to_string(),
                max_tokens: None,
                temperature: None,
                system_prompt: Some(system_prompt.to_string()),
            })
            .await?;
        Ok(response.content)
    }
}

#[async_trait]
impl<T: Completion> Completion for Arc<T> {
    async fn complete(&self, system_prompt: &str, prompt: &str) -> Result<String, LlmError> {
        self.as_ref().complete(system_prompt, prompt).await
    }
}

pub struct LlmGenerator<C = LlmClient> {
    completion: C,
    prompts: PromptEngine,
}

impl<C: Completion> LlmGenerator<C> {
    pub fn new(completion: C) -> Self {
        Self {
            completion,
            prompts: PromptEngine::new(),
        }
    }

    async fn ask(&self, prompt_type: PromptType, context: &PromptContext) -> Result<String, GenerationError> {
        let (system, user) = self
            .prompts
            .generate_prompt(prompt_type, context)
            .map_err(|e| GenerationError::Unavailable(e.to_string()))?;
        debug!(?prompt_type, "Sending prompt");
        Ok(self.completion.complete(&system, &user).await?)
    }

    async fn needs_background_task(&self, context: &PromptContext) -> bool {
        match self.ask(PromptType::TaskClassification, context).await {
            Ok(answer) => parse_bool_answer(&answer),
            Err(e) => {
                warn!(error = %e, "Task classification failed, treating request as one-shot");
                false
            }
        }
    }
}

#[async_trait]
impl<C: Completion> CommandGenerator for LlmGenerator<C> {
    async fn generate(
        &self,
        request: &str,
        context: &GenerationContext,
    ) -> Result<GeneratedCommand, GenerationError> {
        let prompt_context = context.prompt_context(request, "");
        let raw = self.ask(PromptType::CommandGeneration, &prompt_context).await?;
        let command = clean_bash_command(&raw)
            .ok_or_else(|| GenerationError::Malformed("response contained no command".to_string()))?;

        if !self.needs_background_task(&prompt_context).await {
            info!(command = %command, "Generated one-shot command");
            return Ok(GeneratedCommand::OneShot { command });
        }

        let script_context = context.prompt_context(request, &command);
        let raw_script = self.ask(PromptType::MonitoringScript, &script_context).await?;
        let script = clean_script(&raw_script)
            .ok_or_else(|| GenerationError::Malformed("response contained no script".to_string()))?;
        let interval = parse_interval(&script).unwrap_or(context.default_interval);

        info!(command = %command, interval, "Generated monitoring script");
        Ok(GeneratedCommand::Monitoring {
            command,
            script,
            interval,
        })
    }

    async fn review(&self, command: &str) -> Result<RiskAssessment, GenerationError> {
        let context = PromptContext {
            command: command.to_string(),
            ..Default::default()
        };
        let raw = self.ask(PromptType::SafetyReview, &context).await?;
        Ok(parse_safety_response(&raw))
    }
}

fn strip_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// First line of the response that looks like a command
pub fn clean_bash_command(response: &str) -> Option<String> {
    strip_fences(response)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with("//"))
        .map(|line| line.trim_matches('`').trim().to_string())
        .filter(|line| !line.is_empty())
}

/// Script body without markdown fences
pub fn clean_script(response: &str) -> Option<String> {
    let body = strip_fences(response);
    let trimmed = body.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(format!("{}\n", trimmed))
    }
}

/// Value of an `INTERVAL=` assignment in the script, if any
pub fn parse_interval(script: &str) -> Option<u64> {
    let re = Regex::new(r#"(?m)^\s*(?:(?:readonly|export|declare|local)\s+(?:-\w+\s+)*)?INTERVAL=["']?(\d+)"#).ok()?;
    re.captures(script)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .filter(|interval| *interval > 0)
}

pub fn parse_bool_answer(answer: &str) -> bool {
    answer
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '.' || c == '`')
        .eq_ignore_ascii_case("true")
}

#[derive(Debug, Deserialize)]
struct SafetyReply {
    #[serde(default)]
    is_dangerous: bool,
    #[serde(default)]
    risk_level: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    suggestions: Option<String>,
}

/// Read the model's JSON opinion, falling back to keyword spotting for prose answers
pub fn parse_safety_response(response: &str) -> RiskAssessment {
    let json = match (response.find('{'), response.rfind('}')) {
        (Some(start), Some(end)) if start < end => Some(&response[start..=end]),
        _ => None,
    };

    if let Some(reply) = json.and_then(|j| serde_json::from_str::<SafetyReply>(j).ok()) {
        let level = reply
            .risk_level
            .as_deref()
            .and_then(|l| l.parse::<RiskLevel>().ok())
            .unwrap_or(if reply.is_dangerous {
                RiskLevel::Medium
            } else {
                RiskLevel::Low
            });
        return RiskAssessment {
            level,
            reason: reply.reason.filter(|r| !r.trim().is_empty()),
            suggestion: reply.suggestions.filter(|s| !s.trim().is_empty()),
        };
    }

    let lowered = response.to_lowercase();
    if ["dangerous", "harmful", "risky", "destructive"]
        .iter()
        .any(|w| lowered.contains(w))
    {
        let mut assessment = RiskAssessment::new(
            RiskLevel::Medium,
            "LLM analysis indicates potential risks (non-JSON response)",
        );
        assessment.suggestion = Some("Please review the command manually".to_string());
        assessment
    } else if ["safe", "harmless", "low risk", "no danger"]
        .iter()
        .any(|w| lowered.contains(w))
    {
        RiskAssessment::new(RiskLevel::Low, "LLM analysis indicates safe command (non-JSON response)")
    } else {
        RiskAssessment::new(RiskLevel::Low, "Unable to parse LLM safety analysis")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_bash_command() {
        assert_eq!(clean_bash_command("df -h").as_deref(), Some("df -h"));
        assert_eq!(
            clean_bash_command("```bash\nls -la\n```").as_deref(),
            Some("ls -la")
        );
        assert_eq!(
            clean_bash_command("# list files\nls -la\nThis lists files").as_deref(),
            Some("ls -la")
        );
        assert_eq!(clean_bash_command("`pwd`").as_deref(), Some("pwd"));
        assert_eq!(clean_bash_command("```\n```"), None);
        assert_eq!(clean_bash_command("   "), None);
    }

    #[test]
    fn test_clean_script_keeps_body() {
        let script = clean_script("```bash\n#!/bin/bash\nINTERVAL=5\nwhile true; do\n  date\n  sleep $INTERVAL\ndone\n```").unwrap();
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("while true; do"));
        assert!(!script.contains("```"));
        assert!(clean_script("```\n\n```").is_none());
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("#!/bin/bash\nINTERVAL=30\n"), Some(30));
        assert_eq!(parse_interval("readonly INTERVAL=\"15\"\n"), Some(15));
        assert_eq!(parse_interval("declare -i INTERVAL=7\n"), Some(7));
        assert_eq!(parse_interval("CHECK_INTERVAL=9\n"), None);
        assert_eq!(parse_interval("INTERVAL=0\n"), None);
        assert_eq!(parse_interval("sleep 5\n"), None);
    }

    #[test]
    fn test_parse_bool_answer() {
        assert!(parse_bool_answer("true"));
        assert!(parse_bool_answer(" True.\n"));
        assert!(parse_bool_answer("\"true\""));
        assert!(!parse_bool_answer("false"));
        assert!(!parse_bool_answer("I think true"));
    }

    #[test]
    fn test_parse_safety_json() {
        let assessment = parse_safety_response(
            r#"Here you go: {"is_dangerous": true, "risk_level": "high", "reason": "Deletes files", "suggestions": "Use -i"}"#,
        );
        assert_eq!(assessment.level, RiskLevel::High);
        assert_eq!(assessment.reason.as_deref(), Some("Deletes files"));
        assert_eq!(assessment.suggestion.as_deref(), Some("Use -i"));
    }

    #[test]
    fn test_parse_safety_json_unknown_level() {
        let dangerous = parse_safety_response(r#"{"is_dangerous": true, "risk_level": "spicy"}"#);
        assert_eq!(dangerous.level, RiskLevel::Medium);

        let safe = parse_safety_response(r#"{"is_dangerous": false}"#);
        assert_eq!(safe.level, RiskLevel::Low);
        assert!(safe.reason.is_none());
    }

    #[test]
    fn test_parse_safety_prose_fallback() {
        assert_eq!(parse_safety_response("This is potentially destructive").level, RiskLevel::Medium);
        assert_eq!(parse_safety_response("The command is harmless").level, RiskLevel::Low);
        let unknown = parse_safety_response("¯\\_(ツ)_/¯");
        assert_eq!(unknown.level, RiskLevel::Low);
        assert_eq!(unknown.reason.as_deref(), Some("Unable to parse LLM safety analysis"));
    }

    #[test]
    fn test_generated_command_text() {
        let one_shot = GeneratedCommand::OneShot {
            command: "df -h".to_string(),
        };
        assert_eq!(one_shot.text(), "df -h");
        assert!(!one_shot.is_monitoring());

        let monitoring = GeneratedCommand::Monitoring {
            command: "df -h".to_string(),
            script: "while true; do df -h; sleep 5; done\n".to_string(),
            interval: 5,
        };
        assert!(monitoring.is_monitoring());
        assert!(monitoring.text().starts_with("while true"));
    }

    #[test]
    fn test_llm_error_conversion() {
        let parse = LlmError::ParseError {
            provider: "openai".to_string(),
            message: "bad json".to_string(),
        };
        assert_eq!(GenerationError::from(parse), GenerationError::Malformed("bad json".to_string()));

        let auth = LlmError::AuthenticationError {
            provider: "openai".to_string(),
            message: "401".to_string(),
        };
        assert!(matches!(GenerationError::from(auth), GenerationError::Request(_)));
    }
}
