use rustyline::Helper;
use rustyline::completion::{Completer, Pair};
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::{ValidationContext, ValidationResult, Validator};

use super::commands::SPECIAL_COMMANDS;

/// Common openings of natural-language requests
const REQUEST_STARTERS: &[&str] = &[
    "show all files",
    "list all",
    "find files",
    "remove files",
    "delete files",
    "copy files",
    "move files",
    "search for",
    "monitor cpu",
    "monitor memory",
    "monitor disk",
    "monitor process",
    "watch folder",
    "track changes",
    "list processes",
    "kill process",
    "start service",
    "stop service",
    "check status",
    "get info about",
    "compress files",
    "extract files",
    "backup folder",
    "sync folders",
];

pub struct ShellHelper {
    task_ids: Vec<String>,
    suggest: bool,
}

impl ShellHelper {
    pub fn new(suggest: bool) -> Self {
        Self {
            task_ids: Vec::new(),
            suggest,
        }
    }

    /// Ids offered after `kill-task ` and `task `
    pub fn set_task_ids(&mut self, ids: Vec<String>) {
        self.task_ids = ids;
    }

    pub fn candidates(&self, partial: &str) -> (usize, Vec<Pair>) {
        let lowered = partial.to_lowercase();

        for prefix in ["kill-task ", "task "] {
            if let Some(id_prefix) = lowered.strip_prefix(prefix) {
                let pairs = self
                    .task_ids
                    .iter()
                    .filter(|id| id.starts_with(id_prefix.trim_start()))
                    .map(|id| Pair {
                        display: format!("{} (task)", id),
                        replacement: id.clone(),
                    })
                    .collect();
                return (partial.len().saturating_sub(id_prefix.trim_start().len()), pairs);
            }
        }

        let trimmed = lowered.trim_start();
        if trimmed.is_empty() {
            return (0, Vec::new());
        }
        let start = partial.len().saturating_sub(trimmed.len());

        let mut pairs: Vec<Pair> = SPECIAL_COMMANDS
            .iter()
            .filter(|cmd| cmd.starts_with(trimmed))
            .map(|cmd| match *cmd {
                "kill-task" | "task" => Pair {
                    display: format!("{} <task-id>", cmd),
                    replacement: format!("{} ", cmd),
                },
                _ => Pair {
                    display: cmd.to_string(),
                    replacement: cmd.to_string(),
                },
            })
            .collect();

        pairs.extend(
            REQUEST_STARTERS
                .iter()
                .filter(|starter| starter.starts_with(trimmed))
                .map(|starter| Pair {
                    display: starter.to_string(),
                    replacement: starter.to_string(),
                }),
        );

        (start, pairs)
    }
}

impl Completer for ShellHelper {
    type Candidate = Pair;

    fn complete(&self, line: &str, pos: usize, _ctx: &rustyline::Context<'_>) -> rustyline::Result<(usize, Vec<Pair>)> {
        Ok(self.candidates(&line[..pos]))
    }
}

impl Hinter for ShellHelper {
    type Hint = String;

    fn hint(&self, line: &str, pos: usize, _ctx: &rustyline::Context<'_>) -> Option<Self::Hint> {
        if !self.suggest || line.len() < 2 || pos < line.len() {
            return None;
        }
        let lowered = line.to_lowercase();
        SPECIAL_COMMANDS
            .iter()
            .chain(REQUEST_STARTERS.iter())
            .find(|candidate| candidate.starts_with(&lowered) && candidate.len() > lowered.len())
            .map(|candidate| candidate[lowered.len()..].to_string())
    }
}

impl Validator for ShellHelper {
    fn validate(&self, _ctx: &mut ValidationContext<'_>) -> rustyline::Result<ValidationResult> {
        Ok(ValidationResult::Valid(None))
    }
}

impl Highlighter for ShellHelper {}

impl Helper for ShellHelper {}
