//! Built-in shell commands that never reach the generator

use crate::task::TaskId;

#[derive(Debug, Clone, PartialEq)]
pub enum SpecialCommand {
    Help,
    Tasks,
    /// `task <id>`: detail plus recent output
    Task(TaskId),
    KillTask(TaskId),
    Config,
    ReloadConfig,
    CacheStats,
    ClearCache,
    Exit,
    /// A built-in name used with the wrong arguments
    Usage(&'static str),
}

pub const SPECIAL_COMMANDS: &[&str] = &[
    "help",
    "exit",
    "quit",
    "tasks",
    "task",
    "kill-task",
    "config",
    "reload-config",
    "cache-stats",
    "clear-cache",
];

impl SpecialCommand {
    /// Parse a line typed at the prompt. `None` means it is a natural-language request.
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        let (head, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (trimmed, ""),
        };
        let head = head.to_lowercase();

        let command = match (head.as_str(), rest.is_empty()) {
            ("help", true) => SpecialCommand::Help,
            ("exit" | "quit", true) => SpecialCommand::Exit,
            ("tasks", true) => SpecialCommand::Tasks,
            ("config", true) => SpecialCommand::Config,
            ("reload-config", true) => SpecialCommand::ReloadConfig,
            ("cache-stats", true) => SpecialCommand::CacheStats,
            ("clear-cache", true) => SpecialCommand::ClearCache,
            ("task", false) if !rest.contains(char::is_whitespace) => SpecialCommand::Task(TaskId::from(rest)),
            ("task", _) => SpecialCommand::Usage("task <id>"),
            ("kill-task", false) if !rest.contains(char::is_whitespace) => {
                SpecialCommand::KillTask(TaskId::from(rest))
            }
            ("kill-task", _) => SpecialCommand::Usage("kill-task <id>"),
            _ => return None,
        };
        Some(command)
    }
}

pub fn help_text() -> &'static str {
    r#"AI Shell Commands:

Basic Usage:
  Just type your request in natural language!

Examples:
  • show all files one day old
  • remove image files in current directory
  • list python processes that run on GPU
  • monitor cpu usage of all python processes
  • monitor folder 'test' and notify if size exceeds 5GB

Special Commands:
  help                    - Show this help
  exit, quit              - Exit AI Shell
  tasks                   - Show background tasks
  task <id>               - Show a task's details and recent output
  kill-task <id>          - Stop a background task
  config                  - Show current configuration
  reload-config           - Reload configuration file
  cache-stats             - Show command cache statistics
  clear-cache             - Clear command cache

Safety Features:
  • Every command is classified for risk before execution
  • Confirmation is required before anything runs
  • Blocked and critical commands are refused outright
  • Background tasks can be inspected and stopped at any time"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_commands() {
        assert_eq!(SpecialCommand::parse("help"), Some(SpecialCommand::Help));
        assert_eq!(SpecialCommand::parse("  TASKS  "), Some(SpecialCommand::Tasks));
        assert_eq!(SpecialCommand::parse("quit"), Some(SpecialCommand::Exit));
        assert_eq!(SpecialCommand::parse("exit"), Some(SpecialCommand::Exit));
        assert_eq!(SpecialCommand::parse("reload-config"), Some(SpecialCommand::ReloadConfig));
        assert_eq!(SpecialCommand::parse("cache-stats"), Some(SpecialCommand::CacheStats));
        assert_eq!(SpecialCommand::parse("clear-cache"), Some(SpecialCommand::ClearCache));
        assert_eq!(SpecialCommand::parse("config"), Some(SpecialCommand::Config));
    }

    #[test]
    fn test_task_commands_take_an_id() {
        assert_eq!(
            SpecialCommand::parse("kill-task ab12cd34"),
            Some(SpecialCommand::KillTask(TaskId::from("ab12cd34")))
        );
        assert_eq!(
            SpecialCommand::parse("task   ab12cd34 "),
            Some(SpecialCommand::Task(TaskId::from("ab12cd34")))
        );
        assert_eq!(
            SpecialCommand::parse("kill-task"),
            Some(SpecialCommand::Usage("kill-task <id>"))
        );
        assert_eq!(
            SpecialCommand::parse("task one two"),
            Some(SpecialCommand::Usage("task <id>"))
        );
    }

    #[test]
    fn test_natural_language_passes_through() {
        assert_eq!(SpecialCommand::parse("show all files"), None);
        assert_eq!(SpecialCommand::parse("help me find large files"), None);
        assert_eq!(SpecialCommand::parse("config files in /etc"), None);
        assert_eq!(SpecialCommand::parse("tasks running as root"), None);
        assert_eq!(SpecialCommand::parse(""), None);
    }

    #[test]
    fn test_help_lists_every_command() {
        let help = help_text();
        for name in ["tasks", "task <id>", "kill-task <id>", "reload-config", "cache-stats", "clear-cache"] {
            assert!(help.contains(name), "help is missing {}", name);
        }
    }
}
