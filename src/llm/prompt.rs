use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub system_prompt: String,
    pub user_prompt_template: String,
    pub context_variables: Vec<String>,
}

/// Values substituted into prompt templates
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub request: String,
    pub command: String,
    pub working_directory: String,
    pub platform: String,
    pub recent_history: Vec<String>,
    pub default_interval: u64,
}

impl Default for PromptContext {
    fn default() -> Self {
        Self {
            request: String::new(),
            command: String::new(),
            working_directory: String::new(),
            platform: std::env::consts::OS.to_string(),
            recent_history: Vec::new(),
            default_interval: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum PromptType {
    /// Natural language to a single bash command
    CommandGeneration,
    /// Does the request need a background monitoring task
    TaskClassification,
    /// Long-running monitoring script
    MonitoringScript,
    /// JSON risk opinion on a command
    SafetyReview,
}

pub struct PromptEngine {
    templates: HashMap<PromptType, PromptTemplate>,
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut templates = HashMap::new();

        templates.insert(
            PromptType::CommandGeneration,
            PromptTemplate {
                system_prompt: "You are an expert Unix/Linux command line assistant. Generate commands that output to console by default.".to_string(),
                user_prompt_template: r#"Convert the following natural language request into a precise bash command.

Context:
- Current directory: {{working_directory}}
- Operating System: {{platform}}
{{#if recent_history}}- Recent commands: {{recent_history}}
{{/if}}
Rules:
1. Generate only valid bash commands that work on {{platform}}
2. Use appropriate command options and flags
3. For complex operations, chain commands with pipes or && as needed
4. If the request is ambiguous, choose the most reasonable interpretation
5. Output results to the console unless the user asks for a file
6. Put loops and conditionals on a single line

Examples:
- "show all files one day old" → find . -type f -mtime -1 -ls
- "list python processes that run on GPU" → ps aux | grep python | grep -E "(cuda|gpu|nvidia)"
- "save process list to file" → ps aux > process_list.txt
- "check disk space" → df -h

User request: {{request}}

Generate only the bash command, no explanations:"#.to_string(),
                context_variables: vec![
                    "request".to_string(),
                    "working_directory".to_string(),
                    "platform".to_string(),
                    "recent_history".to_string(),
                ],
            },
        );

        templates.insert(
            PromptType::TaskClassification,
            PromptTemplate {
                system_prompt: "You are an assistant that determines task types.".to_string(),
                user_prompt_template: r#"Determine if the following user request requires a background monitoring task.

User request: {{request}}

Background tasks are needed for:
- Continuous monitoring (CPU, memory, disk usage)
- File/directory watching
- Process monitoring
- Periodic checks and notifications
- Long-running observations

Regular tasks are:
- One-time file operations
- Single command executions
- Immediate information retrieval

Respond with only "true" or "false"."#.to_string(),
                context_variables: vec!["request".to_string()],
            },
        );

        templates.insert(
            PromptType::MonitoringScript,
            PromptTemplate {
                system_prompt: "You are an expert bash script developer specializing in monitoring scripts.".to_string(),
                user_prompt_template: r#"Generate a bash script for continuous monitoring based on the user request.

User request: {{request}}
Base command: {{command}}
Operating System: {{platform}}

Create a bash script that:
1. Declares INTERVAL={{default_interval}} (seconds, adjust if the request implies another rate) near the top
2. Runs in a loop, sleeping $INTERVAL seconds between checks
3. Executes the monitoring command and checks the requested condition
4. Prints timestamped status lines and notifications to standard output
5. Prints errors to standard error
6. Exits cleanly on SIGTERM

Standard output and standard error are already captured to the task's log files.
Any extra files must be written under "$AI_SHELL_TASK_DIR". Never write to /tmp, /var/log, or other system directories.

Generate only the bash script content:"#.to_string(),
                context_variables: vec![
                    "request".to_string(),
                    "command".to_string(),
                    "platform".to_string(),
                    "default_interval".to_string(),
                ],
            },
        );

        templates.insert(
            PromptType::SafetyReview,
            PromptTemplate {
                system_prompt: "You are a cybersecurity expert analyzing bash commands for safety.".to_string(),
                user_prompt_template: r#"Analyze the following bash command for potential safety risks.

Command: {{command}}

Evaluate if this command could:
1. Delete important files or directories
2. Modify system files or permissions
3. Install or remove software
4. Access sensitive information
5. Consume excessive system resources
6. Make irreversible changes
7. Affect network security

For common read-only commands like ls, find, grep, cat, head, tail, ps, mark as not dangerous.

Respond ONLY with a JSON object of this form:
{"is_dangerous": false, "risk_level": "low", "reason": "Safe read-only command", "suggestions": ""}

risk_level is one of low, medium, high, critical.

JSON Response:"#.to_string(),
                context_variables: vec!["command".to_string()],
            },
        );

        Self { templates }
    }

    /// Generate a (system, user) prompt pair for a specific type and context
    pub fn generate_prompt(&self, prompt_type: PromptType, context: &PromptContext) -> Result<(String, String)> {
        let template = self
            .templates
            .get(&prompt_type)
            .ok_or_else(|| anyhow::anyhow!("Unknown prompt type: {:?}", prompt_type))?;

        let system_prompt = template.system_prompt.clone();
        let user_prompt = self.render_template(&template.user_prompt_template, context);

        Ok((system_prompt, user_prompt))
    }

    fn render_template(&self, template: &str, context: &PromptContext) -> String {
        let mut rendered = template.to_string();

        if context.recent_history.is_empty() {
            rendered = self.remove_conditional_block(&rendered, "recent_history");
        } else {
            rendered = rendered.replace("{{#if recent_history}}", "");
            rendered = rendered.replace("{{recent_history}}", &context.recent_history.join("; "));
        }
        rendered = rendered.replace("{{/if}}", "");

        rendered
            .replace("{{working_directory}}", &context.working_directory)
            .replace("{{platform}}", &context.platform)
            .replace("{{default_interval}}", &context.default_interval.to_string())
            .replace("{{command}}", &context.command)
            // Last, so text from the user cannot inject placeholders
            .replace("{{request}}", &context.request)
    }

    /// Remove conditional blocks for missing variables
    fn remove_conditional_block(&self, text: &str, variable: &str) -> String {
        let start_marker = format!("{{{{#if {}}}}}", variable);
        let end_marker = "{{/if}}";

        if let Some(start_pos) = text.find(&start_marker) {
            if let Some(end_pos) = text[start_pos..].find(end_marker) {
                let mut result = text.to_string();
                result.replace_range(start_pos..start_pos + end_pos + end_marker.len(), "");
                return result;
            }
        }

        text.to_string()
    }

    #[cfg(test)]
    pub fn available_prompt_types(&self) -> Vec<PromptType> {
        self.templates.keys().copied().collect()
    }
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}
