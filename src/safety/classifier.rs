use serde::{Deserialize, Serialize};

use super::rules::{RiskLevel, RuleSet};

/// Result of classifying a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub reason: Option<String>,
    #[serde(default)]
    pub suggestion: Option<String>,
}

impl RiskAssessment {
    pub fn low() -> Self {
        Self {
            level: RiskLevel::Low,
            reason: None,
            suggestion: None,
        }
    }

    pub fn new(level: RiskLevel, reason: impl Into<String>) -> Self {
        Self {
            level,
            reason: Some(reason.into()),
            suggestion: None,
        }
    }

    pub fn is_dangerous(&self) -> bool {
        self.level > RiskLevel::Low
    }
}

/// Pattern-based risk classification. A pure function of the command and the rule set.
#[derive(Debug, Clone)]
pub struct RiskClassifier {
    rules: RuleSet,
}

impl RiskClassifier {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }

    pub fn with_builtin_rules() -> Result<Self, regex::Error> {
        Ok(Self::new(RuleSet::builtin()?))
    }

    pub fn classify(&self, command: &str) -> RiskAssessment {
        match self.rules.first_match(command) {
            Some(rule) => RiskAssessment {
                level: rule.level,
                reason: Some(rule.reason.clone()),
                suggestion: rule.suggestion.clone(),
            },
            None => RiskAssessment::low(),
        }
    }

    /// Classify each command line of a script; the most severe line wins
    pub fn classify_script(&self, script: &str) -> RiskAssessment {
        script
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| self.classify(line))
            .fold(RiskAssessment::low(), |worst, next| {
                if next.level > worst.level { next } else { worst }
            })
    }

    /// Combine the pattern verdict with an AI opinion: the higher level wins and reasons are joined
    pub fn merge(pattern: &RiskAssessment, ai: &RiskAssessment) -> RiskAssessment {
        let level = pattern.level.max(ai.level);

        let mut reasons = Vec::new();
        if let Some(reason) = &pattern.reason {
            reasons.push(format!("Pattern analysis: {}", reason));
        }
        if let Some(reason) = &ai.reason {
            reasons.push(format!("AI analysis: {}", reason));
        }

        let suggestions: Vec<&str> = [&pattern.suggestion, &ai.suggestion]
            .into_iter()
            .flatten()
            .map(|s| s.as_str())
            .filter(|s| !s.trim().is_empty())
            .collect();

        RiskAssessment {
            level,
            reason: (!reasons.is_empty()).then(|| reasons.join("; ")),
            suggestion: (!suggestions.is_empty()).then(|| suggestions.join("; ")),
        }
    }

    /// General safety hints for the command word
    pub fn recommendations(command: &str) -> Vec<&'static str> {
        let base = base_command(command);

        match base.as_str() {
            "rm" => vec![
                "Consider using 'mv' to move files to a trash directory instead",
                "Always double-check file paths before deletion",
                "Use 'rm -i' for interactive confirmation",
                "Test with 'ls' first to see what would be affected",
            ],
            "chmod" => vec![
                "Avoid using 777 permissions unless absolutely necessary",
                "Be specific about which files/directories to modify",
                "Consider the security implications of permission changes",
            ],
            "chown" => vec![
                "Ensure you have the necessary privileges",
                "Be careful when changing ownership of system files",
                "Test on a small subset first if affecting many files",
            ],
            "shutdown" | "reboot" | "halt" => vec![
                "Save all work before proceeding",
                "Notify other users if this is a shared system",
                "Consider using scheduled shutdown for safety",
            ],
            _ if command.split_whitespace().any(|w| w == "sudo") => vec![
                "Only use sudo when necessary",
                "Understand exactly what the command will do",
                "Avoid running untrusted scripts with sudo",
            ],
            _ => Vec::new(),
        }
    }
}

/// The command word of the first pipeline segment, without its directory or a sudo prefix
pub fn base_command(command: &str) -> String {
    let first = command
        .split(['|', '>', '<', ';', '&'])
        .next()
        .unwrap_or("");

    let mut words = first.split_whitespace();
    let mut word = words.next().unwrap_or("");
    if word == "sudo" {
        word = words.find(|w| !w.starts_with('-')).unwrap_or("");
    }

    word.rsplit('/').next().unwrap_or("").to_string()
}

#[cfg(test)]
#[path = "classifier.test.rs"]
mod classifier_test;
