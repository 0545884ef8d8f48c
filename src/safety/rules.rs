use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Coarse classification of how damaging a command could be
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            RiskLevel::Low => "🟢",
            RiskLevel::Medium => "🟡",
            RiskLevel::High => "🟠",
            RiskLevel::Critical => "🔴",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" | "none" | "safe" => Ok(RiskLevel::Low),
            "medium" | "moderate" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" | "severe" => Ok(RiskLevel::Critical),
            other => Err(format!("Unknown risk level: {}", other)),
        }
    }
}

/// One entry of the ordered rule set
#[derive(Debug, Clone)]
pub struct RiskRule {
    pub pattern: Regex,
    pub level: RiskLevel,
    pub reason: String,
    pub suggestion: Option<String>,
}

impl RiskRule {
    pub fn new(pattern: &str, level: RiskLevel, reason: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            level,
            reason: reason.to_string(),
            suggestion: None,
        })
    }

    pub fn with_suggestion(mut self, suggestion: &str) -> Self {
        self.suggestion = Some(suggestion.to_string());
        self
    }

    pub fn matches(&self, command: &str) -> bool {
        self.pattern.is_match(command)
    }
}

/// Ordered list of rules. The first match decides.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<RiskRule>,
}

/// Binaries that warrant a closer look wherever they appear as the command word
pub const HIGH_RISK_COMMANDS: &[&str] = &[
    "rm", "rmdir", "shred", "dd", "mkfs", "fdisk", "parted", "gparted", "wipefs", "chmod",
    "chown", "usermod", "userdel", "groupdel", "passwd", "shutdown", "reboot", "halt", "init",
];

/// System directories whose modification is high risk
pub const CRITICAL_PATHS: &[&str] = &[
    "/", "/bin", "/boot", "/dev", "/etc", "/lib", "/lib64", "/proc", "/root", "/sbin", "/sys",
    "/usr", "/var", "/home",
];

pub const DESTRUCTIVE_KEYWORDS: &[&str] = &["delete", "remove", "destroy", "wipe", "format", "erase"];

/// Where a command word may start: line start, after a separator, after sudo, or as
/// the target of `find -exec` and `xargs`
const COMMAND_START: &str = r"(?:^|[;&|(`]|\$\(|-exec(?:dir)?\s|\bxargs(?:\s+-\S+)*\s)\s*(?:sudo\s+(?:-\S+\s+)*)?(?:[^\s;&|]*/)?";

fn critical_path_argument() -> String {
    let dirs: Vec<&str> = CRITICAL_PATHS
        .iter()
        .filter(|p| **p != "/" && **p != "/dev")
        .map(|p| p.trim_start_matches('/'))
        .collect();
    // The root itself, a system directory or anything beneath it, or /dev and its disks.
    // Pseudo devices such as /dev/null stay out.
    format!(
        r#"(?:^|[\s="'])(?:/\*?|/(?:{})(?:/\S*)?|/dev(?:/(?:[hsv]d|nvme|mmcblk|disk|mapper)\S*)?)(?:[\s;&|)"']|$)"#,
        dirs.join("|")
    )
}

fn command_word(names: &[&str]) -> String {
    format!(r"{}(?:{})(?:\s|$|;)", COMMAND_START, names.join("|"))
}

/// A command word followed somewhere later by `tail`
fn command_then(names: &[&str], tail: &str) -> String {
    format!(r"{}(?:{})\b.*{}", COMMAND_START, names.join("|"), tail)
}

impl RuleSet {
    #[cfg(test)]
    pub fn new(rules: Vec<RiskRule>) -> Self {
        Self { rules }
    }

    /// Built-in rules, most severe first
    pub fn builtin() -> Result<Self, regex::Error> {
        let critical_arg = critical_path_argument();
        let high_risk = command_word(HIGH_RISK_COMMANDS);
        let writers = ["mv", "cp", "ln", "tee", "truncate", "install", "sed\\s+-i"];

        let destructive = "This command could cause severe system damage. Avoid running it.";

        let rules = vec![
            RiskRule::new(
                r"(?i)\brm\s+(?:-\S+\s+)*-[a-z]*(?:rf|fr)[a-z]*\s+(?:-\S+\s+)*/\*?(?:\s|$)",
                RiskLevel::Critical,
                "Recursive forced removal of the root filesystem",
            )?
            .with_suggestion(destructive),
            RiskRule::new(
                r"(?i)--no-preserve-root",
                RiskLevel::Critical,
                "Disables the root filesystem safeguard",
            )?
            .with_suggestion(destructive),
            RiskRule::new(
                r"(?i)\bchmod\s+-R\s+777\s+/(?:\s|$)",
                RiskLevel::Critical,
                "Makes the whole filesystem world-writable",
            )?
            .with_suggestion(destructive),
            RiskRule::new(
                r"(?i)\bdd\s+.*\bof=/dev/(?:[hsv]d[a-z]|nvme\d|mmcblk\d)",
                RiskLevel::Critical,
                "Writes raw data onto a disk device",
            )?
            .with_suggestion(destructive),
            RiskRule::new(
                r">\s*/dev/(?:[hsv]d[a-z]|nvme\d|mmcblk\d)",
                RiskLevel::Critical,
                "Redirects output onto a disk device",
            )?
            .with_suggestion(destructive),
            RiskRule::new(
                r":\s*\(\s*\)\s*\{.*\}",
                RiskLevel::Critical,
                "Fork bomb",
            )?
            .with_suggestion(destructive),
            RiskRule::new(r"(?i)\bmkfs(?:\.\w+)?\s", RiskLevel::Critical, "Formats a filesystem")?
                .with_suggestion(destructive),
            RiskRule::new(r"(?i)\bfdisk\b.*--delete", RiskLevel::Critical, "Deletes disk partitions")?
                .with_suggestion(destructive),
            RiskRule::new(r"(?i)\bshred\b.*/", RiskLevel::Critical, "Irrecoverably shreds files")?
                .with_suggestion(destructive),
            RiskRule::new(r"(?i)\bwipefs\b", RiskLevel::Critical, "Wipes filesystem signatures")?
                .with_suggestion(destructive),
            RiskRule::new(
                &command_then(HIGH_RISK_COMMANDS, &critical_arg),
                RiskLevel::High,
                "High-risk command affecting critical system paths",
            )?
            .with_suggestion("Double-check the target paths and consider using more specific paths"),
            RiskRule::new(
                &format!(r">{{1,2}}\s*{}", critical_arg.trim_start_matches(r#"(?:^|[\s="'])"#)),
                RiskLevel::High,
                "Redirects output into a critical system directory",
            )?
            .with_suggestion("Ensure you're targeting the correct directories"),
            RiskRule::new(
                &command_then(&writers, &critical_arg),
                RiskLevel::High,
                "Command may modify critical system directories",
            )?
            .with_suggestion("Ensure you're targeting the correct directories"),
            RiskRule::new(&high_risk, RiskLevel::Medium, "High-risk command detected")?
                .with_suggestion("Review the command carefully before execution"),
            RiskRule::new(
                &format!(r"(?i)\b(?:{})\b", DESTRUCTIVE_KEYWORDS.join("|")),
                RiskLevel::Medium,
                "Command contains potentially destructive keywords",
            )?
            .with_suggestion("Verify the target files/directories before proceeding"),
        ];

        Ok(Self { rules })
    }

    pub fn first_match(&self, command: &str) -> Option<&RiskRule> {
        self.rules.iter().find(|rule| rule.matches(command))
    }

    #[cfg(test)]
    pub fn rules(&self) -> &[RiskRule] {
        &self.rules
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_ordering() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert!(RiskLevel::High < RiskLevel::Critical);
        assert_eq!(RiskLevel::Medium.max(RiskLevel::High), RiskLevel::High);
    }

    #[test]
    fn test_risk_level_parsing() {
        assert_eq!("LOW".parse::<RiskLevel>().unwrap(), RiskLevel::Low);
        assert_eq!(" critical ".parse::<RiskLevel>().unwrap(), RiskLevel::Critical);
        assert_eq!("moderate".parse::<RiskLevel>().unwrap(), RiskLevel::Medium);
        assert!("catastrophic".parse::<RiskLevel>().is_err());
    }

    #[test]
    fn test_risk_level_serde_is_lowercase() {
        assert_eq!(serde_json::to_string(&RiskLevel::High).unwrap(), "\"high\"");
        let level: RiskLevel = serde_json::from_str("\"medium\"").unwrap();
        assert_eq!(level, RiskLevel::Medium);
    }

    #[test]
    fn test_builtin_rules_compile() {
        let rules = RuleSet::builtin().unwrap();
        assert!(!rules.is_empty());
        // Most severe rules come first
        assert_eq!(rules.rules()[0].level, RiskLevel::Critical);
        let levels: Vec<RiskLevel> = rules.rules().iter().map(|r| r.level).collect();
        let mut sorted = levels.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(levels, sorted);
    }

    #[test]
    fn test_first_match_wins() {
        let rules = RuleSet::new(vec![
            RiskRule::new("foo", RiskLevel::High, "first").unwrap(),
            RiskRule::new("foo bar", RiskLevel::Critical, "second").unwrap(),
        ]);
        let hit = rules.first_match("foo bar").unwrap();
        assert_eq!(hit.reason, "first");
        assert!(rules.first_match("baz").is_none());
    }

    #[test]
    fn test_critical_path_argument() {
        let re = Regex::new(&critical_path_argument()).unwrap();
        assert!(re.is_match("rm -r /etc"));
        assert!(re.is_match("rm -r /etc/nginx/conf.d"));
        assert!(re.is_match("rm -rf /"));
        assert!(re.is_match("chown user /home"));
        assert!(!re.is_match("rm -r /tmp/build"));
        assert!(!re.is_match("rm -r ./etc"));
        assert!(!re.is_match("rm notes.txt"));
        assert!(!re.is_match("find . -name x 2> /dev/null"));
        assert!(re.is_match("dd if=x of= /dev/sdb"));
        assert!(re.is_match("rm -r /dev"));
    }
}
