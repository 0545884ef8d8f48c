use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Full application configuration, one section per YAML top-level key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSettings,
    pub safety: SafetySettings,
    pub monitoring: MonitoringSettings,
    pub shell: ShellSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub provider: String,
    pub model: String,
    pub api_key: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Request timeout in seconds
    pub timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-3.5-turbo".to_string(),
            api_key: String::new(),
            temperature: 0.1,
            max_tokens: 1000,
            timeout: 30,
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetySettings {
    pub always_confirm: bool,
    pub dangerous_commands_require_explicit_confirm: bool,
    /// Literal strings; any command containing one is refused outright
    pub blocked_commands: Vec<String>,
    /// Ask the LLM for a second opinion on top of the rule set
    pub ai_review: bool,
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            always_confirm: true,
            dangerous_commands_require_explicit_confirm: true,
            blocked_commands: Vec::new(),
            ai_review: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    /// Seconds between iterations of a monitoring script
    pub default_interval: u64,
    pub max_background_tasks: usize,
    pub log_directory: PathBuf,
    /// Seconds to wait after SIGTERM before sending SIGKILL
    pub stop_grace_period: u64,
    pub notifications: NotificationSettings,
    pub task_logging: TaskLoggingSettings,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            default_interval: 5,
            max_background_tasks: 10,
            log_directory: PathBuf::from("logs/"),
            stop_grace_period: 5,
            notifications: NotificationSettings::default(),
            task_logging: TaskLoggingSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub enabled: bool,
    pub method: String,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            method: "console".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskLoggingSettings {
    pub max_log_file_size_mb: u64,
    pub max_log_files: usize,
}

impl Default for TaskLoggingSettings {
    fn default() -> Self {
        Self {
            max_log_file_size_mb: 10,
            max_log_files: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellSettings {
    pub prompt_style: String,
    pub history_size: usize,
    pub auto_suggest: bool,
    pub colored_output: bool,
    /// Seconds before a one-shot command is killed
    pub command_timeout: u64,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            prompt_style: "ai-shell".to_string(),
            history_size: 1000,
            auto_suggest: true,
            colored_output: true,
            command_timeout: 60,
        }
    }
}

/// Where the configuration came from, so it can be reloaded from the same place.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub path: PathBuf,
    pub created_default: bool,
}

impl AppConfig {
    /// Default configuration written to disk on first run. Carries a starter block-list.
    pub fn starter() -> Self {
        let mut config = Self::default();
        config.safety.blocked_commands = vec![
            "rm -rf /".to_string(),
            "chmod -R 777 /".to_string(),
            "dd if=/dev/zero of=/dev/sda".to_string(),
        ];
        config
    }

    /// Locate the configuration file, creating a default one if none exists.
    pub fn locate(explicit: Option<&Path>) -> Result<ConfigSource> {
        if let Some(path) = explicit {
            return Ok(ConfigSource {
                path: path.to_path_buf(),
                created_default: false,
            });
        }

        for candidate in Self::search_paths() {
            if candidate.exists() {
                debug!(path = %candidate.display(), "Found configuration file");
                return Ok(ConfigSource {
                    path: candidate,
                    created_default: false,
                });
            }
        }

        let path = PathBuf::from("config.yaml");
        Self::starter().save(&path)?;
        info!(path = %path.display(), "Created default configuration file");
        Ok(ConfigSource {
            path,
            created_default: true,
        })
    }

    /// Candidate locations in priority order
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("config.yaml"), PathBuf::from("config.yml")];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".ai_shell").join("config.yaml"));
            paths.push(home.join(".ai_shell_config.yaml"));
        }
        paths
    }

    /// Load configuration from a YAML file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)
                .map_err(|e| anyhow!("Cannot read config {}: {}", path.display(), e))?;
            Self::from_yaml(&content)?
        } else {
            warn!(path = %path.display(), "Configuration file missing, using defaults");
            Self::default()
        };

        config.apply_env_fallbacks();
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| anyhow!("Invalid configuration: {}", e))
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)?;

        // The file may carry an API key
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    /// Fill an empty API key from the provider's conventional environment variable
    pub fn apply_env_fallbacks(&mut self) {
        if !self.llm.api_key.trim().is_empty() {
            return;
        }
        if let Some(var) = Self::api_key_env_var(&self.llm.provider) {
            if let Ok(key) = env::var(var) {
                self.llm.api_key = key;
            }
        }
    }

    pub fn api_key_env_var(provider: &str) -> Option<&'static str> {
        match provider.to_lowercase().as_str() {
            "openai" | "chatgpt" => Some("OPENAI_API_KEY"),
            "anthropic" | "claude" => Some("ANTHROPIC_API_KEY"),
            "ollama" => Some("OLLAMA_API_KEY"),
            _ => None,
        }
    }

    /// Validate configuration, returning human-readable warnings
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.llm.api_key.trim().is_empty() && self.llm.provider.to_lowercase() != "ollama" {
            warnings.push(format!("No API key configured for provider '{}'", self.llm.provider));
        }
        if self.llm.model.trim().is_empty() {
            warnings.push("No LLM model configured".to_string());
        }
        if crate::llm::client::LlmProvider::from_str(&self.llm.provider).is_err() {
            warnings.push(format!("Unsupported LLM provider: '{}'", self.llm.provider));
        }
        if self.monitoring.max_background_tasks == 0 {
            warnings.push("monitoring.max_background_tasks is 0; background tasks are disabled".to_string());
        }
        if self.monitoring.default_interval == 0 {
            warnings.push("monitoring.default_interval is 0".to_string());
        }

        warnings
    }

    /// Whether a generator can be built from this configuration
    pub fn is_llm_configured(&self) -> bool {
        crate::llm::client::LlmProvider::from_str(&self.llm.provider).is_ok()
            && (!self.llm.api_key.trim().is_empty() || self.llm.provider.eq_ignore_ascii_case("ollama"))
    }

    /// Create the log directory and check that it is writable
    pub fn prepare_log_directory(&self) -> Result<PathBuf> {
        let dir = &self.monitoring.log_directory;
        fs::create_dir_all(dir)
            .map_err(|e| anyhow!("Failed to create log directory '{}': {}", dir.display(), e))?;

        let marker = dir.join(".ai_shell_write_test");
        fs::write(&marker, b"test")
            .map_err(|e| anyhow!("Cannot write to log directory {}: {}", dir.display(), e))?;
        let _ = fs::remove_file(&marker);

        Ok(fs::canonicalize(dir).unwrap_or_else(|_| dir.clone()))
    }

    /// A copy safe to print: the API key is reduced to a short prefix
    pub fn masked(&self) -> Self {
        let mut copy = self.clone();
        copy.llm.api_key = mask_secret(&self.llm.api_key);
        copy
    }

    /// Render the masked configuration as YAML for display
    pub fn render_masked(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.masked())?)
    }
}

pub fn mask_secret(secret: &str) -> String {
    if secret.is_empty() {
        String::new()
    } else if secret.chars().count() > 8 {
        format!("{}...", secret.chars().take(8).collect::<String>())
    } else {
        "***".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.llm.provider, "openai");
        assert_eq!(config.llm.max_tokens, 1000);
        assert!(config.safety.always_confirm);
        assert!(config.safety.blocked_commands.is_empty());
        assert_eq!(config.monitoring.default_interval, 5);
        assert_eq!(config.monitoring.max_background_tasks, 10);
        assert_eq!(config.monitoring.log_directory, PathBuf::from("logs/"));
        assert_eq!(config.monitoring.notifications.method, "console");
        assert_eq!(config.shell.history_size, 1000);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
llm:
  provider: anthropic
  model: claude-3-haiku
monitoring:
  max_background_tasks: 2
  notifications:
    enabled: false
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.llm.provider, "anthropic");
        assert_eq!(config.llm.model, "claude-3-haiku");
        assert_eq!(config.llm.timeout, 30);
        assert_eq!(config.monitoring.max_background_tasks, 2);
        assert_eq!(config.monitoring.default_interval, 5);
        assert!(!config.monitoring.notifications.enabled);
        assert_eq!(config.monitoring.notifications.method, "console");
        assert!(config.safety.dangerous_commands_require_explicit_confirm);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(AppConfig::from_yaml("").unwrap(), AppConfig::default());
        assert_eq!(AppConfig::from_yaml("   \n").unwrap(), AppConfig::default());
    }

    #[test]
    fn test_invalid_yaml_is_error() {
        assert!(AppConfig::from_yaml("llm: [unterminated").is_err());
        assert!(AppConfig::from_yaml("monitoring:\n  max_background_tasks: many").is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let mut config = AppConfig::starter();
        config.llm.api_key = "sk-test-key".to_string();
        config.monitoring.max_background_tasks = 3;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.safety.blocked_commands.len(), 3);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::load(&dir.path().join("absent.yaml")).unwrap();
        config.llm.api_key.clear();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_api_key_env_var_mapping() {
        assert_eq!(AppConfig::api_key_env_var("openai"), Some("OPENAI_API_KEY"));
        assert_eq!(AppConfig::api_key_env_var("Anthropic"), Some("ANTHROPIC_API_KEY"));
        assert_eq!(AppConfig::api_key_env_var("unknown"), None);
    }

    #[test]
    fn test_explicit_key_is_not_overridden() {
        let mut config = AppConfig::default();
        config.llm.api_key = "from-file".to_string();
        config.apply_env_fallbacks();
        assert_eq!(config.llm.api_key, "from-file");
    }

    #[test]
    fn test_masking() {
        assert_eq!(mask_secret(""), "");
        assert_eq!(mask_secret("short"), "***");
        assert_eq!(mask_secret("sk-1234567890abcdef"), "sk-12345...");

        let mut config = AppConfig::default();
        config.llm.api_key = "sk-1234567890abcdef".to_string();
        let rendered = config.render_masked().unwrap();
        assert!(rendered.contains("sk-12345..."));
        assert!(!rendered.contains("abcdef"));
        // The original stays intact
        assert_eq!(config.llm.api_key, "sk-1234567890abcdef");
    }

    #[test]
    fn test_validation() {
        let mut config = AppConfig::default();
        config.llm.api_key.clear();
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("No API key")));

        config.llm.api_key = "key".to_string();
        config.llm.provider = "mystery".to_string();
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("Unsupported LLM provider")));
        assert!(!config.is_llm_configured());

        config.llm.provider = "openai".to_string();
        assert!(config.validate().is_empty());
        assert!(config.is_llm_configured());
    }

    #[test]
    fn test_prepare_log_directory() {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::default();
        config.monitoring.log_directory = dir.path().join("logs");

        let resolved = config.prepare_log_directory().unwrap();
        assert!(resolved.is_dir());
        assert!(!resolved.join(".ai_shell_write_test").exists());
    }
}
