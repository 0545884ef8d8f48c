use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

mod config;
mod exec;
mod llm;
mod logging;
mod safety;
mod shell;
mod task;

use config::AppConfig;
use shell::{CommandCache, EditorSource, Shell, build_generator, spawn_teardown_on_signal};

#[derive(Parser)]
#[command(name = "ai-shell")]
#[command(about = "🤖 AI Shell - Natural Language Command Line Interface")]
#[command(long_about = "Type what you want in plain language. AI Shell turns it into a bash command or a
background monitoring script, checks it for risk, and runs it after you confirm.")]
#[command(version)]
#[command(help_template = "{before-help}{name} {version}
{about}

{usage-heading} {usage}

{all-args}{after-help}

EXAMPLES:
    # Start with the first config.yaml found (one is created if missing)
    ai-shell

    # Use a specific configuration file
    ai-shell --config ~/.ai_shell/config.yaml

    # Verbose diagnostics in logs/ai_shell.log
    ai-shell --log-level debug")]
struct Cli {
    /// Path to configuration file (default: config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level for the application log (RUST_LOG takes precedence)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let source = AppConfig::locate(cli.config.as_deref())?;
    if source.created_default {
        println!("📝 Created default configuration at {}", source.path.display());
    }
    let mut config = AppConfig::load(&source.path)
        .with_context(|| format!("Failed to load configuration from {}", source.path.display()))?;

    // Task scripts receive an absolute directory regardless of later cwd changes
    config.monitoring.log_directory = config.prepare_log_directory()?;
    let log_file = logging::init(
        &config.monitoring.log_directory,
        &cli.log_level,
        &config.monitoring.task_logging,
    )?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %source.path.display(),
        log = %log_file.display(),
        "AI Shell starting"
    );

    for warning in config.validate() {
        warn!(%warning, "Configuration warning");
        println!("⚠️  {}", warning);
    }

    let generator = build_generator(&config);
    let cache = CommandCache::load(CommandCache::default_path());
    if !cache.is_empty() {
        println!("📚 Loaded {} cached commands", cache.len());
    }
    let input = EditorSource::new(&config.shell, EditorSource::default_history_path())?;

    let mut shell = Shell::new(config, source.path, generator, cache, input)?;
    spawn_teardown_on_signal(shell.task_handle()).context("Failed to install signal handlers")?;
    shell.run().await
}
