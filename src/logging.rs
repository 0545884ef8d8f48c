//! Application log file setup
//!
//! Diagnostics go to `<log_directory>/ai_shell.log` through `tracing`, never to the
//! terminal, so they do not interleave with command output.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::TaskLoggingSettings;

pub const LOG_FILE_NAME: &str = "ai_shell.log";

/// Install the global subscriber. `RUST_LOG` wins over `level` when set.
pub fn init(log_dir: &Path, level: &str, limits: &TaskLoggingSettings) -> Result<PathBuf> {
    let path = log_dir.join(LOG_FILE_NAME);
    rotate(&path, limits)?;

    let file = touch(&path).with_context(|| format!("Failed to open log file {}", path.display()))?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(path)
}

/// Move an oversized log aside and drop the oldest rotated generations
pub fn rotate(path: &Path, limits: &TaskLoggingSettings) -> Result<()> {
    let max_bytes = limits.max_log_file_size_mb.saturating_mul(1024 * 1024);
    let size = match fs::metadata(path) {
        Ok(metadata) => metadata.len(),
        Err(_) => return Ok(()),
    };
    if size < max_bytes {
        return Ok(());
    }

    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S%.3f");
    let rotated = path.with_file_name(format!("ai_shell.{}.log", stamp));
    fs::rename(path, &rotated)
        .with_context(|| format!("Failed to rotate log file {}", path.display()))?;

    cleanup_rotated(path, limits.max_log_files)
}

fn cleanup_rotated(path: &Path, keep: usize) -> Result<()> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };

    let mut rotated: Vec<(PathBuf, SystemTime)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with("ai_shell.") && name.ends_with(".log") && name != LOG_FILE_NAME {
            if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                rotated.push((entry.path(), modified));
            }
        }
    }

    // Newest first; names sort chronologically when timestamps tie
    rotated.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    for (old, _) in rotated.iter().skip(keep) {
        if let Err(e) = fs::remove_file(old) {
            eprintln!("⚠️  Failed to remove old log {}: {}", old.display(), e);
        }
    }

    Ok(())
}

/// Create the file if needed so later opens cannot fail on a missing parent
pub fn touch(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}
