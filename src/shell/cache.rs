//! Persistent cache of generated commands keyed by the user's request

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::llm::GeneratedCommand;
use crate::safety::RiskAssessment;

pub const CACHE_FILE_NAME: &str = ".ai_shell_cache.json";
pub const MAX_ENTRIES: usize = 1000;
pub const EVICT_BATCH: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    #[serde(default)]
    pub assessment: Option<RiskAssessment>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub usage_count: u64,
}

impl CacheEntry {
    pub fn generated(&self) -> GeneratedCommand {
        match (&self.script, self.interval) {
            (Some(script), Some(interval)) => GeneratedCommand::Monitoring {
                command: self.command.clone(),
                script: script.clone(),
                interval,
            },
            _ => GeneratedCommand::OneShot {
                command: self.command.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub total_usage: u64,
    pub with_assessment: usize,
    pub dangerous: usize,
    /// Most used requests, highest first
    pub top: Vec<(String, u64)>,
}

pub struct CommandCache {
    path: PathBuf,
    entries: HashMap<String, CacheEntry>,
}

impl CommandCache {
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CACHE_FILE_NAME)
    }

    /// Load the cache file. A missing or unreadable file yields an empty cache.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<HashMap<String, CacheEntry>>(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring corrupt command cache");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        debug!(entries = entries.len(), "Command cache loaded");
        Self { path, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn key(input: &str) -> String {
        input.trim().to_lowercase()
    }

    #[cfg(test)]
    pub fn get(&self, input: &str) -> Option<&CacheEntry> {
        self.entries.get(&Self::key(input))
    }

    /// Look up a request and count the hit
    pub fn hit(&mut self, input: &str) -> Option<CacheEntry> {
        let entry = self.entries.get_mut(&Self::key(input))?;
        entry.usage_count += 1;
        entry.timestamp = Utc::now();
        Some(entry.clone())
    }

    pub fn insert(&mut self, input: &str, generated: &GeneratedCommand, assessment: Option<RiskAssessment>) {
        let key = Self::key(input);
        let usage_count = self.entries.get(&key).map(|e| e.usage_count).unwrap_or(0) + 1;
        let (command, script, interval) = match generated {
            GeneratedCommand::OneShot { command } => (command.clone(), None, None),
            GeneratedCommand::Monitoring {
                command,
                script,
                interval,
            } => (command.clone(), Some(script.clone()), Some(*interval)),
        };

        self.entries.insert(
            key,
            CacheEntry {
                command,
                script,
                interval,
                assessment,
                timestamp: Utc::now(),
                usage_count,
            },
        );
        self.evict();
    }

    /// Drop the oldest batch once the cap is passed
    fn evict(&mut self) {
        if self.entries.len() <= MAX_ENTRIES {
            return;
        }
        let mut by_age: Vec<(String, DateTime<Utc>)> = self
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.timestamp))
            .collect();
        by_age.sort_by(|a, b| a.1.cmp(&b.1));

        for (key, _) in by_age.into_iter().take(EVICT_BATCH) {
            self.entries.remove(&key);
        }
        debug!(remaining = self.entries.len(), "Evicted old cache entries");
    }

    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Write to a sibling temp file, then rename over the cache
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(&self.entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    pub fn stats(&self, top: usize) -> CacheStats {
        let mut ranked: Vec<(String, u64)> = self
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.usage_count))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(top);

        CacheStats {
            entries: self.entries.len(),
            total_usage: self.entries.values().map(|e| e.usage_count.max(1)).sum(),
            with_assessment: self.entries.values().filter(|e| e.assessment.is_some()).count(),
            dangerous: self
                .entries
                .values()
                .filter(|e| e.assessment.as_ref().is_some_and(|a| a.is_dangerous()))
                .count(),
            top: ranked,
        }
    }
}
