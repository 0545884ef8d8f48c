//! Configuration loading and display
//!
//! The configuration is a plain value. Components receive the section they need at
//! construction time, and a reload builds a fresh value that replaces the old one.

pub mod settings;

pub use settings::{
    AppConfig, LlmSettings, MonitoringSettings, SafetySettings, ShellSettings, TaskLoggingSettings,
};
