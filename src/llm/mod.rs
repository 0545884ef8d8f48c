pub mod client;
pub mod error_handler;
pub mod generator;
pub mod prompt;


pub use client::LlmClient;
pub use generator::{CommandGenerator, GeneratedCommand, GenerationContext, GenerationError, LlmGenerator};
