pub mod runner;

pub use runner::{CommandOutcome, kill_foreground, run};
