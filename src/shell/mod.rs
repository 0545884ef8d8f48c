//! Interactive front-end: line editing, built-in commands, the command cache and the
//! request → gate → execute flow.

pub mod cache;
pub mod commands;
pub mod completer;
pub mod repl;
pub mod signals;

pub use cache::CommandCache;
pub use repl::{EditorSource, Shell, build_generator};
pub use signals::spawn_teardown_on_signal;
