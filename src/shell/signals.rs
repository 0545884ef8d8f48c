//! Teardown for a shell that is killed rather than exited.
//!
//! Tasks and one-shot commands run in their own process groups, so a signal aimed
//! at the shell never reaches them. The watcher stops them before the process exits.

use std::io;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

use crate::exec;
use crate::task::TaskManager;

/// Watch for SIGINT, SIGTERM and SIGHUP. On the first one, kill the foreground
/// command, shut down `tasks` and exit with `128 + signal`.
pub fn spawn_teardown_on_signal(tasks: Arc<TaskManager>) -> io::Result<()> {
    // Registered before returning so no signal slips through to the default action
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    tokio::spawn(async move {
        let (name, code) = tokio::select! {
            _ = interrupt.recv() => ("SIGINT", 130),
            _ = terminate.recv() => ("SIGTERM", 143),
            _ = hangup.recv() => ("SIGHUP", 129),
        };

        info!(signal = name, "Received signal, shutting down");
        println!("\nShutting down AI Shell...");

        if let Some(pgid) = exec::kill_foreground() {
            info!(pgid, "Killed running command");
        }
        for warning in teardown(&tasks).await {
            println!("⚠️  {}", warning);
        }
        std::process::exit(code);
    });
    Ok(())
}

async fn teardown(tasks: &TaskManager) -> Vec<String> {
    let running = tasks.running_count().await;
    if running > 0 {
        println!("🛑 Stopping {} background task(s)...", running);
    }
    let warnings = tasks.shutdown().await;
    info!("Shell session ended by signal");
    warnings
}
