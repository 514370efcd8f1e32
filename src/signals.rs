//! Stop triggers: OS signals and the STOP sentinel file.
//!
//! Both feed the same `CancellationToken`, which is the only cross-context
//! communication the supervisor loop has. SIGINT and SIGTERM request a
//! graceful shutdown; so does creating the stop file (useful from host-side
//! tooling that cannot signal a service directly).

use std::path::PathBuf;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install SIGINT/SIGTERM handlers that cancel `stop`.
///
/// The handlers live for the rest of the process; a second signal while
/// shutdown is in flight is absorbed (the token is already cancelled).
pub fn install(stop: CancellationToken) -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => tracing::info!("SIGINT received, requesting shutdown"),
            _ = sigterm.recv() => tracing::info!("SIGTERM received, requesting shutdown"),
        }
        stop.cancel();
    });
    Ok(())
}

/// Poll for the stop file and cancel `stop` when it appears.
///
/// The watcher task ends as soon as the token is cancelled from anywhere.
pub fn watch_stop_file(path: PathBuf, interval: Duration, stop: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            if path.exists() {
                tracing::info!(path = %path.display(), "stop file detected, requesting shutdown");
                stop.cancel();
                return;
            }
        }
    });
}
