//! Lifecycle events emitted by the supervisor.
//!
//! The supervisor never decides anything silently: every spawn, exit, kill
//! escalation and storm back-off goes through an [`EventSink`]. The default
//! sink forwards to `tracing`; tests substitute a collecting sink.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// A structured lifecycle event with the time it was observed.
#[derive(Debug)]
pub struct Event {
    pub at: DateTime<Utc>,
    pub kind: EventKind,
}

impl Event {
    pub fn now(kind: EventKind) -> Self {
        Self {
            at: Utc::now(),
            kind,
        }
    }
}

/// What happened in the supervision loop.
#[derive(Debug)]
pub enum EventKind {
    /// The agent process was started.
    Spawned { pid: u32, attempt: u32 },
    /// The OS refused to create the agent process; counted like a crash.
    SpawnFailed { error: std::io::Error },
    /// The agent exited on its own (code is None when killed by a signal).
    Exited { pid: u32, exit_code: Option<i32> },
    /// A respawn is scheduled after the cool-down.
    RestartScheduled {
        cooldown: Duration,
        restarts_in_window: u32,
    },
    /// The restart ceiling was hit inside one observation window.
    RestartStorm {
        restarts: u32,
        window: Duration,
        backoff: Duration,
    },
    /// A stop request was observed while the agent was running.
    StopRequested,
    /// The agent was asked to terminate gracefully.
    Terminating { pid: u32 },
    /// The agent ignored SIGTERM through the grace period and was killed.
    KillEscalated { pid: u32, grace: Duration },
    /// The supervisor reached its terminal state.
    Stopped,
}

/// Observability boundary: fire-and-forget, must never block the loop.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Default sink: structured `tracing` records at the level the event warrants.
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: Event) {
        match event.kind {
            EventKind::Spawned { pid, attempt } => {
                tracing::info!(pid, attempt, "agent process started");
            }
            EventKind::SpawnFailed { ref error } => {
                tracing::warn!(error = %error, "failed to spawn agent process");
            }
            EventKind::Exited { pid, exit_code } => {
                tracing::info!(pid, exit_code = ?exit_code, "agent process exited");
            }
            EventKind::RestartScheduled {
                cooldown,
                restarts_in_window,
            } => {
                tracing::info!(
                    cooldown_secs = cooldown.as_secs(),
                    restarts_in_window,
                    "restarting agent after cool-down"
                );
            }
            EventKind::RestartStorm {
                restarts,
                window,
                backoff,
            } => {
                tracing::warn!(
                    restarts,
                    window_secs = window.as_secs(),
                    backoff_secs = backoff.as_secs(),
                    "restart storm detected, backing off"
                );
            }
            EventKind::StopRequested => {
                tracing::info!("stop requested, shutting down agent");
            }
            EventKind::Terminating { pid } => {
                tracing::info!(pid, "sent SIGTERM to agent process group");
            }
            EventKind::KillEscalated { pid, grace } => {
                tracing::warn!(
                    pid,
                    grace_secs = grace.as_secs(),
                    "agent ignored SIGTERM, escalating to SIGKILL"
                );
            }
            EventKind::Stopped => {
                tracing::info!("supervisor stopped");
            }
        }
    }
}
