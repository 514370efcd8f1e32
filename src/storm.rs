//! Restart-window accounting.
//!
//! Tracks how many times the agent has been restarted inside a rolling
//! observation window and decides whether the next exit is a routine restart
//! or a restart storm that warrants an extended back-off. Crashes are never
//! terminal; the storm decision only stretches the delay before the next
//! spawn attempt.

use std::time::{Duration, Instant};

/// Decision returned after recording one child exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StormDecision {
    /// Below the ceiling — restart after the normal cool-down.
    /// Carries the restart count within the current window (1-based).
    Restart { restarts_in_window: u32 },
    /// Ceiling hit — take the extended back-off before the next spawn.
    Backoff,
}

/// Rolling restart-count window.
///
/// The window starts at the first recorded exit and is re-anchored whenever
/// a full window elapses without the ceiling being hit, which resets the
/// count to zero. After a `Backoff` decision the caller sleeps, then calls
/// [`StormWindow::reset`] so counting starts fresh.
pub struct StormWindow {
    ceiling: u32,
    window: Duration,
    restart_count: u32,
    window_start: Option<Instant>,
}

impl StormWindow {
    /// `ceiling` is the number of restarts tolerated per `window`.
    pub fn new(ceiling: u32, window: Duration) -> Self {
        Self {
            ceiling,
            window,
            restart_count: 0,
            window_start: None,
        }
    }

    /// Record a child exit observed at `now` and decide what to do.
    pub fn note_exit(&mut self, now: Instant) -> StormDecision {
        match self.window_start {
            Some(start) if now.duration_since(start) < self.window => {
                self.restart_count += 1;
            }
            _ => {
                // Window elapsed (or first exit ever): start a fresh one.
                self.window_start = Some(now);
                self.restart_count = 1;
            }
        }

        if self.restart_count >= self.ceiling {
            StormDecision::Backoff
        } else {
            StormDecision::Restart {
                restarts_in_window: self.restart_count,
            }
        }
    }

    /// Clear the count after an extended back-off has been served.
    pub fn reset(&mut self, now: Instant) {
        self.restart_count = 0;
        self.window_start = Some(now);
    }

    /// Restarts recorded in the current window.
    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }
}
