//! The supervision loop: keep exactly one agent process alive.
//!
//! A single cooperatively-polling loop owns the child handle outright. The
//! only cross-context input is the stop token; every bounded wait (warm-up,
//! poll, cool-down, storm back-off) selects against it, so a stop request is
//! observed within one poll interval and shutdown latency is bounded by the
//! grace period plus one poll.
//!
//! Child crashes are never fatal to the supervisor. A crash ceiling inside a
//! rolling window only stretches the delay before the next spawn; the loop
//! exits solely on the stop token. Configuration problems (missing program
//! or script) are the one fatal case, detected before anything is spawned.

use crate::agent::{self, AgentProcess, ShutdownOutcome};
use crate::config::{resolve_program, AgentConfig, ConfigError, Timing};
use crate::events::{Event, EventKind, EventSink};
use crate::storm::{StormDecision, StormWindow};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Where the supervisor is in its lifecycle.
///
/// Transitions only move forward, except `Running`/`Restarting` cycling while
/// the agent keeps crashing. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Starting,
    Running,
    Restarting,
    Stopping,
    Stopped,
}

/// Supervises one agent process for the lifetime of the daemon.
pub struct Supervisor {
    agent: AgentConfig,
    timing: Timing,
    stop: CancellationToken,
    sink: Arc<dyn EventSink>,
    state: RunState,
    storm: StormWindow,
    spawn_count: u32,
}

impl Supervisor {
    pub fn new(
        agent: AgentConfig,
        timing: Timing,
        stop: CancellationToken,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let storm = StormWindow::new(timing.storm_ceiling, timing.storm_window);
        Self {
            agent,
            timing,
            stop,
            sink,
            state: RunState::Starting,
            storm,
            spawn_count: 0,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Run the supervision loop until the stop token is cancelled.
    ///
    /// Fails fast, before any spawn, if the configured program or script is
    /// missing; every later failure is absorbed and reported through the sink.
    pub async fn run(&mut self) -> Result<(), ConfigError> {
        let program = self.preflight()?;
        tracing::info!(
            program = %program.display(),
            warmup_secs = self.timing.warmup.as_secs(),
            "supervisor starting"
        );

        // Deliberate warm-up before the first spawn: at VM boot the network
        // stack may not be ready when this service comes up, and the agent
        // binds a listening socket immediately.
        if self.idle(self.timing.warmup).await {
            self.shut_down(None).await;
            return Ok(());
        }

        loop {
            match agent::spawn(&program, &self.agent) {
                Ok(mut agent) => {
                    self.spawn_count += 1;
                    self.set_state(RunState::Running);
                    self.emit(EventKind::Spawned {
                        pid: agent.pid(),
                        attempt: self.spawn_count,
                    });
                    if self.monitor(&mut agent).await {
                        self.shut_down(Some(agent)).await;
                        return Ok(());
                    }
                }
                Err(e) => {
                    // Counted like a crash: same cool-down, same storm budget.
                    self.emit(EventKind::SpawnFailed { error: e.into_io() });
                }
            }

            self.set_state(RunState::Restarting);
            match self.storm.note_exit(Instant::now()) {
                StormDecision::Restart { restarts_in_window } => {
                    self.emit(EventKind::RestartScheduled {
                        cooldown: self.timing.cooldown,
                        restarts_in_window,
                    });
                    if self.idle(self.timing.cooldown).await {
                        self.shut_down(None).await;
                        return Ok(());
                    }
                }
                StormDecision::Backoff => {
                    self.emit(EventKind::RestartStorm {
                        restarts: self.storm.restart_count(),
                        window: self.timing.storm_window,
                        backoff: self.timing.storm_backoff,
                    });
                    if self.idle(self.timing.storm_backoff).await {
                        self.shut_down(None).await;
                        return Ok(());
                    }
                    self.storm.reset(Instant::now());
                }
            }
        }
    }

    /// Watch a running agent. Returns true when a stop was requested (the
    /// caller then owns shutdown), false when the agent exited on its own.
    async fn monitor(&mut self, agent: &mut AgentProcess) -> bool {
        loop {
            if self.idle(self.timing.poll_interval).await {
                return true;
            }
            match agent.poll_exit() {
                Ok(None) => continue,
                Ok(Some(status)) => {
                    self.emit(EventKind::Exited {
                        pid: agent.pid(),
                        exit_code: status.code(),
                    });
                    return false;
                }
                Err(e) => {
                    // Lost track of the child; treat it as an exit so the
                    // restart path can produce a fresh, trackable one.
                    tracing::warn!(pid = agent.pid(), error = %e, "failed to poll agent exit");
                    self.emit(EventKind::Exited {
                        pid: agent.pid(),
                        exit_code: None,
                    });
                    return false;
                }
            }
        }
    }

    /// Terminate the in-flight agent (if any) and reach the terminal state.
    async fn shut_down(&mut self, agent: Option<AgentProcess>) {
        self.set_state(RunState::Stopping);
        self.emit(EventKind::StopRequested);
        if let Some(agent) = agent {
            let pid = agent.pid();
            self.emit(EventKind::Terminating { pid });
            match agent.shutdown(self.timing.grace).await {
                ShutdownOutcome::Graceful { exit_code } => {
                    tracing::debug!(pid, exit_code = ?exit_code, "agent terminated gracefully");
                }
                ShutdownOutcome::Killed => {
                    self.emit(EventKind::KillEscalated {
                        pid,
                        grace: self.timing.grace,
                    });
                }
            }
        }
        self.set_state(RunState::Stopped);
        self.emit(EventKind::Stopped);
    }

    /// Verify the program and script exist before the first spawn.
    ///
    /// The interpreter receives the script path verbatim and runs with the
    /// configured working directory, so a relative script must be checked
    /// against that directory, not the daemon's own.
    fn preflight(&self) -> Result<PathBuf, ConfigError> {
        let program = resolve_program(&self.agent.program)?;
        if let Some(script) = &self.agent.script {
            let resolved = if script.is_relative() {
                self.agent.working_dir.join(script)
            } else {
                script.clone()
            };
            if !resolved.is_file() {
                return Err(ConfigError::ScriptMissing { script: resolved });
            }
        }
        Ok(program)
    }

    /// Interruptible sleep. Returns true when the stop token fired.
    async fn idle(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return self.stop.is_cancelled();
        }
        tokio::select! {
            _ = self.stop.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    fn set_state(&mut self, next: RunState) {
        if self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "supervisor state change");
            self.state = next;
        }
    }

    fn emit(&self, kind: EventKind) {
        self.sink.emit(Event::now(kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingSink;
    use std::path::Path;
    use std::time::Instant;

    fn fast_timing() -> Timing {
        Timing {
            warmup: Duration::ZERO,
            poll_interval: Duration::from_millis(20),
            cooldown: Duration::from_millis(10),
            grace: Duration::from_millis(500),
            storm_ceiling: 100,
            storm_window: Duration::from_secs(60),
            storm_backoff: Duration::from_millis(300),
        }
    }

    fn sh_agent(dir: &Path, command: &str) -> AgentConfig {
        AgentConfig {
            program: PathBuf::from("/bin/sh"),
            script: None,
            args: vec!["-c".to_string(), command.to_string()],
            working_dir: dir.to_path_buf(),
            log_file: None,
        }
    }

    fn supervisor(
        agent: AgentConfig,
        timing: Timing,
    ) -> (Supervisor, CancellationToken, RecordingSink) {
        let stop = CancellationToken::new();
        let sink = RecordingSink::new();
        let sup = Supervisor::new(agent, timing, stop.clone(), Arc::new(sink.clone()));
        (sup, stop, sink)
    }

    /// Poll the sink until `predicate` holds or the deadline passes.
    async fn wait_until(
        sink: &RecordingSink,
        deadline: Duration,
        predicate: impl Fn(&RecordingSink) -> bool,
    ) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if predicate(sink) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        predicate(sink)
    }

    #[tokio::test]
    async fn test_missing_program_fails_fast_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = sh_agent(dir.path(), "true");
        agent.program = PathBuf::from("/nonexistent/interpreter");
        let (mut sup, _stop, sink) = supervisor(agent, fast_timing());

        let err = sup.run().await.unwrap_err();
        assert!(matches!(err, ConfigError::ProgramMissing { .. }));
        assert_eq!(sup.state(), RunState::Starting);
        assert_eq!(sink.count_of("Spawned"), 0);
    }

    #[tokio::test]
    async fn test_missing_script_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = sh_agent(dir.path(), "true");
        agent.script = Some(dir.path().join("no-such-agent.py"));
        let (mut sup, _stop, sink) = supervisor(agent, fast_timing());

        let err = sup.run().await.unwrap_err();
        assert!(matches!(err, ConfigError::ScriptMissing { .. }));
        assert_eq!(sink.count_of("Spawned"), 0);
    }

    #[tokio::test]
    async fn test_relative_script_resolved_against_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("agent.sh"), "sleep 30\n").unwrap();
        let agent = AgentConfig {
            program: PathBuf::from("/bin/sh"),
            script: Some(PathBuf::from("agent.sh")),
            args: Vec::new(),
            working_dir: dir.path().to_path_buf(),
            log_file: None,
        };
        let (mut sup, stop, sink) = supervisor(agent, fast_timing());

        let handle = tokio::spawn(async move {
            sup.run().await.unwrap();
        });
        assert!(
            wait_until(&sink, Duration::from_secs(5), |s| s.count_of("Spawned") == 1).await,
            "script living under working_dir should pass preflight and spawn: {:?}",
            sink.kinds()
        );
        stop.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_relative_script_missing_from_working_dir_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = sh_agent(dir.path(), "true");
        agent.script = Some(PathBuf::from("agent.sh"));

        let (mut sup, _stop, sink) = supervisor(agent, fast_timing());
        let err = sup.run().await.unwrap_err();
        assert!(matches!(err, ConfigError::ScriptMissing { .. }));
        // The error names the path the interpreter would actually resolve.
        assert!(err
            .to_string()
            .contains(&dir.path().join("agent.sh").display().to_string()));
        assert_eq!(sink.count_of("Spawned"), 0);
    }

    #[tokio::test]
    async fn test_stop_during_warmup_never_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let mut timing = fast_timing();
        timing.warmup = Duration::from_secs(30);
        let (mut sup, stop, sink) = supervisor(sh_agent(dir.path(), "true"), timing);

        let started = Instant::now();
        let handle = tokio::spawn(async move {
            sup.run().await.unwrap();
            sup
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.cancel();
        let sup = handle.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(sup.state(), RunState::Stopped);
        assert_eq!(sink.count_of("Spawned"), 0);
        assert_eq!(sink.count_of("Stopped"), 1);
    }

    #[tokio::test]
    async fn test_restarts_agent_after_exit_within_cooldown_plus_poll() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("runs.txt");
        let command = format!("echo run >> {}", marker.display());
        let mut timing = fast_timing();
        timing.cooldown = Duration::from_millis(100);
        timing.poll_interval = Duration::from_millis(50);
        let (mut sup, stop, sink) = supervisor(sh_agent(dir.path(), &command), timing.clone());

        let handle = tokio::spawn(async move {
            sup.run().await.unwrap();
        });
        assert!(
            wait_until(&sink, Duration::from_secs(10), |s| s.count_of("Spawned") >= 3).await,
            "expected at least three spawns, saw {:?}",
            sink.kinds()
        );
        stop.cancel();
        handle.await.unwrap();

        let contents = std::fs::read_to_string(&marker).unwrap();
        assert!(contents.matches("run").count() >= 3);
        assert!(sink.count_of("Exited") >= 2);
        assert!(sink.count_of("RestartScheduled") >= 2);

        // Each observed exit is followed by a respawn within the cool-down
        // plus one poll interval (with scheduling slack).
        let events = sink.take();
        let mut last_exit = None;
        let mut gaps = Vec::new();
        for event in &events {
            match event.kind {
                EventKind::Exited { .. } => last_exit = Some(event.at),
                EventKind::Spawned { .. } => {
                    if let Some(exit_at) = last_exit.take() {
                        gaps.push((event.at - exit_at).to_std().unwrap());
                    }
                }
                _ => {}
            }
        }
        assert!(gaps.len() >= 2, "no exit-to-respawn intervals recorded");
        let bound = timing.cooldown + timing.poll_interval + Duration::from_millis(350);
        for gap in &gaps {
            assert!(
                *gap >= timing.cooldown,
                "respawned before the cool-down elapsed: {:?}",
                gap
            );
            assert!(
                *gap <= bound,
                "respawn took {:?}, bound is {:?}",
                gap,
                bound
            );
        }
    }

    #[tokio::test]
    async fn test_stop_while_agent_running_is_bounded_and_final() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sup, stop, sink) = supervisor(sh_agent(dir.path(), "sleep 30"), fast_timing());

        let handle = tokio::spawn(async move {
            sup.run().await.unwrap();
            sup
        });
        assert!(wait_until(&sink, Duration::from_secs(5), |s| s.count_of("Spawned") == 1).await);

        let stop_issued = Instant::now();
        stop.cancel();
        let sup = handle.await.unwrap();

        // Bounded by poll interval + grace period, with generous slack.
        assert!(stop_issued.elapsed() < Duration::from_secs(5));
        assert_eq!(sup.state(), RunState::Stopped);
        assert_eq!(sink.count_of("Spawned"), 1, "no spawn after stop");
        assert_eq!(sink.count_of("StopRequested"), 1);
        assert_eq!(sink.count_of("Terminating"), 1);
        assert_eq!(sink.count_of("Stopped"), 1);
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill_for_stubborn_agent() {
        let dir = tempfile::tempdir().unwrap();
        let command = r#"trap "" TERM; while :; do sleep 0.05; done"#;
        let mut timing = fast_timing();
        timing.grace = Duration::from_millis(200);
        let (mut sup, stop, sink) = supervisor(sh_agent(dir.path(), command), timing);

        let handle = tokio::spawn(async move {
            sup.run().await.unwrap();
        });
        assert!(wait_until(&sink, Duration::from_secs(5), |s| s.count_of("Spawned") == 1).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.cancel();
        handle.await.unwrap();

        assert_eq!(sink.count_of("KillEscalated"), 1);
        assert_eq!(sink.count_of("Stopped"), 1);
    }

    #[tokio::test]
    async fn test_rapid_crashes_trip_storm_then_respawn_after_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let mut timing = fast_timing();
        timing.storm_ceiling = 5;
        timing.storm_window = Duration::from_secs(10);
        timing.storm_backoff = Duration::from_millis(400);
        let (mut sup, stop, sink) = supervisor(sh_agent(dir.path(), "exit 1"), timing);

        let handle = tokio::spawn(async move {
            sup.run().await.unwrap();
        });
        assert!(
            wait_until(&sink, Duration::from_secs(10), |s| s
                .count_of("RestartStorm")
                >= 1)
            .await,
            "storm never detected: {:?}",
            sink.kinds()
        );

        // Five spawn attempts, four routine restarts, then the storm.
        assert_eq!(sink.count_of("Spawned"), 5);
        assert_eq!(sink.count_of("RestartScheduled"), 4);

        // The sixth attempt arrives only after the extended back-off.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.count_of("Spawned"), 5, "spawned during back-off");
        assert!(
            wait_until(&sink, Duration::from_secs(5), |s| s.count_of("Spawned") >= 6).await,
            "no respawn after back-off"
        );
        stop.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_refusal_counts_toward_storm() {
        let dir = tempfile::tempdir().unwrap();
        // Program exists, but the working directory does not: every spawn
        // attempt is refused by the OS.
        let mut agent = sh_agent(dir.path(), "true");
        agent.working_dir = dir.path().join("gone");
        let mut timing = fast_timing();
        timing.storm_ceiling = 3;
        timing.storm_backoff = Duration::from_millis(200);
        let (mut sup, stop, sink) = supervisor(agent, timing);

        let handle = tokio::spawn(async move {
            sup.run().await.unwrap();
        });
        assert!(
            wait_until(&sink, Duration::from_secs(10), |s| s
                .count_of("RestartStorm")
                >= 1)
            .await,
            "spawn refusals should trip the storm: {:?}",
            sink.kinds()
        );
        assert!(sink.count_of("SpawnFailed") >= 3);
        assert_eq!(sink.count_of("Spawned"), 0);
        stop.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_crashes_reset_window_and_never_storm() {
        let dir = tempfile::tempdir().unwrap();
        let mut timing = fast_timing();
        timing.storm_ceiling = 3;
        // Window shorter than the crash cadence: the count re-anchors each time.
        timing.storm_window = Duration::from_millis(50);
        timing.cooldown = Duration::from_millis(60);
        let (mut sup, stop, sink) = supervisor(sh_agent(dir.path(), "exit 1"), timing);

        let handle = tokio::spawn(async move {
            sup.run().await.unwrap();
        });
        assert!(wait_until(&sink, Duration::from_secs(10), |s| s.count_of("Spawned") >= 6).await);
        stop.cancel();
        handle.await.unwrap();

        assert_eq!(sink.count_of("RestartStorm"), 0);
    }
}
