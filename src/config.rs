//! Configuration loaded from warden.toml.
//!
//! Every timing knob of the supervision loop lives here rather than as a
//! constant: the shipped defaults (30s warm-up, 5s poll, 5s cool-down, 10s
//! grace, 5 restarts per 60s window, 60s storm back-off) are sandbox-image
//! conventions, not verified requirements, so operators can tune them.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from warden.toml.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct WardenConfig {
    pub agent: AgentConfig,
    pub timing: TimingConfig,
    pub shutdown: ShutdownConfig,
}

/// The supervised agent process: what to run and where.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AgentConfig {
    /// Interpreter or binary to invoke. Bare names are resolved via PATH.
    pub program: PathBuf,
    /// Script passed as the first argument, if the program is an interpreter.
    pub script: Option<PathBuf>,
    /// Remaining launch arguments, in order.
    pub args: Vec<String>,
    /// Directory the agent runs in.
    pub working_dir: PathBuf,
    /// Capture agent stdout/stderr here (append). Inherited when unset.
    pub log_file: Option<PathBuf>,
}

/// Timing knobs for the supervision loop. All values in seconds.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TimingConfig {
    /// Delay before the first spawn, to let guest networking come up.
    pub warmup_secs: u64,
    /// How often the loop checks for child exit and the stop signal.
    pub poll_interval_secs: u64,
    /// Pause between observing a child exit and respawning.
    pub cooldown_secs: u64,
    /// How long a SIGTERM'd child gets before SIGKILL.
    pub grace_secs: u64,
    /// Restarts tolerated within one observation window.
    pub storm_ceiling: u32,
    /// Length of the restart observation window.
    pub storm_window_secs: u64,
    /// Extended sleep after the ceiling is hit.
    pub storm_backoff_secs: u64,
}

/// External shutdown triggers beyond SIGINT/SIGTERM.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Creating this file requests a graceful stop.
    pub stop_file: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python3"),
            script: Some(PathBuf::from("/opt/agent/agent.py")),
            args: Vec::new(),
            working_dir: PathBuf::from("/opt/agent"),
            log_file: None,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            warmup_secs: 30,
            poll_interval_secs: 5,
            cooldown_secs: 5,
            grace_secs: 10,
            storm_ceiling: 5,
            storm_window_secs: 60,
            storm_backoff_secs: 60,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            stop_file: PathBuf::from("/opt/agent/STOP"),
        }
    }
}

/// Resolved loop timings as durations. Config deals in whole seconds; the
/// supervisor (and its tests) deal in [`Duration`]s.
#[derive(Debug, Clone)]
pub struct Timing {
    pub warmup: Duration,
    pub poll_interval: Duration,
    pub cooldown: Duration,
    pub grace: Duration,
    pub storm_ceiling: u32,
    pub storm_window: Duration,
    pub storm_backoff: Duration,
}

impl TimingConfig {
    pub fn timing(&self) -> Timing {
        Timing {
            warmup: Duration::from_secs(self.warmup_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            cooldown: Duration::from_secs(self.cooldown_secs),
            grace: Duration::from_secs(self.grace_secs),
            storm_ceiling: self.storm_ceiling,
            storm_window: Duration::from_secs(self.storm_window_secs),
            storm_backoff: Duration::from_secs(self.storm_backoff_secs),
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Config file is not valid TOML for our schema.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A setting has a value the supervisor cannot run with.
    Invalid { message: String },
    /// The configured program does not exist on disk or PATH.
    ProgramMissing { program: PathBuf },
    /// The configured script does not exist on disk.
    ScriptMissing { script: PathBuf },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid { message } => write!(f, "invalid config: {}", message),
            ConfigError::ProgramMissing { program } => {
                write!(f, "agent program not found: {}", program.display())
            }
            ConfigError::ScriptMissing { script } => {
                write!(f, "agent script not found: {}", script.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl WardenConfig {
    /// Load configuration from a TOML file. A missing file yields defaults,
    /// matching how the daemon ships inside a sandbox image.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file absent, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: WardenConfig = toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the loop cannot make progress with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timing.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                message: "timing.poll_interval_secs must be at least 1".to_string(),
            });
        }
        if self.timing.storm_ceiling == 0 {
            return Err(ConfigError::Invalid {
                message: "timing.storm_ceiling must be at least 1".to_string(),
            });
        }
        if self.agent.program.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                message: "agent.program must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Resolve the agent program to an on-disk path.
///
/// Paths with a directory component must exist as given; bare names are
/// searched on PATH the way the OS loader would.
pub fn resolve_program(program: &Path) -> Result<PathBuf, ConfigError> {
    if program.components().count() > 1 || program.is_absolute() {
        if program.is_file() {
            return Ok(program.to_path_buf());
        }
        return Err(ConfigError::ProgramMissing {
            program: program.to_path_buf(),
        });
    }
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(program);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    Err(ConfigError::ProgramMissing {
        program: program.to_path_buf(),
    })
}
