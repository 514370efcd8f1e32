mod agent;
mod config;
mod events;
mod signals;
mod storm;
mod supervisor;

use clap::Parser;
use config::WardenConfig;
use events::LogSink;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use supervisor::Supervisor;
use tokio_util::sync::CancellationToken;

/// Keeps the sandbox guest-agent process alive: spawn it after a boot
/// warm-up, restart it on crash with restart-storm back-off, and stop it
/// gracefully on SIGINT/SIGTERM or when the stop file appears.
#[derive(Parser, Debug)]
#[command(name = "agent-warden", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "warden.toml")]
    config: PathBuf,

    /// Agent program (overrides config)
    #[arg(long)]
    program: Option<PathBuf>,

    /// Agent script (overrides config)
    #[arg(long)]
    script: Option<PathBuf>,

    /// Agent working directory (overrides config)
    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// Warm-up delay before the first spawn, in seconds (overrides config)
    #[arg(long)]
    warmup: Option<u64>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (poll decisions, state changes)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    /// Fold CLI overrides into the loaded config.
    fn apply_to(&self, config: &mut WardenConfig) {
        if let Some(program) = &self.program {
            config.agent.program = program.clone();
        }
        if let Some(script) = &self.script {
            config.agent.script = Some(script.clone());
        }
        if let Some(dir) = &self.working_dir {
            config.agent.working_dir = dir.clone();
        }
        if let Some(warmup) = self.warmup {
            config.timing.warmup_secs = warmup;
        }
    }

    fn log_filter(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_filter())),
        )
        .init();

    let mut config = match WardenConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "could not load configuration");
            return ExitCode::from(2);
        }
    };
    cli.apply_to(&mut config);
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        return ExitCode::from(2);
    }

    if cli.dry_run {
        println!("agent-warden v{}", env!("CARGO_PKG_VERSION"));
        println!("{:#?}", config);
        return ExitCode::SUCCESS;
    }

    let stop = CancellationToken::new();
    if let Err(e) = signals::install(stop.clone()) {
        tracing::error!(error = %e, "failed to install signal handlers");
        return ExitCode::FAILURE;
    }
    signals::watch_stop_file(
        config.shutdown.stop_file.clone(),
        config.timing.timing().poll_interval,
        stop.clone(),
    );

    let mut supervisor = Supervisor::new(
        config.agent.clone(),
        config.timing.timing(),
        stop,
        Arc::new(LogSink),
    );

    // Only configuration errors surface here; crashes of the agent itself
    // are absorbed by the loop and visible in the logs.
    match supervisor.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "supervisor could not start");
            ExitCode::FAILURE
        }
    }
}
