use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use hurricane::{config, logging, supervisor};

/// Derives rate and utilization metrics from raw system telemetry counters.
#[derive(Parser)]
#[command(name = "hurricane", about, disable_version_flag = true)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "hurricane.conf")]
    config: PathBuf,

    /// Print version information and exit.
    #[arg(long)]
    version: bool,
}

/// Build-time version info, injected via RUSTFLAGS or build environment.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Build timestamp (set at build time via env, or "unknown").
    pub fn build_time() -> &'static str {
        option_env!("BUILD_TIME").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, built: {}, {}/{})",
            RELEASE,
            git_commit(),
            build_time(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.version {
        eprintln!("Hurricane Derived Metrics");
        eprintln!("Version: {}", version::full());
        return ExitCode::SUCCESS;
    }

    match run(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("hurricane: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<u8> {
    let cfg = config::Config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    let log_file = logging::init(&cfg.log).context("initializing logging")?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting hurricane",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let exit_code = rt.block_on(async {
        // external logfile rotation support (SIGUSR2)
        if cfg.log.rotate {
            if let Some(file) = log_file {
                logging::spawn_rotation_listener(file);
            }
        }

        supervisor::run(cfg).await
    })?;

    Ok(exit_code as u8)
}
