use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use screenwatch::capture::BackendChoice;
use screenwatch::config::{EventBackendConfig, MonitorConfig, parse_duration};
use screenwatch::error::{ErrorSeverity, HasRecoverySuggestion, HasSeverity};
use screenwatch::monitor;

/// Watch screen regions and alert when they match a reference image.
#[derive(Parser, Debug)]
#[command(name = "screenwatch", version)]
#[command(about = "👀 Watch screen regions and play an alert when they match a reference image")]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture the configured regions and alert on a match
    Watch(WatchArgs),

    /// List the displays the capture backend can see
    Displays {
        /// JSON configuration file for backend and screenshot program settings
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Overrides the configured backend
        #[arg(long, value_enum)]
        backend: Option<BackendChoice>,
    },
}

#[derive(clap::Args, Debug)]
struct WatchArgs {
    /// JSON configuration file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Reference image to compare regions against
    #[arg(short, long)]
    reference: Option<PathBuf>,

    /// Time between captures: 500ms, 2s, 1m
    #[arg(short, long)]
    interval: Option<String>,

    /// Similarity in [0, 1] that counts as a match
    #[arg(short, long)]
    threshold: Option<f64>,

    /// Minimum time between alerts: 20s, 1m
    #[arg(long)]
    cooldown: Option<String>,

    #[arg(long, value_enum)]
    backend: Option<BackendChoice>,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

fn load_config(args: WatchArgs) -> Result<MonitorConfig> {
    let mut config = match &args.config {
        Some(path) => MonitorConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => MonitorConfig::default(),
    };

    if let Some(reference) = args.reference {
        config.reference = reference;
    }
    if let Some(interval) = &args.interval {
        config.interval_ms = millis(parse_duration(interval)?);
    }
    if let Some(cooldown) = &args.cooldown {
        config.cooldown_ms = millis(parse_duration(cooldown)?);
    }
    if let Some(threshold) = args.threshold {
        config.threshold = threshold;
    }
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    config.validate()?;
    Ok(config)
}

/// Backend selection for `displays`, from the config file when one is given.
fn display_settings(
    config: Option<&Path>,
    backend: Option<BackendChoice>,
) -> Result<(BackendChoice, EventBackendConfig)> {
    let (configured, event) = match config {
        Some(path) => {
            let config = MonitorConfig::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            (config.backend, config.event)
        }
        None => (BackendChoice::default(), EventBackendConfig::default()),
    };
    Ok((backend.unwrap_or(configured), event))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Watch(args) => {
            let config = load_config(args)?;
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "cannot listen for Ctrl-C");
                    std::future::pending::<()>().await;
                }
            };

            let reports = monitor::run(config, shutdown).await?;
            let mut failed = 0;
            for report in &reports {
                info!(
                    region = %report.label,
                    captured = report.stats.captured,
                    presented = report.stats.presented,
                    dropped = report.stats.dropped,
                    "region summary"
                );
                if let Some(error) = &report.error {
                    failed += 1;
                    let hint = error.recovery_suggestion().unwrap_or("");
                    if error.severity() >= ErrorSeverity::Critical {
                        tracing::error!(region = %report.label, %error, hint, "region stopped");
                    } else {
                        tracing::warn!(region = %report.label, %error, hint, "region stopped");
                    }
                }
            }
            if failed == reports.len() && failed > 0 {
                bail!("every capture loop stopped with an error");
            }
        }
        Command::Displays { config, backend } => {
            let (backend, event) = display_settings(config.as_deref(), backend)?;
            let displays = monitor::list_displays(backend, &event).await?;
            if displays.is_empty() {
                println!("No displays found");
            }
            for display in displays {
                println!(
                    "{}: {} {}x{} at ({}, {}){}",
                    display.index,
                    display.id,
                    display.width,
                    display.height,
                    display.origin.0,
                    display.origin.1,
                    display
                        .refresh_hz
                        .map(|hz| format!(" {}Hz", hz))
                        .unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}
