//! Monorack: an interactive supervisor for the long-running processes of a monorepo.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads configuration, sets up logging, and hands control to the supervisor
//! until the user quits or a termination signal arrives.

mod config;
mod error;
mod events;
mod logs;
mod manager;
mod nav;
mod process;
mod runner;
mod supervisor;
mod terminal;
mod tree;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{CommandFactory, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::supervisor::Supervisor;
use crate::terminal::{RawWriter, TerminalInput};

const DEFAULT_CONFIG: &str = "monorack.toml";

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "monorack",
    version,
    about = "Interactive supervisor for long-running local processes",
    styles = help_styles(),
    color = clap::ColorChoice::Always,
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to the monorack.toml configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Skip the interactive menu and print every log to stdout.
    #[arg(long)]
    no_ui: bool,
    /// Log filter (e.g. "debug" or "monorack=trace"). Overrides RUST_LOG.
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Install and start every process (the default).
    Start,
    /// Show help information.
    Help,
    /// Show version information.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Help) => {
            Cli::command().print_help()?;
            println!();
            return Ok(());
        }
        Some(Commands::Version) => {
            println!("monorack {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some(Commands::Start) | None => {}
    }

    init_tracing(cli.log_level.as_deref(), !cli.no_ui);

    let config_path = cli.config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let descriptor = config::load_config(&config_path)?
        .descriptor(&config_path)
        .context("failed to resolve configuration")?;
    info!(
        root = %descriptor.root_dir.display(),
        processes = descriptor.processes.len(),
        "loaded configuration"
    );

    let supervisor =
        Arc::new(Supervisor::new(descriptor).context("failed to prepare log files")?);
    spawn_signal_listener(Arc::clone(&supervisor));

    if cli.no_ui {
        return supervisor.run_headless().await;
    }

    terminal::init_terminal().context("failed to enable raw mode")?;
    let result = supervisor.run(TerminalInput::spawn()).await;
    terminal::restore_terminal().context("failed to restore terminal")?;
    if let Err(err) = &result {
        error!(error = %format!("{err:#}"), "supervisor failed");
    }
    result
}

fn init_tracing(level: Option<&str>, raw_mode: bool) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let _ = if raw_mode {
        builder.with_writer(|| RawWriter(io::stderr())).try_init()
    } else {
        builder.with_writer(io::stderr).try_init()
    };
}

fn spawn_signal_listener(supervisor: Arc<Supervisor>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    error!(error = %err, "failed to listen for SIGTERM");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("received Ctrl-C");
        }
        supervisor.die().await;
    });
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}
