//! CDN Abuse Detection CLI
//!
//! A command-line tool for evaluating samples offline, inspecting a worker's
//! counters and sent alerts, and validating accounts events.

mod commands;
mod config;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use commands::{evaluate, event, inspect};
use detector_lib::MetricKind;
use std::path::{Path, PathBuf};

/// CDN Abuse Detection CLI
#[derive(Parser)]
#[command(name = "cfad")]
#[command(author, version, about = "CLI for CDN Abuse Detection", long_about = None)]
pub struct Cli {
    /// Store snapshot written by the worker
    #[arg(long, global = true, env = "CFAD_STORE_PATH")]
    pub store: Option<PathBuf>,

    /// Output format
    #[arg(long, short, global = true)]
    pub format: Option<output::OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Evaluate one sample against the thresholds
    Evaluate {
        #[arg(long, value_enum)]
        metric: MetricArg,

        /// Value for the most recent 15-minute window
        #[arg(long, allow_negative_numbers = true)]
        current: f64,

        /// Average per 15-minute interval over the last 24 hours
        #[arg(long, allow_negative_numbers = true)]
        baseline: f64,

        /// JSON thresholds file (fields not given keep their defaults)
        #[arg(long, env = "CFAD_THRESHOLDS_FILE")]
        thresholds: Option<PathBuf>,
    },

    /// List consecutive-violation counters
    Counters {
        /// Only counters of this account
        #[arg(long, short)]
        account: Option<String>,
    },

    /// List alerts sent within the retention window
    Alerts,

    /// List accounts skipped after a recent failure
    FailedAccounts,

    /// Validate an accounts event file
    ValidateEvent {
        file: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum MetricArg {
    Requests,
    Bytes,
}

impl From<MetricArg> for MetricKind {
    fn from(arg: MetricArg) -> Self {
        match arg {
            MetricArg::Requests => MetricKind::Requests,
            MetricArg::Bytes => MetricKind::BytesDownloaded,
        }
    }
}

fn store_path<'a>(cli: &'a Cli, config: &'a config::CliConfig) -> Result<&'a Path> {
    cli.store
        .as_deref()
        .or(config.store_path.as_deref())
        .context("no store snapshot given; pass --store or set CFAD_STORE_PATH")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::CliConfig::load()?;
    let format = cli.format.or(config.default_format).unwrap_or_default();

    match &cli.command {
        Commands::Evaluate {
            metric,
            current,
            baseline,
            thresholds,
        } => {
            let thresholds = config::resolve_thresholds(thresholds.as_deref(), &config)?;
            evaluate::evaluate(thresholds, (*metric).into(), *current, *baseline, format)?;
        }
        Commands::Counters { account } => {
            let store = store_path(&cli, &config)?;
            inspect::counters(store, &config.tables, account.as_deref(), format).await?;
        }
        Commands::Alerts => {
            let store = store_path(&cli, &config)?;
            inspect::alerts(store, &config.tables, format).await?;
        }
        Commands::FailedAccounts => {
            let store = store_path(&cli, &config)?;
            inspect::failed_accounts(store, &config.tables, format).await?;
        }
        Commands::ValidateEvent { file } => {
            event::validate_event(file, format)?;
        }
    }

    Ok(())
}
