//! layering-node: a single cache node running first-level cache maintenance
//!
//! Main binary with subcommands:
//! - `run`: Start the maintenance jobs against an in-process message log
//! - `config`: Print the effective maintenance configuration

use std::time::Duration;

use chrono::NaiveTime;
use clap::{Args, Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use layering_sync::{MaintenanceConfig, SchedulerError, env, parse_time_of_day};

mod daemon;

fn parse_reset_time(s: &str) -> Result<NaiveTime, String> {
    parse_time_of_day(s).map_err(|e| e.to_string())
}

#[derive(Parser)]
#[command(name = "layering-node")]
#[command(about = "First-level cache maintenance node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pull, offset reset, and reconnection jobs until Ctrl-C
    Run {
        #[command(flatten)]
        schedule: ScheduleArgs,

        /// Publish a sample invalidation every N seconds from a simulated
        /// remote writer (0 disables)
        #[arg(long, default_value = "0")]
        publish_interval: u64,

        /// Keep only the newest N log entries after each simulated publish
        #[arg(long)]
        retain: Option<u64>,
    },

    /// Print the effective maintenance configuration as JSON
    Config {
        #[command(flatten)]
        schedule: ScheduleArgs,
    },
}

/// Overrides for the maintenance schedule. Unset values keep their defaults.
#[derive(Args, Debug, Default)]
struct ScheduleArgs {
    /// Delay before the first pull, in seconds
    #[arg(long, env = env::PULL_INITIAL_DELAY_SECS)]
    pull_initial_delay: Option<u64>,

    /// Delay between pulls, in seconds
    #[arg(long, env = env::PULL_PERIOD_SECS)]
    pull_period: Option<u64>,

    /// Local time of day for the daily offset reset (HH:MM or HH:MM:SS)
    #[arg(long, env = env::RESET_TIME, value_parser = parse_reset_time)]
    reset_time: Option<NaiveTime>,

    /// Delay between offset resets, in seconds
    #[arg(long, env = env::RESET_PERIOD_SECS)]
    reset_period: Option<u64>,

    /// Delay before the first reconnection check, in seconds
    #[arg(long, env = env::RECONNECT_INITIAL_DELAY_SECS)]
    reconnect_initial_delay: Option<u64>,

    /// Delay between reconnection checks, in seconds
    #[arg(long, env = env::RECONNECT_PERIOD_SECS)]
    reconnect_period: Option<u64>,

    /// Worker threads in the maintenance pool
    #[arg(long, env = env::WORKER_THREADS)]
    worker_threads: Option<usize>,
}

impl ScheduleArgs {
    fn into_config(self) -> Result<MaintenanceConfig, SchedulerError> {
        let mut config = MaintenanceConfig::default();

        if let Some(secs) = self.pull_initial_delay {
            config = config.with_pull_initial_delay(Duration::from_secs(secs));
        }
        if let Some(secs) = self.pull_period {
            config = config.with_pull_period(Duration::from_secs(secs));
        }
        if let Some(at) = self.reset_time {
            config = config.with_reset_time(at);
        }
        if let Some(secs) = self.reset_period {
            config = config.with_reset_period(Duration::from_secs(secs));
        }
        if let Some(secs) = self.reconnect_initial_delay {
            config = config.with_reconnect_initial_delay(Duration::from_secs(secs));
        }
        if let Some(secs) = self.reconnect_period {
            config = config.with_reconnect_period(Duration::from_secs(secs));
        }
        if let Some(threads) = self.worker_threads {
            config = config.with_worker_threads(threads);
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "layering=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            schedule,
            publish_interval,
            retain,
        } => daemon::run(daemon::DaemonConfig {
            schedule: schedule.into_config().into_diagnostic()?,
            publish_interval: (publish_interval > 0).then(|| Duration::from_secs(publish_interval)),
            retain,
        }),

        Commands::Config { schedule } => {
            let config = schedule.into_config().into_diagnostic()?;
            let json = serde_json::to_string_pretty(&config).into_diagnostic()?;
            println!("{json}");
            Ok(())
        }
    }
}
