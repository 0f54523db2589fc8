//! Meter: incremental damage-meter aggregation
//!
//! Main binary with subcommands:
//! - `replay`: Drive an aggregation cache through a scenario file
//! - `validate`: Parse a scenario file without running it

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use meter_core::DEFAULT_BUS_CAPACITY;
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod replay;
mod scenario;

use replay::{OutputFormat, ReplayOptions};
use scenario::Scenario;

#[derive(Parser)]
#[command(name = "meter")]
#[command(about = "Incremental damage-meter aggregation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scenario against an aggregation cache and print every result
    Replay {
        /// Scenario JSON file
        #[arg(long, env = "METER_SCENARIO")]
        scenario: PathBuf,

        /// Output format
        #[arg(long, env = "METER_FORMAT", value_enum, default_value = "text")]
        format: OutputFormat,

        /// Per-fetch timeout in milliseconds, used when the scenario sets none.
        /// 0 disables the timeout.
        #[arg(long, env = "METER_FETCH_TIMEOUT_MS", default_value = "30000")]
        fetch_timeout_ms: u64,

        /// Capacity of the update bus
        #[arg(long, env = "METER_BUS_CAPACITY", default_value_t = DEFAULT_BUS_CAPACITY)]
        bus_capacity: usize,
    },

    /// Check that a scenario file parses
    Validate {
        /// Scenario JSON file
        #[arg(long, env = "METER_SCENARIO")]
        scenario: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so reports on stdout stay machine-readable
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "meter=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Replay {
            scenario,
            format,
            fetch_timeout_ms,
            bus_capacity,
        } => {
            let options = ReplayOptions {
                fetch_timeout: (fetch_timeout_ms > 0)
                    .then(|| Duration::from_millis(fetch_timeout_ms)),
                bus_capacity,
            };
            run_replay(&scenario, format, &options).await
        }

        Commands::Validate { scenario } => {
            let parsed = Scenario::load(&scenario)
                .await
                .map_err(|e| miette::miette!("{}: {}", scenario.display(), e))?;
            println!(
                "{}: {} steps, watching event types {:?}",
                scenario.display(),
                parsed.steps.len(),
                parsed.cache.watched_event_types,
            );
            Ok(())
        }
    }
}

async fn run_replay(
    path: &std::path::Path,
    format: OutputFormat,
    options: &ReplayOptions,
) -> Result<()> {
    let scenario = Scenario::load(path)
        .await
        .map_err(|e| miette::miette!("{}: {}", path.display(), e))?;
    tracing::info!(path = %path.display(), steps = scenario.steps.len(), "replaying scenario");

    let report = replay::replay(scenario, options).await?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    replay::write_report(&report, format, &mut out).map_err(|e| miette::miette!("{}", e))
}
