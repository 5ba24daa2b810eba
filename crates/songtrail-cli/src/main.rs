use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "songtrail")]
#[command(about = "Walk music charts backward week by week and collect song metadata")]
struct Cli {
    /// Run file (JSON, or YAML when the extension is .yaml/.yml).
    #[arg(long, global = true, default_value = "run.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Walk the configured charts and write batches to the selected sink.
    Run,
    /// Print how charts are split across workers without fetching anything.
    Partitions,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "songtrail_sync=info,songtrail_sources=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!(config = %cli.config.display(), "loading run config");
            let summary = songtrail_sync::run_from_config_path(&cli.config).await?;
            println!(
                "run complete: run_id={} state={:?} weeks={} processed={} written={}",
                summary.run_id,
                summary.final_state,
                summary.weeks_processed,
                summary.records_processed,
                summary.records_written
            );
        }
        Commands::Partitions => {
            let partitions = songtrail_sync::partition_plan_from_config_path(&cli.config)?;
            println!("{}", serde_json::to_string_pretty(&partitions)?);
        }
    }

    Ok(())
}
