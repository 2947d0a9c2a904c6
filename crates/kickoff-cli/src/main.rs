use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kickoff_sync::RunOutcome;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "kickoff")]
#[command(about = "Publish today's match channels into the panel database")]
#[command(version)]
struct Cli {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info,sqlx=warn", env = "KICKOFF_LOG")]
    log_filter: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Replace the destination category with today's channels (default)
    Sync,
    /// Resolve today's channels and print them without touching the database
    Preview,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_filter.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(cli.command.unwrap_or(Commands::Sync)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Sync => {
            info!("starting channel sync");
            let summary = kickoff_sync::run_sync_once_from_env()
                .await
                .context("sync run failed")?;
            match &summary.outcome {
                RunOutcome::Reconciled(report) => println!(
                    "sync complete: run_id={} events={} channels={} category={} deleted={} groups_rewritten={}",
                    summary.run_id,
                    summary.events,
                    summary.channels,
                    report.category_id,
                    report.deleted_channels,
                    report.groups_rewritten
                ),
                RunOutcome::SkippedAfterProviderFailure => println!(
                    "sync skipped: run_id={} schedule unavailable, category left unchanged",
                    summary.run_id
                ),
            }
        }
        Commands::Preview => {
            let batch = kickoff_sync::preview_from_env()
                .await
                .context("preview failed")?;
            if batch.provider_failed {
                eprintln!("warning: schedule fetch failed; showing only static entries");
            }
            for (index, channel) in batch.channels.iter().enumerate() {
                println!("{:>3}  {}  {}", index + 1, channel.display_name, channel.url);
            }
            println!("{} events, {} channels", batch.events, batch.channels.len());
        }
    }

    Ok(())
}
