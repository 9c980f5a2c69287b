use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobfeed_sync::{
    maybe_build_scheduler, run_clean_once, run_collect_once, CollectOutcome, SyncSettings,
};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "jobfeed-cli")]
#[command(about = "Job feed collector, retention cleaner and dashboard")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every enabled source and save the batch.
    Collect,
    /// Apply dedup and retention to the dataset in place.
    Clean,
    /// Run the dashboard (and the scheduler when enabled).
    Serve,
    /// Run collect-then-clean on the configured cron schedule.
    Schedule,
}

#[tokio::main]
async fn main() -> ExitCode {
    jobfeed_cli::init();
    let cli = Cli::parse();

    match run(cli.command.unwrap_or(Commands::Collect)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            jobfeed_cli::failure_exit_code(&err)
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    let settings = SyncSettings::from_env();

    match command {
        Commands::Collect => {
            let summary = run_collect_once(&settings).await?;
            match &summary.outcome {
                CollectOutcome::Saved(dataset) => println!(
                    "collect complete: run_id={} sources={} fetched={} saved={} path={}",
                    summary.run_id,
                    summary.enabled_sources,
                    summary.fetched_records,
                    dataset.items.len(),
                    settings.dataset_path.display()
                ),
                CollectOutcome::EmptyBatch => println!(
                    "collect complete: run_id={} sources={} no usable records; dataset left unchanged",
                    summary.run_id, summary.enabled_sources
                ),
            }
        }
        Commands::Clean => {
            let report = run_clean_once(&settings).await?;
            println!(
                "clean complete: kept={} expired={} duplicates={} without_id={} sha256={}",
                report.kept,
                report.dropped_expired,
                report.dropped_duplicates,
                report.dropped_without_id,
                report.receipt.content_hash
            );
        }
        Commands::Serve => {
            let scheduler = maybe_build_scheduler(&settings).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %settings.schedule_cron, "scheduler started alongside dashboard");
            }
            jobfeed_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let mut settings = settings;
            settings.scheduler_enabled = true;
            let Some(mut sched) = maybe_build_scheduler(&settings).await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %settings.schedule_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
