//! Standalone retention cleaner: rewrites the dataset in place and exits with
//! a code that says what went wrong.

use std::process::ExitCode;

use jobfeed_sync::{run_clean_once, SyncSettings};
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    jobfeed_cli::init();

    match run_clean_once(&SyncSettings::from_env()).await {
        Ok(report) => {
            println!(
                "Cleaned: kept {} (expired {}, duplicates {}, without id {})",
                report.kept, report.dropped_expired, report.dropped_duplicates, report.dropped_without_id
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("clean failed: {err:#}");
            jobfeed_cli::failure_exit_code(&err)
        }
    }
}
