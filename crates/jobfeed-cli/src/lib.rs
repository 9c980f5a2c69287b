//! Process setup shared by the jobfeed binaries.

use std::process::ExitCode;

use jobfeed_sync::error_kind;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Loads `.env` when present and installs the fmt subscriber.
pub fn init() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,jobfeed_sync=debug,jobfeed_sources=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Maps a failed run onto a sysexits-style code; unclassified failures exit 1.
pub fn failure_exit_code(err: &anyhow::Error) -> ExitCode {
    ExitCode::from(failure_code(err))
}

fn failure_code(err: &anyhow::Error) -> u8 {
    error_kind(err).map(|kind| kind.exit_code()).unwrap_or(1)
}
