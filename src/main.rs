//! Scheduled refresh job. Takes no arguments: configuration comes from the
//! environment (and `.env`). Exits 0 when a snapshot was committed or the
//! current one is still fresh, non-zero with a diagnostic otherwise.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use streaming_compare::database_ops::{PgSnapshotStore, SnapshotStore};
use streaming_compare::orchestrator::{cancel_on_ctrl_c, RefreshOutcome, RefreshRunner};
use streaming_compare::tracing::{init_tracing, DEFAULT_FILTER};
use streaming_compare::util::db::Db;
use streaming_compare::util::env as env_util;
use tracing::{error, info};

async fn run() -> Result<RefreshOutcome> {
    env_util::preflight_check(
        "streaming-compare refresh",
        &["WATCHMODE_KEY"],
        &[
            "DATABASE_URL",
            "TMDB_BASE_URL",
            "WATCHMODE_BASE_URL",
            "REFRESH_REGIONS",
            "REFRESH_SOURCE_TYPES",
            "REFRESH_MIN_GAP_DAYS",
        ],
    )?;

    // --- DB connect ----------------------------------------------------------
    let db = Db::from_env().await.context("connect snapshot store")?;
    let store: Arc<dyn SnapshotStore> = Arc::new(PgSnapshotStore::new(&db));

    // --- refresh -------------------------------------------------------------
    let runner = RefreshRunner::from_env(store)?;
    let outcome = runner.run(&cancel_on_ctrl_c()).await?;
    Ok(outcome)
}

#[tokio::main]
async fn main() -> ExitCode {
    env_util::init_env();
    if let Err(e) = init_tracing(DEFAULT_FILTER) {
        eprintln!("{e}");
    }

    match run().await {
        Ok(outcome) => {
            info!(%outcome, "refresh job finished");
            println!("{outcome}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "refresh job failed");
            eprintln!("refresh failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}
