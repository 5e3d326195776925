use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use streaming_compare::catalog::Snapshot;
use streaming_compare::cli::db_counts::{self, DbCountsConfig};
use streaming_compare::cli::{export, query, Aggregate, ExportFormat, FilterArgs, QueryOptions};
use streaming_compare::database_ops::{MemorySnapshotStore, PgSnapshotStore, SnapshotStore};
use streaming_compare::orchestrator::{cancel_on_ctrl_c, RefreshRunner};
use streaming_compare::query::{FilterParams, Filters};
use streaming_compare::tracing::{init_tracing, DEFAULT_FILTER};
use streaming_compare::util::db::Db;
use streaming_compare::util::env as env_util;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "sc", version, about = "Streaming catalog admin CLI")]
struct Cli {
    /// Read snapshots from a JSON file instead of the database
    #[arg(long, global = true)]
    demo: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Fetch both sources, merge and commit a new snapshot
    Refresh {
        /// Run even if the current snapshot is recent
        #[arg(long, default_value_t = false)]
        force: bool,
        /// Stop after merging; nothing is written
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Override REFRESH_REGIONS
        #[arg(long, value_delimiter = ',')]
        regions: Option<Vec<String>>,
        /// Override REFRESH_DETAIL_CONCURRENCY
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Print row counts for the snapshot tables
    Counts {
        /// Optional override for the database URL
        #[arg(long)]
        db_url: Option<String>,
        /// Platforms of the current snapshot to list
        #[arg(long)]
        top: Option<i64>,
    },
    /// List recent snapshots, newest first
    Snapshots {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// List recent refresh runs, newest first
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Delete old snapshots, keeping the newest N (the current one is always kept)
    Prune {
        #[arg(long, default_value_t = 10)]
        keep: i64,
    },
    /// Apply pending schema migrations
    Migrate,
    /// Run one aggregation over the current snapshot and print JSON
    Query {
        #[arg(value_enum)]
        aggregate: Aggregate,
        #[command(flatten)]
        filters: FilterArgs,
        /// N for top-genres / top-countries
        #[arg(long, default_value_t = 5)]
        top: usize,
        /// First year for releases
        #[arg(long, default_value_t = 2000)]
        min_year: i32,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 50)]
        per_page: usize,
    },
    /// Export the current snapshot
    Export {
        #[arg(long, value_enum, default_value_t = ExportFormat::Csv)]
        format: ExportFormat,
        /// Output file (stdout when omitted)
        #[arg(long)]
        out: Option<PathBuf>,
        #[command(flatten)]
        filters: FilterArgs,
    },
}

async fn open_store(demo: Option<&PathBuf>) -> Result<Arc<dyn SnapshotStore>> {
    let store: Arc<dyn SnapshotStore> = match demo {
        Some(path) => Arc::new(
            MemorySnapshotStore::from_json_file(path)
                .await
                .with_context(|| format!("load demo snapshot {}", path.display()))?,
        ),
        None => Arc::new(PgSnapshotStore::new(&Db::from_env().await?)),
    };
    Ok(store)
}

async fn current_snapshot(store: &dyn SnapshotStore) -> Result<Snapshot> {
    match store.load_current().await? {
        Some(snapshot) => Ok(snapshot),
        None => bail!("no snapshot has been committed yet; run `sc refresh` first"),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Refresh {
            force,
            dry_run,
            regions,
            concurrency,
        } => {
            if cli.demo.is_some() {
                bail!("refresh writes to the database; --demo is read-only");
            }
            env_util::preflight_check(
                "sc refresh",
                &["WATCHMODE_KEY"],
                &["TMDB_BASE_URL", "WATCHMODE_BASE_URL", "REFRESH_REGIONS", "REFRESH_SOURCE_TYPES"],
            )?;
            let store = open_store(None).await?;
            let mut runner = RefreshRunner::from_env(store)?;
            let config = runner.config_mut();
            config.force |= force;
            config.dry_run |= dry_run;
            if let Some(regions) = regions {
                config.regions = regions.into_iter().map(|r| r.to_ascii_uppercase()).collect();
            }
            if let Some(n) = concurrency {
                config.detail_concurrency = n.max(1);
            }
            let outcome = runner.run(&cancel_on_ctrl_c()).await?;
            info!(%outcome, "refresh finished");
            print_json(&outcome)
        }
        Commands::Counts { db_url, top } => {
            db_counts::run(DbCountsConfig {
                database_url: db_url,
                top_platforms: top,
            })
            .await
        }
        Commands::Snapshots { limit } => {
            let store = open_store(cli.demo.as_ref()).await?;
            print_json(&store.list(limit.max(1)).await?)
        }
        Commands::Runs { limit } => {
            let store = open_store(cli.demo.as_ref()).await?;
            print_json(&store.recent_runs(limit.max(1)).await?)
        }
        Commands::Prune { keep } => {
            if keep < 1 {
                bail!("--keep must be at least 1");
            }
            let store = open_store(cli.demo.as_ref()).await?;
            let deleted = store.prune(keep).await?;
            info!(deleted, keep, "pruned snapshots");
            println!("deleted {deleted} snapshot(s)");
            Ok(())
        }
        Commands::Migrate => {
            let db = Db::from_env().await?;
            let applied = db.migrate().await?;
            println!("applied {applied} migration(s)");
            Ok(())
        }
        Commands::Query {
            aggregate,
            filters,
            top,
            min_year,
            page,
            per_page,
        } => {
            let store = open_store(cli.demo.as_ref()).await?;
            let snapshot = current_snapshot(store.as_ref()).await?;
            let opts = QueryOptions {
                top,
                min_year,
                page,
                per_page,
            };
            let value = query::run_query(&snapshot.catalog, filters.into(), aggregate, opts)?;
            print_json(&value)
        }
        Commands::Export {
            format,
            out,
            filters,
        } => {
            let store = open_store(cli.demo.as_ref()).await?;
            let snapshot = current_snapshot(store.as_ref()).await?;
            let filters = Filters::try_from(FilterParams::from(filters))?;
            let view = filters.apply(&snapshot.catalog);
            let rows = export::export(&snapshot, &view, format, out.as_deref())?;
            info!(rows, snapshot_id = snapshot.version(), "export written");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_util::init_env();
    if let Err(e) = init_tracing(DEFAULT_FILTER) {
        eprintln!("{e}");
    }
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "sc failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
