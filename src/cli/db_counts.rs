use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::Row;
use std::fmt::Write as _;
use std::str::FromStr;

use crate::util::env as env_util;

#[derive(Debug, Clone, Default)]
pub struct DbCountsConfig {
    /// Optional override for the Postgres connection string.
    pub database_url: Option<String>,
    /// How many platforms of the current snapshot to list (default 10).
    pub top_platforms: Option<i64>,
}

fn is_undefined_table_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("42P01"),
        _ => false,
    }
}

/// Prints table sizes and a breakdown of the current snapshot. Tables that
/// do not exist yet (fresh database) count as zero.
pub async fn run(cfg: DbCountsConfig) -> Result<()> {
    env_util::init_env();
    let db_url = match cfg.database_url.clone() {
        Some(url) => url,
        None => env_util::db_url()?,
    };
    let mut connect_options = PgConnectOptions::from_str(&db_url)?.statement_cache_capacity(0);
    if db_url.contains("sslmode=require") {
        connect_options = connect_options.ssl_mode(PgSslMode::Require);
    }
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect_with(connect_options)
        .await?;

    macro_rules! count {
        ($sql:expr) => {
            match sqlx::query_scalar::<_, i64>($sql)
                .persistent(false)
                .fetch_one(&pool)
                .await
            {
                Ok(val) => val,
                Err(e) if is_undefined_table_error(&e) => 0,
                Err(e) => return Err(e.into()),
            }
        };
    }

    let snapshots = count!("SELECT count(*) FROM snapshots");
    let titles = count!("SELECT count(*) FROM titles");
    let availability = count!("SELECT count(*) FROM availability");
    let runs = count!("SELECT count(*) FROM refresh_runs");
    let failed_runs = count!("SELECT count(*) FROM refresh_runs WHERE state = 'failed'");

    let mut out = String::new();
    writeln!(out, "DB COUNTS SUMMARY:").ok();
    writeln!(out, "snapshots: {snapshots}").ok();
    writeln!(out, "titles (all snapshots): {titles}").ok();
    writeln!(out, "availability (all snapshots): {availability}").ok();
    writeln!(out, "refresh_runs: {runs} (failed: {failed_runs})").ok();

    let current = sqlx::query(
        "SELECT s.id, s.committed_at, s.title_count, s.availability_count
         FROM current_snapshot c JOIN snapshots s ON s.id = c.snapshot_id",
    )
    .persistent(false)
    .fetch_optional(&pool)
    .await;
    let current = match current {
        Ok(row) => row,
        Err(e) if is_undefined_table_error(&e) => None,
        Err(e) => return Err(e.into()),
    };

    match current {
        None => {
            writeln!(out, "current snapshot: none").ok();
        }
        Some(row) => {
            let id: i64 = row.get("id");
            let committed_at: DateTime<Utc> = row.get("committed_at");
            let title_count: i64 = row.get("title_count");
            let availability_count: i64 = row.get("availability_count");
            writeln!(
                out,
                "current snapshot: #{id} committed {committed_at} ({title_count} titles, {availability_count} availability)"
            )
            .ok();

            let limit = cfg.top_platforms.unwrap_or(10).max(1);
            let rows = sqlx::query(
                "SELECT platform, count(DISTINCT title_id) AS titles
                 FROM availability WHERE snapshot_id = $1
                 GROUP BY platform ORDER BY titles DESC, platform LIMIT $2",
            )
            .bind(id)
            .bind(limit)
            .persistent(false)
            .fetch_all(&pool)
            .await?;
            if !rows.is_empty() {
                writeln!(out, "  top platforms (limit {limit}):").ok();
                for row in rows {
                    let platform: String = row.get("platform");
                    let titles: i64 = row.get("titles");
                    writeln!(out, "    {platform}: {titles}").ok();
                }
            }
        }
    }

    let last_run = sqlx::query(
        "SELECT state, finished_at, error FROM refresh_runs ORDER BY id DESC LIMIT 1",
    )
    .persistent(false)
    .fetch_optional(&pool)
    .await
    .unwrap_or(None);
    if let Some(row) = last_run {
        let state: String = row.get("state");
        let finished_at: DateTime<Utc> = row.get("finished_at");
        let error: Option<String> = row.get("error");
        writeln!(
            out,
            "last refresh: {state} at {finished_at}{}",
            error.map(|e| format!(" ({e})")).unwrap_or_default()
        )
        .ok();
    }

    println!("{}", out);
    Ok(())
}
