use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool, Row,
};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

use crate::util::env as env_util;

/// Embedded migrations as (version, description, sql).
const MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "snapshots",
    include_str!("../../migrations/0001_snapshots.sql"),
)];

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    /// Connect using `DATABASE_URL` and `DB_MAX_CONNS` (default 5).
    pub async fn from_env() -> Result<Self> {
        let url = env_util::db_url()?;
        let max = env_util::env_parse("DB_MAX_CONNS", 5u32);
        Self::connect(&url, max).await
    }

    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options =
            PgConnectOptions::from_str(database_url).context("parse DATABASE_URL")?;

        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }
        if !env_util::env_flag("USE_PREPARED", false) {
            // PgBouncer txn mode safe
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await
            .context("connect to postgres")?;
        info!(max_connections, "connected to db");

        let db = Self { pool };
        if env_util::env_flag("AUTO_MIGRATE", true) {
            db.migrate().await?;
        } else {
            info!("AUTO_MIGRATE disabled; skipping migrations");
        }
        Ok(db)
    }

    /// Applies embedded migrations not yet recorded in `schema_migrations`.
    pub async fn migrate(&self) -> Result<usize> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version BIGINT PRIMARY KEY,
                description TEXT,
                installed_at TIMESTAMPTZ DEFAULT now()
             )",
        )
        .execute(&self.pool)
        .await?;

        let applied: HashSet<i64> = sqlx::raw_sql("SELECT version FROM schema_migrations")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|r| r.try_get::<i64, _>(0))
            .collect::<Result<_, _>>()?;

        let mut count = 0;
        for migration in pending(MIGRATIONS, &applied) {
            let &(version, description, sql) = migration;
            info!(version, description, "applying migration");
            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(sql)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("migration {version}_{description}"))?;
            sqlx::query("INSERT INTO schema_migrations (version, description) VALUES ($1, $2)")
                .persistent(false)
                .bind(version)
                .bind(description)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            count += 1;
        }
        if count == 0 {
            info!("schema up to date");
        }
        Ok(count)
    }
}

fn pending<'a>(
    all: &'a [(i64, &'a str, &'a str)],
    applied: &HashSet<i64>,
) -> Vec<&'a (i64, &'a str, &'a str)> {
    let mut out: Vec<_> = all.iter().filter(|(v, _, _)| !applied.contains(v)).collect();
    out.sort_by_key(|(v, _, _)| *v);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_skips_applied_versions_in_order() {
        let all = [(3, "c", ""), (1, "a", ""), (2, "b", "")];
        let applied: HashSet<i64> = [2].into_iter().collect();
        let versions: Vec<i64> = pending(&all, &applied).iter().map(|m| m.0).collect();
        assert_eq!(versions, vec![1, 3]);
    }

    #[test]
    fn embedded_schema_declares_every_table() {
        let (_, _, sql) = MIGRATIONS[0];
        for table in [
            "snapshots",
            "current_snapshot",
            "titles",
            "availability",
            "refresh_runs",
        ] {
            assert!(
                sql.contains(&format!("CREATE TABLE IF NOT EXISTS {table} ")),
                "missing {table}"
            );
        }
    }
}
