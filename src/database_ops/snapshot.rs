//! Durable snapshot storage.
//!
//! Each refresh writes a complete new snapshot in one transaction and then
//! moves the `current_snapshot` pointer. Readers only ever see fully
//! committed snapshots; a failed write leaves the previous one current.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{pool::PoolConnection, postgres::PgRow, PgConnection, PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info, instrument};

use crate::catalog::{
    AvailabilityKind, AvailabilityRecord, MediaKind, Snapshot, SnapshotMeta, Title, TitleId,
    UnifiedCatalog,
};
use crate::error::PersistenceError;
use crate::util::db::Db;

/// Channel notified after every successful commit; payload is the new id.
pub const SNAPSHOT_CHANNEL: &str = "snapshot_committed";
/// Advisory lock serializing snapshot writers across processes.
const WRITER_LOCK_KEY: i64 = 0x5c_0a7a_1096;
/// Session advisory lock held for the whole of a refresh run.
const RUN_LOCK_KEY: i64 = 0x5c_0a7a_1097;
// Postgres caps bind parameters at 65535 per statement.
const TITLE_CHUNK: usize = 1_000;
const AVAILABILITY_CHUNK: usize = 4_000;

/// One refresh attempt, as recorded for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshRunRecord {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: String,
    pub forced: bool,
    pub snapshot_id: Option<i64>,
    pub listings: i64,
    pub details: i64,
    pub missing_details: i64,
    pub titles: i64,
    pub availability: i64,
    pub conflicts: i64,
    pub error: Option<String>,
}

/// Exclusive right to run a refresh, held until released or dropped.
#[async_trait]
pub trait RunLease: Send {
    async fn release(self: Box<Self>) -> Result<(), PersistenceError>;
}

/// Rejects a loaded snapshot whose rows do not hash to the recorded value,
/// e.g. rows pruned between reading the pointer and reading the rows.
pub fn verified(snapshot: Snapshot) -> Result<Snapshot, PersistenceError> {
    let actual = snapshot.catalog.content_hash();
    if actual != snapshot.meta.content_hash {
        return Err(PersistenceError::Corrupt(format!(
            "snapshot {} hashes to {actual}, recorded {}",
            snapshot.meta.id, snapshot.meta.content_hash
        )));
    }
    Ok(snapshot)
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn current_meta(&self) -> Result<Option<SnapshotMeta>, PersistenceError>;

    /// The current snapshot, read consistently and checked against its hash.
    async fn load_current(&self) -> Result<Option<Snapshot>, PersistenceError>;

    /// Writes `catalog` as a new snapshot and makes it current, atomically.
    async fn commit(&self, catalog: &UnifiedCatalog) -> Result<SnapshotMeta, PersistenceError>;

    /// Newest first.
    async fn list(&self, limit: i64) -> Result<Vec<SnapshotMeta>, PersistenceError>;

    /// Deletes all but the newest `keep` snapshots. The current snapshot is
    /// never deleted. Returns the number removed.
    async fn prune(&self, keep: i64) -> Result<u64, PersistenceError>;

    async fn record_run(&self, run: &RefreshRunRecord) -> Result<(), PersistenceError>;

    /// Newest first.
    async fn recent_runs(&self, limit: i64) -> Result<Vec<RefreshRunRecord>, PersistenceError>;

    /// Claims the refresh lease shared by every process using this store.
    /// `None` when another run holds it.
    async fn try_lease(&self) -> Result<Option<Box<dyn RunLease>>, PersistenceError>;
}

#[derive(Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    pub fn new(db: &Db) -> Self {
        Self {
            pool: db.pool.clone(),
        }
    }

    async fn load(conn: &mut PgConnection, meta: SnapshotMeta) -> Result<Snapshot, PersistenceError> {
        let title_rows = sqlx::query(
            "SELECT title_id, name, kind, release_year, genres, languages, countries,
                    tmdb_id, imdb_id, watchmode_id, vote_average, vote_count, popularity,
                    runtime_minutes, status
             FROM titles WHERE snapshot_id = $1",
        )
        .persistent(false)
        .bind(meta.id)
        .fetch_all(&mut *conn)
        .await
        .map_err(read_err)?;

        let availability_rows = sqlx::query(
            "SELECT title_id, platform, platform_id, region, kind, observed_at
             FROM availability WHERE snapshot_id = $1",
        )
        .persistent(false)
        .bind(meta.id)
        .fetch_all(&mut *conn)
        .await
        .map_err(read_err)?;

        let mut catalog = UnifiedCatalog::default();
        for row in &title_rows {
            let title = title_from_row(row)?;
            catalog.titles.insert(title.id.clone(), title);
        }
        catalog.availability = availability_rows
            .iter()
            .map(availability_from_row)
            .collect::<Result<_, _>>()?;
        catalog.sort_availability();
        Ok(Snapshot { meta, catalog })
    }
}

/// Holds the pooled connection that owns the session lock. Dropping it
/// without `release` closes the connection, which frees the lock.
struct PgRunLease {
    conn: Option<PoolConnection<Postgres>>,
}

#[async_trait]
impl RunLease for PgRunLease {
    async fn release(mut self: Box<Self>) -> Result<(), PersistenceError> {
        if let Some(mut conn) = self.conn.take() {
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .persistent(false)
                .bind(RUN_LOCK_KEY)
                .execute(&mut *conn)
                .await?;
            debug!("refresh lease released");
        }
        Ok(())
    }
}

impl Drop for PgRunLease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

fn read_err(err: sqlx::Error) -> PersistenceError {
    match PersistenceError::from(err) {
        PersistenceError::Write(msg) => PersistenceError::Read(msg),
        other => other,
    }
}

fn meta_from_row(row: &PgRow) -> Result<SnapshotMeta, PersistenceError> {
    Ok(SnapshotMeta {
        id: row.try_get("id")?,
        committed_at: row.try_get("committed_at")?,
        content_hash: row.try_get("content_hash")?,
        title_count: row.try_get("title_count")?,
        availability_count: row.try_get("availability_count")?,
    })
}

fn title_from_row(row: &PgRow) -> Result<Title, PersistenceError> {
    let kind_raw: String = row.try_get("kind")?;
    let kind = MediaKind::parse(&kind_raw)
        .ok_or_else(|| PersistenceError::Corrupt(format!("unknown media kind {kind_raw:?}")))?;
    let genres: Vec<String> = row.try_get("genres")?;
    let languages: Vec<String> = row.try_get("languages")?;
    let countries: Vec<String> = row.try_get("countries")?;
    Ok(Title {
        id: TitleId(row.try_get("title_id")?),
        name: row.try_get("name")?,
        kind,
        release_year: row.try_get("release_year")?,
        genres: genres.into_iter().collect(),
        languages: languages.into_iter().collect(),
        countries: countries.into_iter().collect(),
        tmdb_id: row.try_get("tmdb_id")?,
        imdb_id: row.try_get("imdb_id")?,
        watchmode_id: row.try_get("watchmode_id")?,
        vote_average: row.try_get("vote_average")?,
        vote_count: row.try_get("vote_count")?,
        popularity: row.try_get("popularity")?,
        runtime_minutes: row.try_get("runtime_minutes")?,
        status: row.try_get("status")?,
    })
}

fn availability_from_row(row: &PgRow) -> Result<AvailabilityRecord, PersistenceError> {
    let kind_raw: String = row.try_get("kind")?;
    let kind = AvailabilityKind::parse(&kind_raw).ok_or_else(|| {
        PersistenceError::Corrupt(format!("unknown availability kind {kind_raw:?}"))
    })?;
    Ok(AvailabilityRecord {
        title_id: TitleId(row.try_get("title_id")?),
        platform: row.try_get("platform")?,
        platform_id: row.try_get("platform_id")?,
        region: row.try_get("region")?,
        kind,
        observed_at: row.try_get("observed_at")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<RefreshRunRecord, PersistenceError> {
    Ok(RefreshRunRecord {
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        state: row.try_get("state")?,
        forced: row.try_get("forced")?,
        snapshot_id: row.try_get("snapshot_id")?,
        listings: row.try_get("listings")?,
        details: row.try_get("details")?,
        missing_details: row.try_get("missing_details")?,
        titles: row.try_get("titles")?,
        availability: row.try_get("availability")?,
        conflicts: row.try_get("conflicts")?,
        error: row.try_get("error")?,
    })
}

const META_COLUMNS: &str = "s.id, s.committed_at, s.content_hash, s.title_count, s.availability_count";

async fn fetch_current_meta(conn: &mut PgConnection) -> Result<Option<SnapshotMeta>, PersistenceError> {
    let row = sqlx::query(&format!(
        "SELECT {META_COLUMNS} FROM current_snapshot c JOIN snapshots s ON s.id = c.snapshot_id"
    ))
    .persistent(false)
    .fetch_optional(&mut *conn)
    .await
    .map_err(read_err)?;
    row.as_ref().map(meta_from_row).transpose()
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn current_meta(&self) -> Result<Option<SnapshotMeta>, PersistenceError> {
        let mut conn = self.pool.acquire().await.map_err(read_err)?;
        fetch_current_meta(&mut conn).await
    }

    #[instrument(skip(self))]
    async fn load_current(&self) -> Result<Option<Snapshot>, PersistenceError> {
        // One snapshot of the database for the pointer and every row, so a
        // concurrent commit or prune cannot mix or drop rows.
        let mut tx = self.pool.begin().await.map_err(read_err)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .persistent(false)
            .execute(&mut *tx)
            .await
            .map_err(read_err)?;
        let Some(meta) = fetch_current_meta(&mut tx).await? else {
            tx.rollback().await.map_err(read_err)?;
            return Ok(None);
        };
        let snapshot = Self::load(&mut tx, meta).await?;
        tx.commit().await.map_err(read_err)?;
        verified(snapshot).map(Some)
    }

    #[instrument(skip(self, catalog), fields(titles = catalog.titles.len(), availability = catalog.availability.len()))]
    async fn commit(&self, catalog: &UnifiedCatalog) -> Result<SnapshotMeta, PersistenceError> {
        let content_hash = catalog.content_hash();
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .persistent(false)
            .bind(WRITER_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(
            "INSERT INTO snapshots (content_hash, title_count, availability_count)
             VALUES ($1, $2, $3)
             RETURNING id, committed_at, content_hash, title_count, availability_count",
        )
        .persistent(false)
        .bind(&content_hash)
        .bind(catalog.titles.len() as i64)
        .bind(catalog.availability.len() as i64)
        .fetch_one(&mut *tx)
        .await?;
        let meta = meta_from_row(&row)?;

        let titles: Vec<&Title> = catalog.titles.values().collect();
        for chunk in titles.chunks(TITLE_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO titles (snapshot_id, title_id, name, kind, release_year, genres,
                 languages, countries, tmdb_id, imdb_id, watchmode_id, vote_average, vote_count,
                 popularity, runtime_minutes, status) ",
            );
            qb.push_values(chunk.iter(), |mut b, t| {
                b.push_bind(meta.id)
                    .push_bind(t.id.0.clone())
                    .push_bind(t.name.clone())
                    .push_bind(t.kind.as_str())
                    .push_bind(t.release_year)
                    .push_bind(t.genres.iter().cloned().collect::<Vec<String>>())
                    .push_bind(t.languages.iter().cloned().collect::<Vec<String>>())
                    .push_bind(t.countries.iter().cloned().collect::<Vec<String>>())
                    .push_bind(t.tmdb_id)
                    .push_bind(t.imdb_id.clone())
                    .push_bind(t.watchmode_id)
                    .push_bind(t.vote_average)
                    .push_bind(t.vote_count)
                    .push_bind(t.popularity)
                    .push_bind(t.runtime_minutes)
                    .push_bind(t.status.clone());
            });
            qb.build().persistent(false).execute(&mut *tx).await?;
        }

        for chunk in catalog.availability.chunks(AVAILABILITY_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO availability (snapshot_id, title_id, platform, platform_id, region,
                 kind, observed_at) ",
            );
            qb.push_values(chunk.iter(), |mut b, a| {
                b.push_bind(meta.id)
                    .push_bind(a.title_id.0.clone())
                    .push_bind(a.platform.clone())
                    .push_bind(a.platform_id)
                    .push_bind(a.region.clone())
                    .push_bind(a.kind.as_str())
                    .push_bind(a.observed_at);
            });
            qb.build().persistent(false).execute(&mut *tx).await?;
        }

        sqlx::query(
            "INSERT INTO current_snapshot (singleton, snapshot_id, updated_at)
             VALUES (TRUE, $1, now())
             ON CONFLICT (singleton)
             DO UPDATE SET snapshot_id = EXCLUDED.snapshot_id, updated_at = EXCLUDED.updated_at",
        )
        .persistent(false)
        .bind(meta.id)
        .execute(&mut *tx)
        .await?;

        // Delivered to listeners only once the transaction commits.
        sqlx::query("SELECT pg_notify($1, $2)")
            .persistent(false)
            .bind(SNAPSHOT_CHANNEL)
            .bind(meta.id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(
            snapshot_id = meta.id,
            hash = %meta.content_hash,
            titles = meta.title_count,
            availability = meta.availability_count,
            "snapshot committed"
        );
        Ok(meta)
    }

    async fn list(&self, limit: i64) -> Result<Vec<SnapshotMeta>, PersistenceError> {
        let rows = sqlx::query(&format!(
            "SELECT {META_COLUMNS} FROM snapshots s ORDER BY s.id DESC LIMIT $1"
        ))
        .persistent(false)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(read_err)?;
        rows.iter().map(meta_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn prune(&self, keep: i64) -> Result<u64, PersistenceError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .persistent(false)
            .bind(WRITER_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query(
            "DELETE FROM snapshots
             WHERE id NOT IN (SELECT id FROM snapshots ORDER BY id DESC LIMIT $1)
               AND id <> COALESCE((SELECT snapshot_id FROM current_snapshot), -1)",
        )
        .persistent(false)
        .bind(keep.max(0))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        let removed = result.rows_affected();
        info!(removed, keep, "snapshots pruned");
        Ok(removed)
    }

    async fn record_run(&self, run: &RefreshRunRecord) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO refresh_runs (started_at, finished_at, state, forced, snapshot_id,
                 listings, details, missing_details, titles, availability, conflicts, error)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .persistent(false)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(&run.state)
        .bind(run.forced)
        .bind(run.snapshot_id)
        .bind(run.listings)
        .bind(run.details)
        .bind(run.missing_details)
        .bind(run.titles)
        .bind(run.availability)
        .bind(run.conflicts)
        .bind(&run.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<RefreshRunRecord>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT started_at, finished_at, state, forced, snapshot_id, listings, details,
                    missing_details, titles, availability, conflicts, error
             FROM refresh_runs ORDER BY id DESC LIMIT $1",
        )
        .persistent(false)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(read_err)?;
        rows.iter().map(run_from_row).collect()
    }

    async fn try_lease(&self) -> Result<Option<Box<dyn RunLease>>, PersistenceError> {
        let mut conn = self.pool.acquire().await?;
        let granted: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .persistent(false)
            .bind(RUN_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await?;
        if !granted {
            return Ok(None);
        }
        debug!("refresh lease acquired");
        Ok(Some(Box::new(PgRunLease { conn: Some(conn) })))
    }
}
