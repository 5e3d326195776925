//! Refresh run: fetch both sources, merge, persist one new snapshot.
//!
//! `Idle -> Fetching -> Normalizing -> Persisting -> Idle`, or `-> Failed`.
//! Runs are serialized per runner; a second call while one is in flight
//! returns `AlreadyRunning` straight away. Nothing durable is written before
//! the persisting stage, so cancelling or failing earlier leaves the current
//! snapshot untouched.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt, TryStreamExt};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::source::listing_stream;
use crate::catalog::{
    AvailabilityKind, AvailabilitySource, CatalogQuery, MetadataId, MetadataSource, RawCatalog,
    RawDetails, RawListing, RawPlatform, SnapshotMeta,
};
use crate::database_ops::tmdb::TmdbProvider;
use crate::database_ops::watchmode::WatchmodeProvider;
use crate::database_ops::{RefreshRunRecord, SnapshotStore};
use crate::error::{PersistenceError, RefreshError, SourceError};
use crate::normalization::{ConflictPolicy, GenreMapper, MergeReport, Merger};
use crate::util::env as env_util;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshState {
    Idle,
    Fetching,
    Normalizing,
    Persisting,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub regions: Vec<String>,
    pub source_types: Vec<AvailabilityKind>,
    /// A run is skipped while the current snapshot is younger than this.
    pub min_gap: chrono::Duration,
    pub detail_concurrency: usize,
    /// Extra commit attempts after a connection-class failure.
    pub persist_retries: u32,
    pub persist_backoff: Duration,
    /// Snapshots to keep after a commit; 0 disables pruning.
    pub retain: i64,
    pub force: bool,
    pub dry_run: bool,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            regions: vec!["US".to_string()],
            source_types: vec![AvailabilityKind::Subscription],
            min_gap: chrono::Duration::days(15),
            detail_concurrency: 8,
            persist_retries: 1,
            persist_backoff: Duration::from_secs(2),
            retain: 10,
            force: false,
            dry_run: false,
        }
    }
}

impl RefreshConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let gap_days: i64 = env_util::env_parse("REFRESH_MIN_GAP_DAYS", 15i64);
        let min_gap = chrono::Duration::try_days(gap_days)
            .ok_or_else(|| anyhow::anyhow!("REFRESH_MIN_GAP_DAYS out of range: {gap_days}"))?;
        let source_types: Vec<AvailabilityKind> = env_util::env_list("REFRESH_SOURCE_TYPES", &["sub"])
            .iter()
            .filter_map(|raw| {
                let parsed = AvailabilityKind::parse(raw);
                if parsed.is_none() {
                    warn!(value = %raw, "ignoring unknown availability type");
                }
                parsed
            })
            .collect();
        Ok(Self {
            regions: env_util::env_list("REFRESH_REGIONS", &["US"])
                .into_iter()
                .map(|r| r.to_ascii_uppercase())
                .collect(),
            source_types: if source_types.is_empty() {
                defaults.source_types
            } else {
                source_types
            },
            min_gap,
            detail_concurrency: env_util::env_parse("REFRESH_DETAIL_CONCURRENCY", 8usize).max(1),
            persist_retries: env_util::env_parse("REFRESH_PERSIST_RETRIES", 1u32),
            persist_backoff: Duration::from_secs(env_util::env_parse(
                "REFRESH_PERSIST_BACKOFF_SECS",
                defaults.persist_backoff.as_secs(),
            )),
            retain: env_util::env_parse("SNAPSHOT_RETAIN", defaults.retain),
            force: env_util::env_flag("REFRESH_FORCE", false),
            dry_run: env_util::env_flag("REFRESH_DRY_RUN", false),
        })
    }
}

/// Whether a new run should start given the current snapshot.
pub fn is_due(current: Option<&SnapshotMeta>, now: DateTime<Utc>, min_gap: chrono::Duration) -> bool {
    match current {
        Some(meta) => now - meta.committed_at >= min_gap,
        None => true,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchStats {
    pub platforms: usize,
    pub listings: usize,
    pub details: usize,
    /// Referenced titles the metadata source has no record of.
    pub missing_details: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Skipped {
        current: SnapshotMeta,
        next_due: DateTime<Utc>,
    },
    DryRun {
        stats: FetchStats,
        report: MergeReport,
    },
    Committed {
        meta: SnapshotMeta,
        stats: FetchStats,
        report: MergeReport,
    },
}

impl std::fmt::Display for RefreshOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshOutcome::Skipped { current, next_due } => write!(
                f,
                "skipped: snapshot {} committed {}, next refresh due {}",
                current.id, current.committed_at, next_due
            ),
            RefreshOutcome::DryRun { stats, report } => write!(
                f,
                "dry run: {} listings, {} details ({} missing) -> {} titles, {} availability, {} conflicts",
                stats.listings,
                stats.details,
                stats.missing_details,
                report.titles_out,
                report.availability_out,
                report.conflicts.len()
            ),
            RefreshOutcome::Committed { meta, report, .. } => write!(
                f,
                "committed snapshot {}: {} titles, {} availability, {} conflicts",
                meta.id,
                meta.title_count,
                meta.availability_count,
                report.conflicts.len()
            ),
        }
    }
}

/// Token cancelled on the first Ctrl-C.
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling refresh");
            token.cancel();
        }
    });
    cancel
}

pub struct RefreshRunner {
    availability: Arc<dyn AvailabilitySource>,
    metadata: Arc<dyn MetadataSource>,
    store: Arc<dyn SnapshotStore>,
    merger: Merger,
    config: RefreshConfig,
    running: Mutex<()>,
    state: watch::Sender<RefreshState>,
}

impl RefreshRunner {
    pub fn new(
        availability: Arc<dyn AvailabilitySource>,
        metadata: Arc<dyn MetadataSource>,
        store: Arc<dyn SnapshotStore>,
        merger: Merger,
        config: RefreshConfig,
    ) -> Self {
        let (state, _rx) = watch::channel(RefreshState::Idle);
        Self {
            availability,
            metadata,
            store,
            merger,
            config,
            running: Mutex::new(()),
            state,
        }
    }

    /// Runner over the live TMDB and Watchmode clients, configured from env.
    pub fn from_env(store: Arc<dyn SnapshotStore>) -> anyhow::Result<Self> {
        let availability = WatchmodeProvider::from_env().context("watchmode client")?;
        let metadata = TmdbProvider::from_env().context("tmdb client")?;
        Ok(Self::new(
            Arc::new(availability),
            Arc::new(metadata),
            store,
            Merger::new(ConflictPolicy::from_env(), GenreMapper::with_defaults()),
            RefreshConfig::from_env()?,
        ))
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut RefreshConfig {
        &mut self.config
    }

    pub fn state(&self) -> RefreshState {
        *self.state.borrow()
    }

    fn enter(&self, next: RefreshState) {
        let prev = self.state.send_replace(next);
        debug!(from = ?prev, to = ?next, "refresh state");
    }

    #[instrument(skip(self, cancel), fields(force = self.config.force, dry_run = self.config.dry_run))]
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RefreshOutcome, RefreshError> {
        let _guard = self
            .running
            .try_lock()
            .map_err(|_| RefreshError::AlreadyRunning)?;
        // Shared with runners in other processes over the same store.
        let Some(lease) = self.store.try_lease().await? else {
            info!("another refresh holds the lease");
            return Err(RefreshError::AlreadyRunning);
        };

        let result = self.run_leased(cancel).await;
        if let Err(e) = lease.release().await {
            warn!(error = %e, "could not release refresh lease");
        }
        result
    }

    async fn run_leased(&self, cancel: &CancellationToken) -> Result<RefreshOutcome, RefreshError> {
        let started_at = Utc::now();
        let current = self.store.current_meta().await?;
        if !self.config.force && !is_due(current.as_ref(), started_at, self.config.min_gap) {
            if let Some(current) = current {
                let next_due = current.committed_at + self.config.min_gap;
                info!(
                    snapshot_id = current.id,
                    committed_at = %current.committed_at,
                    next_due = %next_due,
                    "current snapshot is recent; skipping refresh"
                );
                self.enter(RefreshState::Idle);
                return Ok(RefreshOutcome::Skipped { current, next_due });
            }
        }

        let mut stats = FetchStats::default();
        let result = self.execute(cancel, &mut stats).await;
        match &result {
            Ok(outcome) => {
                self.enter(RefreshState::Idle);
                if let RefreshOutcome::Committed { meta, .. } = outcome {
                    info!(snapshot_id = meta.id, "refresh completed");
                }
            }
            Err(e) => {
                self.enter(RefreshState::Failed);
                error!(error = %e, "refresh failed");
            }
        }
        self.record(started_at, &stats, &result).await;
        result
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        stats: &mut FetchStats,
    ) -> Result<RefreshOutcome, RefreshError> {
        self.enter(RefreshState::Fetching);
        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(RefreshError::Cancelled { stage: RefreshState::Fetching });
            }
            fetched = self.fetch(stats) => fetched?,
        };

        self.enter(RefreshState::Normalizing);
        let output = self.merger.merge(&raw);
        drop(raw);
        if cancel.is_cancelled() {
            return Err(RefreshError::Cancelled {
                stage: RefreshState::Normalizing,
            });
        }

        if self.config.dry_run {
            info!(
                titles = output.report.titles_out,
                availability = output.report.availability_out,
                "dry run; nothing persisted"
            );
            return Ok(RefreshOutcome::DryRun {
                stats: stats.clone(),
                report: output.report,
            });
        }

        self.enter(RefreshState::Persisting);
        let meta = self.persist(&output.catalog).await?;
        if self.config.retain > 0 {
            if let Err(e) = self.store.prune(self.config.retain).await {
                warn!(error = %e, "pruning old snapshots failed");
            }
        }
        Ok(RefreshOutcome::Committed {
            meta,
            stats: stats.clone(),
            report: output.report,
        })
    }

    async fn fetch(&self, stats: &mut FetchStats) -> Result<RawCatalog, SourceError> {
        let ((platforms, listings), reference) =
            tokio::try_join!(self.fetch_listings(), self.metadata.reference_data())?;
        stats.platforms = platforms;
        stats.listings = listings.len();

        let ids: BTreeSet<MetadataId> = listings.iter().filter_map(RawListing::metadata_id).collect();
        info!(
            platforms,
            listings = listings.len(),
            titles = ids.len(),
            "availability fetched; pulling details"
        );

        let metadata = &self.metadata;
        let fetched: Vec<Option<RawDetails>> = stream::iter(ids)
            .map(|id| async move {
                match metadata.details(id).await {
                    Ok(details) => Ok(Some(details)),
                    Err(SourceError::NotFound { .. }) => {
                        debug!(tmdb_id = id.tmdb_id, kind = id.kind.as_str(), "no details upstream");
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            })
            .buffer_unordered(self.config.detail_concurrency.max(1))
            .try_collect()
            .await?;

        let total = fetched.len();
        let details: Vec<RawDetails> = fetched.into_iter().flatten().collect();
        stats.details = details.len();
        stats.missing_details = total - details.len();
        info!(
            pulled = details.len(),
            requested = total,
            missing = stats.missing_details,
            "title details pulled"
        );

        Ok(RawCatalog {
            listings,
            details,
            reference,
        })
    }

    async fn fetch_listings(&self) -> Result<(usize, Vec<RawListing>), SourceError> {
        let mut platforms: BTreeSet<RawPlatform> = BTreeSet::new();
        for region in &self.config.regions {
            for kind in &self.config.source_types {
                let query = CatalogQuery {
                    region: region.clone(),
                    kind: *kind,
                };
                platforms.extend(self.availability.platforms(&query).await?);
            }
        }

        let mut listings = Vec::new();
        for platform in &platforms {
            let page: Vec<RawListing> =
                listing_stream(self.availability.as_ref(), platform).try_collect().await?;
            debug!(
                platform = %platform.name,
                region = %platform.region,
                titles = page.len(),
                "platform catalog fetched"
            );
            listings.extend(page);
        }
        Ok((platforms.len(), listings))
    }

    async fn persist(
        &self,
        catalog: &crate::catalog::UnifiedCatalog,
    ) -> Result<SnapshotMeta, PersistenceError> {
        let mut attempt: u32 = 0;
        loop {
            match self.store.commit(catalog).await {
                Ok(meta) => return Ok(meta),
                Err(e) if e.is_retryable() && attempt < self.config.persist_retries => {
                    attempt += 1;
                    warn!(error = %e, attempt, "snapshot commit failed; retrying");
                    tokio::time::sleep(self.config.persist_backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn record(
        &self,
        started_at: DateTime<Utc>,
        stats: &FetchStats,
        result: &Result<RefreshOutcome, RefreshError>,
    ) {
        let (state, snapshot_id, report, error) = match result {
            Ok(RefreshOutcome::Committed { meta, report, .. }) => {
                ("committed", Some(meta.id), Some(report), None)
            }
            Ok(RefreshOutcome::DryRun { report, .. }) => ("dry_run", None, Some(report), None),
            Ok(RefreshOutcome::Skipped { .. }) => return,
            Err(RefreshError::Cancelled { .. }) => ("cancelled", None, None, None),
            Err(e) => ("failed", None, None, Some(e.to_string())),
        };
        let run = RefreshRunRecord {
            started_at,
            finished_at: Utc::now(),
            state: state.to_string(),
            forced: self.config.force,
            snapshot_id,
            listings: stats.listings as i64,
            details: stats.details as i64,
            missing_details: stats.missing_details as i64,
            titles: report.map_or(0, |r| r.titles_out as i64),
            availability: report.map_or(0, |r| r.availability_out as i64),
            conflicts: report.map_or(0, |r| r.conflicts.len() as i64),
            error,
        };
        if let Err(e) = self.store.record_run(&run).await {
            warn!(error = %e, "could not record refresh run");
        }
    }
}
