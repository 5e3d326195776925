//! In-process snapshot store. Backs the tests and the demo mode, where a
//! snapshot is read from a local JSON file instead of the database.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use tokio::sync::Mutex;
use tracing::info;

use super::snapshot::{verified, RefreshRunRecord, RunLease, SnapshotStore};
use crate::catalog::{Snapshot, SnapshotMeta, UnifiedCatalog};
use crate::error::PersistenceError;

#[derive(Default)]
struct State {
    snapshots: Vec<Snapshot>,
    current: Option<i64>,
    runs: Vec<RefreshRunRecord>,
    next_id: i64,
}

#[derive(Default)]
pub struct MemorySnapshotStore {
    state: Mutex<State>,
    fail_next_commit: AtomicBool,
    truncate_next_load: AtomicBool,
    leased: Arc<AtomicBool>,
}

struct MemoryRunLease {
    leased: Arc<AtomicBool>,
}

#[async_trait]
impl RunLease for MemoryRunLease {
    async fn release(self: Box<Self>) -> Result<(), PersistenceError> {
        Ok(())
    }
}

impl Drop for MemoryRunLease {
    fn drop(&mut self) {
        self.leased.store(false, Ordering::SeqCst);
    }
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a demo dataset. Accepts either a full snapshot (as written by
    /// `sc export --format json`) or a bare catalog.
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| PersistenceError::Read(format!("{}: {e}", path.display())))?;
        let catalog = match serde_json::from_slice::<Snapshot>(&bytes) {
            Ok(snapshot) => snapshot.catalog,
            Err(_) => serde_json::from_slice::<UnifiedCatalog>(&bytes)
                .map_err(|e| PersistenceError::Corrupt(format!("{}: {e}", path.display())))?,
        };
        let store = Self::new();
        let meta = store.commit(&catalog).await?;
        info!(
            path = %path.display(),
            titles = meta.title_count,
            availability = meta.availability_count,
            "demo snapshot loaded"
        );
        Ok(store)
    }

    /// Makes the next `commit` fail with a connection error.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Makes the next `load_current` see the current snapshot without its
    /// availability rows, as a read racing a prune would.
    pub fn truncate_next_load(&self) {
        self.truncate_next_load.store(true, Ordering::SeqCst);
    }

    pub async fn runs(&self) -> Vec<RefreshRunRecord> {
        self.state.lock().await.runs.clone()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn current_meta(&self) -> Result<Option<SnapshotMeta>, PersistenceError> {
        let state = self.state.lock().await;
        Ok(state
            .current
            .and_then(|id| state.snapshots.iter().find(|s| s.meta.id == id))
            .map(|s| s.meta.clone()))
    }

    async fn load_current(&self) -> Result<Option<Snapshot>, PersistenceError> {
        let state = self.state.lock().await;
        let Some(mut snapshot) = state
            .current
            .and_then(|id| state.snapshots.iter().find(|s| s.meta.id == id))
            .cloned()
        else {
            return Ok(None);
        };
        if self.truncate_next_load.swap(false, Ordering::SeqCst) {
            snapshot.catalog.availability.clear();
        }
        verified(snapshot).map(Some)
    }

    async fn commit(&self, catalog: &UnifiedCatalog) -> Result<SnapshotMeta, PersistenceError> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(PersistenceError::Connection(
                "simulated connection loss".into(),
            ));
        }
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let meta = SnapshotMeta {
            id: state.next_id,
            committed_at: Utc::now().trunc_subsecs(0),
            content_hash: catalog.content_hash(),
            title_count: catalog.titles.len() as i64,
            availability_count: catalog.availability.len() as i64,
        };
        state.snapshots.push(Snapshot {
            meta: meta.clone(),
            catalog: catalog.clone(),
        });
        state.current = Some(meta.id);
        Ok(meta)
    }

    async fn list(&self, limit: i64) -> Result<Vec<SnapshotMeta>, PersistenceError> {
        let state = self.state.lock().await;
        Ok(state
            .snapshots
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .map(|s| s.meta.clone())
            .collect())
    }

    async fn prune(&self, keep: i64) -> Result<u64, PersistenceError> {
        let mut state = self.state.lock().await;
        let keep = keep.max(0) as usize;
        let current = state.current;
        let before = state.snapshots.len();
        let cutoff = before.saturating_sub(keep);
        let mut idx = 0;
        state.snapshots.retain(|s| {
            let kept = idx >= cutoff || Some(s.meta.id) == current;
            idx += 1;
            kept
        });
        Ok((before - state.snapshots.len()) as u64)
    }

    async fn record_run(&self, run: &RefreshRunRecord) -> Result<(), PersistenceError> {
        self.state.lock().await.runs.push(run.clone());
        Ok(())
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<RefreshRunRecord>, PersistenceError> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn try_lease(&self) -> Result<Option<Box<dyn RunLease>>, PersistenceError> {
        if self.leased.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(Box::new(MemoryRunLease {
            leased: self.leased.clone(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MediaKind, Title, TitleId};
    use std::collections::BTreeSet;

    fn catalog(names: &[&str]) -> UnifiedCatalog {
        let mut catalog = UnifiedCatalog::default();
        for (i, name) in names.iter().enumerate() {
            let id = TitleId(format!("watchmode:{i}"));
            catalog.titles.insert(
                id.clone(),
                Title {
                    id,
                    name: name.to_string(),
                    kind: MediaKind::Movie,
                    release_year: Some(2020),
                    genres: BTreeSet::new(),
                    languages: BTreeSet::new(),
                    countries: BTreeSet::new(),
                    tmdb_id: None,
                    imdb_id: None,
                    watchmode_id: Some(i as i64),
                    vote_average: None,
                    vote_count: None,
                    popularity: None,
                    runtime_minutes: None,
                    status: None,
                },
            );
        }
        catalog
    }

    #[tokio::test]
    async fn commits_become_current() {
        let store = MemorySnapshotStore::new();
        assert!(store.load_current().await.unwrap().is_none());

        let first = store.commit(&catalog(&["a"])).await.unwrap();
        let second = store.commit(&catalog(&["a", "b"])).await.unwrap();
        assert!(second.id > first.id);

        let current = store.load_current().await.unwrap().unwrap();
        assert_eq!(current.meta, second);
        assert_eq!(current.catalog.titles.len(), 2);
    }

    #[tokio::test]
    async fn failed_commit_keeps_previous_snapshot() {
        let store = MemorySnapshotStore::new();
        let first = store.commit(&catalog(&["a"])).await.unwrap();
        store.fail_next_commit();

        let err = store.commit(&catalog(&["a", "b"])).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.current_meta().await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn prune_keeps_newest_and_current() {
        let store = MemorySnapshotStore::new();
        for _ in 0..5 {
            store.commit(&catalog(&["x"])).await.unwrap();
        }
        let removed = store.prune(2).await.unwrap();
        assert_eq!(removed, 3);
        let ids: Vec<i64> = store.list(10).await.unwrap().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![5, 4]);

        assert_eq!(store.prune(0).await.unwrap(), 1);
        let ids: Vec<i64> = store.list(10).await.unwrap().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![5]);
    }

    #[tokio::test]
    async fn partial_load_is_rejected() {
        let store = MemorySnapshotStore::new();
        let mut full = catalog(&["a"]);
        full.availability.push(crate::catalog::AvailabilityRecord {
            title_id: TitleId("watchmode:0".into()),
            platform: "Netflix".into(),
            platform_id: Some(203),
            region: "US".into(),
            kind: crate::catalog::AvailabilityKind::Subscription,
            observed_at: Utc::now().trunc_subsecs(0),
        });
        store.commit(&full).await.unwrap();

        store.truncate_next_load();
        let err = store.load_current().await.unwrap_err();
        assert!(matches!(err, PersistenceError::Corrupt(_)));
        assert_eq!(store.load_current().await.unwrap().unwrap().catalog, full);
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released() {
        let store = MemorySnapshotStore::new();
        let lease = store.try_lease().await.unwrap().expect("first lease");
        assert!(store.try_lease().await.unwrap().is_none());
        lease.release().await.unwrap();

        let again = store.try_lease().await.unwrap();
        assert!(again.is_some());
        drop(again);
        assert!(store.try_lease().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn demo_file_accepts_bare_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.json");
        std::fs::write(&path, serde_json::to_vec(&catalog(&["Foo", "Bar"])).unwrap()).unwrap();

        let store = MemorySnapshotStore::from_json_file(&path).await.unwrap();
        let current = store.load_current().await.unwrap().unwrap();
        assert_eq!(current.catalog.titles.len(), 2);
        assert_eq!(current.meta.content_hash, current.catalog.content_hash());
    }

    #[tokio::test]
    async fn demo_file_errors_are_typed() {
        let dir = tempfile::tempdir().unwrap();
        let missing = MemorySnapshotStore::from_json_file(dir.path().join("nope.json")).await;
        assert!(matches!(missing, Err(PersistenceError::Read(_))));

        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"{not json").unwrap();
        let bad = MemorySnapshotStore::from_json_file(&path).await;
        assert!(matches!(bad, Err(PersistenceError::Corrupt(_))));
    }
}
