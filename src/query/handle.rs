use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::catalog::Snapshot;
use crate::database_ops::SnapshotStore;
use crate::error::PersistenceError;

/// Shared, atomically swapped reference to the snapshot readers query.
///
/// Readers take a cheap `Arc` clone and keep using it for the whole request;
/// a concurrent install never changes what an in-flight request sees.
/// Installs only move forward: an older or equal version is ignored.
#[derive(Clone)]
pub struct SnapshotHandle {
    tx: Arc<watch::Sender<Arc<Snapshot>>>,
}

impl SnapshotHandle {
    pub fn new(initial: Snapshot) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx: Arc::new(tx) }
    }

    pub fn empty() -> Self {
        Self::new(Snapshot::empty())
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.tx.borrow().clone()
    }

    pub fn version(&self) -> i64 {
        self.tx.borrow().version()
    }

    /// Swaps in `snapshot` if it is newer than the current one.
    pub fn install(&self, snapshot: Snapshot) -> bool {
        let next = Arc::new(snapshot);
        self.tx.send_if_modified(|current| {
            if next.version() > current.version() {
                *current = next.clone();
                true
            } else {
                false
            }
        })
    }

    /// Notified after every successful install.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.tx.subscribe()
    }

    /// Loads the store's current snapshot when it is newer than ours.
    pub async fn refresh_from(&self, store: &dyn SnapshotStore) -> Result<bool, PersistenceError> {
        let Some(meta) = store.current_meta().await? else {
            return Ok(false);
        };
        if meta.id <= self.version() {
            return Ok(false);
        }
        let Some(snapshot) = store.load_current().await? else {
            return Ok(false);
        };
        let id = snapshot.version();
        let installed = self.install(snapshot);
        if installed {
            info!(snapshot_id = id, "serving new snapshot");
        }
        Ok(installed)
    }
}
