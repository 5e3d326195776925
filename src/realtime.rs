//! Keeps a `SnapshotHandle` in step with the store.
//!
//! The writer issues `NOTIFY snapshot_committed` inside its commit; servers
//! listen on that channel and reload right away. A slow poll backs the
//! listener up so a missed notification only delays the swap.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::database_ops::{SnapshotStore, SNAPSHOT_CHANNEL};
use crate::query::SnapshotHandle;

async fn connect_listener(pool: &PgPool) -> Option<PgListener> {
    let mut listener = match PgListener::connect_with(pool).await {
        Ok(l) => l,
        Err(e) => {
            warn!(error = %e, "snapshot listener unavailable; polling only");
            return None;
        }
    };
    if let Err(e) = listener.listen(SNAPSHOT_CHANNEL).await {
        warn!(error = %e, "LISTEN failed; polling only");
        return None;
    }
    info!(channel = SNAPSHOT_CHANNEL, "listening for snapshot commits");
    Some(listener)
}

async fn next_notification(listener: &mut Option<PgListener>) -> Result<String, sqlx::Error> {
    match listener {
        Some(l) => l.recv().await.map(|n| n.payload().to_string()),
        None => std::future::pending().await,
    }
}

/// Spawns the watcher. `listen_pool` is `None` for stores without
/// notifications (demo mode, tests).
pub fn spawn_snapshot_watcher(
    store: Arc<dyn SnapshotStore>,
    handle: SnapshotHandle,
    listen_pool: Option<PgPool>,
    poll_every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut listener = match listen_pool {
            Some(pool) => connect_listener(&pool).await,
            None => None,
        };
        let mut ticker = tokio::time::interval(poll_every.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                note = next_notification(&mut listener) => match note {
                    Ok(payload) => debug!(snapshot_id = %payload, "snapshot commit notified"),
                    Err(e) => {
                        // PgListener reconnects on the next recv.
                        warn!(error = %e, "snapshot listener error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
            }
            if let Err(e) = handle.refresh_from(store.as_ref()).await {
                warn!(error = %e, version = handle.version(), "snapshot reload failed; keeping current");
            }
        }
        debug!("snapshot watcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::UnifiedCatalog;
    use crate::database_ops::MemorySnapshotStore;

    #[tokio::test]
    async fn polling_picks_up_new_commits() {
        let store = Arc::new(MemorySnapshotStore::new());
        let handle = SnapshotHandle::empty();
        let mut rx = handle.subscribe();
        let cancel = CancellationToken::new();
        let task = spawn_snapshot_watcher(
            store.clone(),
            handle.clone(),
            None,
            Duration::from_millis(20),
            cancel.clone(),
        );

        let meta = store.commit(&UnifiedCatalog::default()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .expect("watcher did not reload")
            .unwrap();
        assert_eq!(handle.version(), meta.id);

        cancel.cancel();
        task.await.unwrap();
    }
}
