pub mod memory_store;
pub mod retry;
pub mod snapshot;
pub mod tmdb;
pub mod watchmode;

pub use memory_store::MemorySnapshotStore;
pub use retry::RetryPolicy;
pub use snapshot::{PgSnapshotStore, RefreshRunRecord, RunLease, SnapshotStore, SNAPSHOT_CHANNEL};
