//! Read side: filters and aggregations over the current snapshot.

pub mod aggregate;
pub mod filters;
pub mod handle;

pub use filters::{FilterError, FilterParams, FilteredView, Filters};
pub use handle::SnapshotHandle;
