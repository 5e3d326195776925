//! Building blocks for the `sc` admin binary.

pub mod db_counts;
pub mod export;
pub mod query;

pub use export::ExportFormat;
pub use query::{Aggregate, FilterArgs, QueryOptions};
