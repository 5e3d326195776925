pub mod genre;
pub mod merge;
pub mod policy;
pub mod title;

pub use genre::GenreMapper;
pub use merge::{ConflictDetected, MergeOutput, MergeReport, Merger};
pub use policy::{ConflictPolicy, FieldCategory};
pub use title::NameKey;
