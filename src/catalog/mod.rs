pub mod model;
pub mod raw;
pub mod source;

pub use model::{
    AvailabilityKind, AvailabilityRecord, MediaKind, Snapshot, SnapshotMeta, Title, TitleId,
    UnifiedCatalog,
};
pub use raw::{
    MetadataId, RawCatalog, RawDetails, RawListing, RawPlatform, ReferenceData, SourceKind,
};
pub use source::{AvailabilitySource, CatalogQuery, MetadataSource, Page, PageCursor};
