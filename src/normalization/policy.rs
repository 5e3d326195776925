use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::catalog::SourceKind;
use crate::util::env as env_util;

/// Scalar field groups the two sources can disagree on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldCategory {
    Name,
    ReleaseYear,
    MediaKind,
}

impl FieldCategory {
    pub const ALL: [FieldCategory; 3] = [
        FieldCategory::Name,
        FieldCategory::ReleaseYear,
        FieldCategory::MediaKind,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldCategory::Name => "name",
            FieldCategory::ReleaseYear => "release_year",
            FieldCategory::MediaKind => "media_kind",
        }
    }

    fn env_key(&self) -> String {
        format!("MERGE_PREFER_{}", self.as_str().to_ascii_uppercase())
    }
}

/// Which source wins per field category when both carry a value and the
/// values differ. Availability fields (platform, region, type, observation
/// time) only exist on the availability side and are not configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictPolicy {
    pub name: SourceKind,
    pub release_year: SourceKind,
    pub media_kind: SourceKind,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self {
            name: SourceKind::Metadata,
            release_year: SourceKind::Metadata,
            media_kind: SourceKind::Metadata,
        }
    }
}

impl ConflictPolicy {
    /// Reads `MERGE_PREFER_NAME`, `MERGE_PREFER_RELEASE_YEAR` and
    /// `MERGE_PREFER_MEDIA_KIND` (`metadata` | `availability`).
    pub fn from_env() -> Self {
        let mut policy = Self::default();
        for field in FieldCategory::ALL {
            let key = field.env_key();
            if let Some(raw) = env_util::env_opt(&key) {
                match SourceKind::parse(&raw) {
                    Some(source) => policy = policy.prefer(field, source),
                    None => warn!(key = %key, value = %raw, "unknown merge source; keeping default"),
                }
            }
        }
        policy
    }

    pub fn prefer(mut self, field: FieldCategory, source: SourceKind) -> Self {
        match field {
            FieldCategory::Name => self.name = source,
            FieldCategory::ReleaseYear => self.release_year = source,
            FieldCategory::MediaKind => self.media_kind = source,
        }
        self
    }

    pub fn authority(&self, field: FieldCategory) -> SourceKind {
        match field {
            FieldCategory::Name => self.name,
            FieldCategory::ReleaseYear => self.release_year,
            FieldCategory::MediaKind => self.media_kind,
        }
    }

    /// Pick between the metadata-side and availability-side values. Returns
    /// the chosen value and whether the sources disagreed.
    pub fn resolve<T: PartialEq>(
        &self,
        field: FieldCategory,
        metadata: Option<T>,
        availability: Option<T>,
    ) -> (Option<T>, bool) {
        match (metadata, availability) {
            (Some(m), Some(a)) => {
                let conflict = m != a;
                match self.authority(field) {
                    SourceKind::Metadata => (Some(m), conflict),
                    SourceKind::Availability => (Some(a), conflict),
                }
            }
            (Some(m), None) => (Some(m), false),
            (None, a) => (a, false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_wins_by_default() {
        let policy = ConflictPolicy::default();
        assert_eq!(
            policy.resolve(FieldCategory::ReleaseYear, Some(2020), Some(2019)),
            (Some(2020), true)
        );
    }

    #[test]
    fn override_switches_authority() {
        let policy =
            ConflictPolicy::default().prefer(FieldCategory::Name, SourceKind::Availability);
        assert_eq!(
            policy.resolve(FieldCategory::Name, Some("Foo"), Some("Foo!")),
            (Some("Foo!"), true)
        );
        assert_eq!(policy.authority(FieldCategory::ReleaseYear), SourceKind::Metadata);
    }

    #[test]
    fn missing_preferred_value_falls_back_without_conflict() {
        let policy = ConflictPolicy::default();
        assert_eq!(
            policy.resolve(FieldCategory::ReleaseYear, None, Some(1999)),
            (Some(1999), false)
        );
        assert_eq!(
            policy.resolve::<i32>(FieldCategory::ReleaseYear, None, None),
            (None, false)
        );
    }

    #[test]
    fn agreement_is_not_a_conflict() {
        let policy = ConflictPolicy::default();
        assert_eq!(
            policy.resolve(FieldCategory::MediaKind, Some(1), Some(1)),
            (Some(1), false)
        );
    }
}
