use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Canonical identifier of a title inside a snapshot, e.g. `tmdb:movie:603`
/// or `name:the matrix:1999`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TitleId(pub String);

impl TitleId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TitleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Movie,
    Series,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Movie => "movie",
            MediaKind::Series => "series",
        }
    }

    /// Path segment the metadata API uses for this kind.
    pub fn tmdb_segment(&self) -> &'static str {
        match self {
            MediaKind::Movie => "movie",
            MediaKind::Series => "tv",
        }
    }

    /// Lenient parser accepting both our labels and the upstream vocabularies
    /// (`tv`, `tv_series`, `tv_miniseries`, `tv_movie`, ...).
    pub fn parse(raw: &str) -> Option<Self> {
        let v = raw.trim().to_ascii_lowercase();
        match v.as_str() {
            "movie" | "short_film" | "tv_movie" | "film" => Some(MediaKind::Movie),
            "series" | "tv" | "tv_series" | "tv_miniseries" | "tv_special" | "show" => {
                Some(MediaKind::Series)
            }
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityKind {
    Subscription,
    Free,
    TvEverywhere,
    Rental,
    Purchase,
}

impl AvailabilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AvailabilityKind::Subscription => "subscription",
            AvailabilityKind::Free => "free",
            AvailabilityKind::TvEverywhere => "tv_everywhere",
            AvailabilityKind::Rental => "rental",
            AvailabilityKind::Purchase => "purchase",
        }
    }

    /// Source-type code used by the availability API.
    pub fn source_code(&self) -> &'static str {
        match self {
            AvailabilityKind::Subscription => "sub",
            AvailabilityKind::Free => "free",
            AvailabilityKind::TvEverywhere => "tve",
            AvailabilityKind::Rental => "rent",
            AvailabilityKind::Purchase => "buy",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sub" | "subscription" => Some(AvailabilityKind::Subscription),
            "free" => Some(AvailabilityKind::Free),
            "tve" | "tv_everywhere" => Some(AvailabilityKind::TvEverywhere),
            "rent" | "rental" => Some(AvailabilityKind::Rental),
            "buy" | "purchase" => Some(AvailabilityKind::Purchase),
            _ => None,
        }
    }

    /// Higher rank wins when two records for the same slot were observed at
    /// the same instant.
    pub fn rank(&self) -> u8 {
        match self {
            AvailabilityKind::Subscription => 5,
            AvailabilityKind::Free => 4,
            AvailabilityKind::TvEverywhere => 3,
            AvailabilityKind::Rental => 2,
            AvailabilityKind::Purchase => 1,
        }
    }
}

/// A canonical content work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Title {
    pub id: TitleId,
    pub name: String,
    pub kind: MediaKind,
    pub release_year: Option<i32>,
    pub genres: BTreeSet<String>,
    pub languages: BTreeSet<String>,
    pub countries: BTreeSet<String>,
    pub tmdb_id: Option<i64>,
    pub imdb_id: Option<String>,
    pub watchmode_id: Option<i64>,
    pub vote_average: Option<f64>,
    pub vote_count: Option<i64>,
    pub popularity: Option<f64>,
    pub runtime_minutes: Option<f64>,
    pub status: Option<String>,
}

/// Presence of a title on a platform in a region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRecord {
    pub title_id: TitleId,
    pub platform: String,
    pub platform_id: Option<i64>,
    pub region: String,
    pub kind: AvailabilityKind,
    pub observed_at: DateTime<Utc>,
}

/// The merged dataset. Titles are keyed and availability is kept sorted by
/// (title, platform, region) so the serialized form is canonical.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnifiedCatalog {
    pub titles: BTreeMap<TitleId, Title>,
    pub availability: Vec<AvailabilityRecord>,
}

impl UnifiedCatalog {
    pub fn title(&self, id: &TitleId) -> Option<&Title> {
        self.titles.get(id)
    }

    pub fn sort_availability(&mut self) {
        self.availability.sort_by(|a, b| {
            a.title_id
                .cmp(&b.title_id)
                .then_with(|| a.platform.cmp(&b.platform))
                .then_with(|| a.region.cmp(&b.region))
        });
    }

    /// Canonical JSON encoding; identical catalogs encode to identical bytes.
    ///
    /// Encoding cannot fail: map keys are `TitleId` strings, every other
    /// field is a string, integer, date or enum, and serde_json writes
    /// non-finite floats as `null`.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Hex SHA-256 of the canonical encoding.
    pub fn content_hash(&self) -> String {
        let digest = Sha256::digest(self.canonical_bytes());
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub id: i64,
    pub committed_at: DateTime<Utc>,
    pub content_hash: String,
    pub title_count: i64,
    pub availability_count: i64,
}

/// One immutable, fully committed version of the dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub catalog: UnifiedCatalog,
}

impl Snapshot {
    /// Placeholder served before the first snapshot has been committed.
    pub fn empty() -> Self {
        Self {
            meta: SnapshotMeta {
                id: 0,
                committed_at: DateTime::<Utc>::default(),
                content_hash: UnifiedCatalog::default().content_hash(),
                title_count: 0,
                availability_count: 0,
            },
            catalog: UnifiedCatalog::default(),
        }
    }

    pub fn version(&self) -> i64 {
        self.meta.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_upstream_media_vocabularies() {
        assert_eq!(MediaKind::parse("tv"), Some(MediaKind::Series));
        assert_eq!(MediaKind::parse("tv_miniseries"), Some(MediaKind::Series));
        assert_eq!(MediaKind::parse("Movie"), Some(MediaKind::Movie));
        assert_eq!(MediaKind::parse("podcast"), None);
    }

    #[test]
    fn availability_codes_round_through_parse() {
        for kind in [
            AvailabilityKind::Subscription,
            AvailabilityKind::Free,
            AvailabilityKind::TvEverywhere,
            AvailabilityKind::Rental,
            AvailabilityKind::Purchase,
        ] {
            assert_eq!(AvailabilityKind::parse(kind.source_code()), Some(kind));
        }
    }

    #[test]
    fn empty_catalog_hash_is_stable() {
        assert_eq!(
            UnifiedCatalog::default().content_hash(),
            Snapshot::empty().meta.content_hash
        );
        assert_eq!(UnifiedCatalog::default().content_hash().len(), 64);
    }

    #[test]
    fn non_finite_ratings_still_encode() {
        let id = TitleId("tmdb:movie:1".into());
        let mut catalog = UnifiedCatalog::default();
        catalog.titles.insert(
            id.clone(),
            Title {
                id,
                name: "Amélie".into(),
                kind: MediaKind::Movie,
                release_year: Some(2001),
                genres: BTreeSet::from(["Comedy".to_string()]),
                languages: BTreeSet::new(),
                countries: BTreeSet::new(),
                tmdb_id: Some(1),
                imdb_id: None,
                watchmode_id: None,
                vote_average: Some(f64::NAN),
                vote_count: None,
                popularity: Some(f64::INFINITY),
                runtime_minutes: None,
                status: None,
            },
        );
        let bytes = catalog.canonical_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"vote_average\":null"));
        assert_ne!(catalog.content_hash(), UnifiedCatalog::default().content_hash());
    }
}
