//! Raw records as they come out of the two source clients, before merging.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::model::{AvailabilityKind, MediaKind};

/// Which upstream a value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Metadata,
    Availability,
}

impl SourceKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "metadata" | "tmdb" => Some(SourceKind::Metadata),
            "availability" | "watchmode" => Some(SourceKind::Availability),
            _ => None,
        }
    }
}

/// Identifier understood by the metadata source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MetadataId {
    pub kind: MediaKind,
    pub tmdb_id: i64,
}

/// A platform (streaming service) as listed by the availability source for
/// one region and availability type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RawPlatform {
    pub id: i64,
    pub name: String,
    pub region: String,
    pub kind: AvailabilityKind,
}

/// One title on one platform, from the availability source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub watchmode_id: i64,
    pub title: String,
    pub year: Option<i32>,
    pub imdb_id: Option<String>,
    pub tmdb_id: Option<i64>,
    pub media_kind: Option<MediaKind>,
    pub platform_id: i64,
    pub platform: String,
    pub region: String,
    pub kind: AvailabilityKind,
    pub observed_at: DateTime<Utc>,
}

impl RawListing {
    pub fn metadata_id(&self) -> Option<MetadataId> {
        match (self.media_kind, self.tmdb_id) {
            (Some(kind), Some(tmdb_id)) if tmdb_id > 0 => Some(MetadataId { kind, tmdb_id }),
            _ => None,
        }
    }
}

/// Full details for one title, from the metadata source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetails {
    pub tmdb_id: i64,
    pub kind: MediaKind,
    pub imdb_id: Option<String>,
    pub title: String,
    pub release_date: Option<NaiveDate>,
    pub original_language: Option<String>,
    pub origin_countries: Vec<String>,
    pub genres: Vec<String>,
    pub vote_average: Option<f64>,
    pub vote_count: Option<i64>,
    pub popularity: Option<f64>,
    pub runtime_minutes: Option<f64>,
    pub status: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl RawDetails {
    pub fn metadata_id(&self) -> MetadataId {
        MetadataId {
            kind: self.kind,
            tmdb_id: self.tmdb_id,
        }
    }
}

/// Lookup tables for labelling codes with English names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceData {
    /// ISO 3166-1 code -> English name.
    pub countries: BTreeMap<String, String>,
    /// ISO 639-1 code -> English name.
    pub languages: BTreeMap<String, String>,
}

impl ReferenceData {
    pub fn country_name(&self, code: &str) -> String {
        let code = code.trim().to_ascii_uppercase();
        self.countries.get(&code).cloned().unwrap_or(code)
    }

    pub fn language_name(&self, code: &str) -> String {
        let code = code.trim().to_ascii_lowercase();
        self.languages.get(&code).cloned().unwrap_or(code)
    }
}

/// Everything one refresh run fetched, handed to the merger in one piece.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCatalog {
    pub listings: Vec<RawListing>,
    pub details: Vec<RawDetails>,
    pub reference: ReferenceData,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_lookup_falls_back_to_code() {
        let mut reference = ReferenceData::default();
        reference
            .countries
            .insert("US".into(), "United States of America".into());
        reference.languages.insert("en".into(), "English".into());

        assert_eq!(reference.country_name("us"), "United States of America");
        assert_eq!(reference.country_name("XK"), "XK");
        assert_eq!(reference.language_name("EN"), "English");
        assert_eq!(reference.language_name("tlh"), "tlh");
    }

    #[test]
    fn listing_without_tmdb_kind_has_no_metadata_id() {
        let listing = RawListing {
            watchmode_id: 1,
            title: "Foo".into(),
            year: Some(2020),
            imdb_id: None,
            tmdb_id: Some(10),
            media_kind: None,
            platform_id: 203,
            platform: "Netflix".into(),
            region: "US".into(),
            kind: AvailabilityKind::Subscription,
            observed_at: Utc::now(),
        };
        assert_eq!(listing.metadata_id(), None);
    }
}
