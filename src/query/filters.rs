use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{AvailabilityRecord, MediaKind, Title, TitleId, UnifiedCatalog};
use crate::util::env::split_list;

#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("unknown media type {0:?} (expected movie or series)")]
    UnknownMediaType(String),

    #[error("{field}: minimum {min} is greater than maximum {max}")]
    InvertedRange {
        field: &'static str,
        min: String,
        max: String,
    },
}

/// Filter criteria as they arrive on the wire. Multi-valued fields are
/// comma separated; every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterParams {
    pub media_type: Option<String>,
    pub platform: Option<String>,
    pub genre: Option<String>,
    pub language: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub rating_min: Option<f64>,
    pub rating_max: Option<f64>,
    pub year_min: Option<i32>,
    pub year_max: Option<i32>,
}

/// Parsed filter criteria. Empty sets and open bounds mean no constraint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filters {
    pub media_kinds: BTreeSet<MediaKind>,
    pub platforms: BTreeSet<String>,
    pub genres: BTreeSet<String>,
    pub languages: BTreeSet<String>,
    pub countries: BTreeSet<String>,
    pub regions: BTreeSet<String>,
    pub rating_min: Option<f64>,
    pub rating_max: Option<f64>,
    pub year_min: Option<i32>,
    pub year_max: Option<i32>,
}

fn set(raw: Option<&str>) -> BTreeSet<String> {
    raw.map(split_list).unwrap_or_default().into_iter().collect()
}

impl TryFrom<FilterParams> for Filters {
    type Error = FilterError;

    fn try_from(params: FilterParams) -> Result<Self, Self::Error> {
        let mut media_kinds = BTreeSet::new();
        for raw in set(params.media_type.as_deref()) {
            let kind = MediaKind::parse(&raw).ok_or(FilterError::UnknownMediaType(raw))?;
            media_kinds.insert(kind);
        }
        if let (Some(min), Some(max)) = (params.rating_min, params.rating_max) {
            if min > max {
                return Err(FilterError::InvertedRange {
                    field: "rating",
                    min: min.to_string(),
                    max: max.to_string(),
                });
            }
        }
        if let (Some(min), Some(max)) = (params.year_min, params.year_max) {
            if min > max {
                return Err(FilterError::InvertedRange {
                    field: "year",
                    min: min.to_string(),
                    max: max.to_string(),
                });
            }
        }
        Ok(Filters {
            media_kinds,
            platforms: set(params.platform.as_deref()),
            genres: set(params.genre.as_deref()),
            languages: set(params.language.as_deref()),
            countries: set(params.country.as_deref()),
            regions: set(params.region.as_deref())
                .into_iter()
                .map(|r| r.to_ascii_uppercase())
                .collect(),
            rating_min: params.rating_min,
            rating_max: params.rating_max,
            year_min: params.year_min,
            year_max: params.year_max,
        })
    }
}

fn any_of(selected: &BTreeSet<String>, values: &BTreeSet<String>) -> bool {
    selected.is_empty() || values.iter().any(|v| selected.contains(v))
}

fn within<T: PartialOrd + Copy>(value: Option<T>, min: Option<T>, max: Option<T>) -> bool {
    if min.is_none() && max.is_none() {
        return true;
    }
    match value {
        Some(v) => min.map_or(true, |m| v >= m) && max.map_or(true, |m| v <= m),
        None => false,
    }
}

/// Titles and availability rows left after filtering.
#[derive(Debug, Clone, Default)]
pub struct FilteredView<'a> {
    pub titles: Vec<&'a Title>,
    pub availability: Vec<&'a AvailabilityRecord>,
}

impl Filters {
    pub fn is_empty(&self) -> bool {
        *self == Filters::default()
    }

    fn constrains_availability(&self) -> bool {
        !self.platforms.is_empty() || !self.regions.is_empty()
    }

    pub fn matches_title(&self, title: &Title) -> bool {
        (self.media_kinds.is_empty() || self.media_kinds.contains(&title.kind))
            && any_of(&self.genres, &title.genres)
            && any_of(&self.languages, &title.languages)
            && any_of(&self.countries, &title.countries)
            && within(title.vote_average, self.rating_min, self.rating_max)
            && within(title.release_year, self.year_min, self.year_max)
    }

    pub fn matches_availability(&self, record: &AvailabilityRecord) -> bool {
        (self.platforms.is_empty() || self.platforms.contains(&record.platform))
            && (self.regions.is_empty() || self.regions.contains(&record.region))
    }

    /// A title is kept when it passes the title criteria and, if a platform
    /// or region is selected, is available on at least one of them.
    pub fn apply<'a>(&self, catalog: &'a UnifiedCatalog) -> FilteredView<'a> {
        let availability: Vec<&AvailabilityRecord> = catalog
            .availability
            .iter()
            .filter(|a| self.matches_availability(a))
            .filter(|a| catalog.title(&a.title_id).is_some_and(|t| self.matches_title(t)))
            .collect();

        let titles: Vec<&Title> = if self.constrains_availability() {
            let available: HashSet<&TitleId> = availability.iter().map(|a| &a.title_id).collect();
            catalog
                .titles
                .values()
                .filter(|t| available.contains(&t.id))
                .collect()
        } else {
            catalog
                .titles
                .values()
                .filter(|t| self.matches_title(t))
                .collect()
        };

        FilteredView {
            titles,
            availability,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::AvailabilityKind;
    use chrono::{TimeZone, Utc};

    pub(crate) fn title(
        id: &str,
        kind: MediaKind,
        year: i32,
        rating: Option<f64>,
        genres: &[&str],
        countries: &[&str],
    ) -> Title {
        Title {
            id: TitleId(id.into()),
            name: id.to_uppercase(),
            kind,
            release_year: Some(year),
            genres: genres.iter().map(|s| s.to_string()).collect(),
            languages: ["English".to_string()].into_iter().collect(),
            countries: countries.iter().map(|s| s.to_string()).collect(),
            tmdb_id: None,
            imdb_id: None,
            watchmode_id: None,
            vote_average: rating,
            vote_count: rating.map(|_| 100),
            popularity: rating.map(|r| r * 10.0),
            runtime_minutes: None,
            status: None,
        }
    }

    pub(crate) fn avail(id: &str, platform: &str, region: &str) -> AvailabilityRecord {
        AvailabilityRecord {
            title_id: TitleId(id.into()),
            platform: platform.into(),
            platform_id: None,
            region: region.into(),
            kind: AvailabilityKind::Subscription,
            observed_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    /// Four titles across two platforms:
    /// a: movie 2015 7.0 Drama/US       on Netflix US, Hulu US
    /// b: series 2019 8.0 Comedy/GB     on Netflix US
    /// c: movie 2021 5.0 Drama+Comedy/US on Hulu US, Netflix GB
    /// d: movie 2010 unrated Horror/FR  nowhere
    pub(crate) fn sample_catalog() -> UnifiedCatalog {
        let mut catalog = UnifiedCatalog::default();
        for t in [
            title("a", MediaKind::Movie, 2015, Some(7.0), &["Drama"], &["United States of America"]),
            title("b", MediaKind::Series, 2019, Some(8.0), &["Comedy"], &["United Kingdom"]),
            title("c", MediaKind::Movie, 2021, Some(5.0), &["Drama", "Comedy"], &["United States of America"]),
            title("d", MediaKind::Movie, 2010, None, &["Horror"], &["France"]),
        ] {
            catalog.titles.insert(t.id.clone(), t);
        }
        catalog.availability = vec![
            avail("a", "Netflix", "US"),
            avail("a", "Hulu", "US"),
            avail("b", "Netflix", "US"),
            avail("c", "Hulu", "US"),
            avail("c", "Netflix", "GB"),
        ];
        catalog.sort_availability();
        catalog
    }

    fn ids<'a>(view: &FilteredView<'a>) -> Vec<&'a str> {
        view.titles.iter().map(|t| t.id.as_str()).collect()
    }

    #[test]
    fn empty_filters_keep_everything() {
        let catalog = sample_catalog();
        let filters = Filters::try_from(FilterParams::default()).unwrap();
        assert!(filters.is_empty());
        let view = filters.apply(&catalog);
        assert_eq!(view.titles.len(), 4);
        assert_eq!(view.availability.len(), 5);
    }

    #[test]
    fn platform_filter_restricts_titles_and_rows() {
        let catalog = sample_catalog();
        let filters = Filters::try_from(FilterParams {
            platform: Some("Hulu".into()),
            ..FilterParams::default()
        })
        .unwrap();
        let view = filters.apply(&catalog);
        assert_eq!(ids(&view), vec!["a", "c"]);
        assert!(view.availability.iter().all(|a| a.platform == "Hulu"));
    }

    #[test]
    fn genre_filter_matches_any_selected() {
        let catalog = sample_catalog();
        let filters = Filters::try_from(FilterParams {
            genre: Some("Comedy, Horror".into()),
            ..FilterParams::default()
        })
        .unwrap();
        assert_eq!(ids(&filters.apply(&catalog)), vec!["b", "c", "d"]);
    }

    #[test]
    fn ranges_and_media_type_combine() {
        let catalog = sample_catalog();
        let filters = Filters::try_from(FilterParams {
            media_type: Some("movie".into()),
            rating_min: Some(6.0),
            year_min: Some(2012),
            ..FilterParams::default()
        })
        .unwrap();
        assert_eq!(ids(&filters.apply(&catalog)), vec!["a"]);
    }

    #[test]
    fn both_media_types_is_no_constraint() {
        let catalog = sample_catalog();
        let filters = Filters::try_from(FilterParams {
            media_type: Some("movie,series".into()),
            ..FilterParams::default()
        })
        .unwrap();
        assert_eq!(filters.apply(&catalog).titles.len(), 4);
    }

    #[test]
    fn region_filter_is_case_insensitive() {
        let catalog = sample_catalog();
        let filters = Filters::try_from(FilterParams {
            region: Some("gb".into()),
            ..FilterParams::default()
        })
        .unwrap();
        let view = filters.apply(&catalog);
        assert_eq!(ids(&view), vec!["c"]);
        assert_eq!(view.availability.len(), 1);
    }

    #[test]
    fn bad_params_are_rejected() {
        let err = Filters::try_from(FilterParams {
            media_type: Some("podcast".into()),
            ..FilterParams::default()
        })
        .unwrap_err();
        assert_eq!(err, FilterError::UnknownMediaType("podcast".into()));

        let err = Filters::try_from(FilterParams {
            year_min: Some(2020),
            year_max: Some(2010),
            ..FilterParams::default()
        })
        .unwrap_err();
        assert!(matches!(err, FilterError::InvertedRange { field: "year", .. }));
    }
}
