//! Aggregations over a filtered view of the current snapshot.
//!
//! All functions are pure; ties are ordered by name so results are stable.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;

use super::filters::FilteredView;
use crate::catalog::{MediaKind, Title, TitleId, UnifiedCatalog};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformCount {
    pub platform: String,
    pub titles: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenreCount {
    pub genre: String,
    pub titles: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub platforms: usize,
    pub movies: usize,
    pub series: usize,
    pub titles: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformOverview {
    pub platform: String,
    pub avg_rating: Option<f64>,
    pub avg_popularity: Option<f64>,
    pub titles: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformTitleCounts {
    pub platform: String,
    pub movies: usize,
    pub series: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RatingDistribution {
    pub platform: String,
    pub rated_titles: usize,
    pub min: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedValue {
    pub value: String,
    pub titles: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformTopGenres {
    pub platform: String,
    pub genres: Vec<RankedValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformTopCountries {
    pub platform: String,
    pub kind: MediaKind,
    pub countries: Vec<RankedValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YearCount {
    pub platform: String,
    pub year: i32,
    pub titles: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterOptions {
    pub platforms: Vec<String>,
    pub genres: Vec<String>,
    pub languages: Vec<String>,
    pub countries: Vec<String>,
    pub regions: Vec<String>,
    pub media_types: Vec<MediaKind>,
    pub year_min: Option<i32>,
    pub year_max: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TitleRow {
    #[serde(flatten)]
    pub title: Title,
    pub platforms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TitlePage {
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub items: Vec<TitleRow>,
}

/// Distinct titles of the view per platform.
fn titles_by_platform<'a>(view: &FilteredView<'a>) -> BTreeMap<&'a str, Vec<&'a Title>> {
    let index: HashMap<&TitleId, &'a Title> = view.titles.iter().map(|t| (&t.id, *t)).collect();
    let mut ids: BTreeMap<&'a str, BTreeSet<&'a TitleId>> = BTreeMap::new();
    for record in &view.availability {
        ids.entry(record.platform.as_str())
            .or_default()
            .insert(&record.title_id);
    }
    ids.into_iter()
        .map(|(platform, set)| {
            let titles = set.into_iter().filter_map(|id| index.get(id).copied()).collect();
            (platform, titles)
        })
        .collect()
}

fn ranked<'a>(counts: BTreeMap<&'a str, usize>, top: Option<usize>) -> Vec<RankedValue> {
    let mut out: Vec<RankedValue> = counts
        .into_iter()
        .map(|(value, titles)| RankedValue {
            value: value.to_string(),
            titles,
        })
        .collect();
    out.sort_by(|a, b| b.titles.cmp(&a.titles).then_with(|| a.value.cmp(&b.value)));
    if let Some(n) = top {
        out.truncate(n);
    }
    out
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// Linear interpolation between closest ranks; `sorted` must be ascending
/// and non-empty.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

pub fn counts_per_platform(view: &FilteredView<'_>) -> Vec<PlatformCount> {
    let mut out: Vec<PlatformCount> = titles_by_platform(view)
        .into_iter()
        .map(|(platform, titles)| PlatformCount {
            platform: platform.to_string(),
            titles: titles.len(),
        })
        .collect();
    out.sort_by(|a, b| b.titles.cmp(&a.titles).then_with(|| a.platform.cmp(&b.platform)));
    out
}

pub fn counts_per_genre(view: &FilteredView<'_>) -> Vec<GenreCount> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for title in &view.titles {
        for genre in &title.genres {
            *counts.entry(genre.as_str()).or_default() += 1;
        }
    }
    ranked(counts, None)
        .into_iter()
        .map(|r| GenreCount {
            genre: r.value,
            titles: r.titles,
        })
        .collect()
}

pub fn summary(view: &FilteredView<'_>) -> Summary {
    let platforms: BTreeSet<&str> = view.availability.iter().map(|a| a.platform.as_str()).collect();
    let movies = view.titles.iter().filter(|t| t.kind == MediaKind::Movie).count();
    Summary {
        platforms: platforms.len(),
        movies,
        series: view.titles.len() - movies,
        titles: view.titles.len(),
    }
}

pub fn platform_overview(view: &FilteredView<'_>) -> Vec<PlatformOverview> {
    titles_by_platform(view)
        .into_iter()
        .map(|(platform, titles)| PlatformOverview {
            platform: platform.to_string(),
            avg_rating: mean(titles.iter().filter_map(|t| t.vote_average)),
            avg_popularity: mean(titles.iter().filter_map(|t| t.popularity)),
            titles: titles.len(),
        })
        .collect()
}

pub fn title_counts(view: &FilteredView<'_>) -> Vec<PlatformTitleCounts> {
    titles_by_platform(view)
        .into_iter()
        .map(|(platform, titles)| {
            let movies = titles.iter().filter(|t| t.kind == MediaKind::Movie).count();
            PlatformTitleCounts {
                platform: platform.to_string(),
                movies,
                series: titles.len() - movies,
            }
        })
        .collect()
}

pub fn rating_distribution(view: &FilteredView<'_>) -> Vec<RatingDistribution> {
    titles_by_platform(view)
        .into_iter()
        .filter_map(|(platform, titles)| {
            // Unvoted titles carry a placeholder 0.0 upstream.
            let mut ratings: Vec<f64> = titles
                .iter()
                .filter(|t| t.vote_count.unwrap_or(0) > 0)
                .filter_map(|t| t.vote_average)
                .collect();
            if ratings.is_empty() {
                return None;
            }
            ratings.sort_by(|a, b| a.total_cmp(b));
            Some(RatingDistribution {
                platform: platform.to_string(),
                rated_titles: ratings.len(),
                min: ratings[0],
                q1: quantile(&ratings, 0.25),
                median: quantile(&ratings, 0.5),
                q3: quantile(&ratings, 0.75),
                max: ratings[ratings.len() - 1],
            })
        })
        .collect()
}

pub fn top_genres(view: &FilteredView<'_>, n: usize) -> Vec<PlatformTopGenres> {
    titles_by_platform(view)
        .into_iter()
        .map(|(platform, titles)| {
            let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
            for genre in titles.iter().flat_map(|t| t.genres.iter()) {
                *counts.entry(genre.as_str()).or_default() += 1;
            }
            PlatformTopGenres {
                platform: platform.to_string(),
                genres: ranked(counts, Some(n)),
            }
        })
        .collect()
}

pub fn top_countries(view: &FilteredView<'_>, n: usize) -> Vec<PlatformTopCountries> {
    let mut out = Vec::new();
    for (platform, titles) in titles_by_platform(view) {
        for kind in [MediaKind::Movie, MediaKind::Series] {
            let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
            for country in titles
                .iter()
                .filter(|t| t.kind == kind)
                .flat_map(|t| t.countries.iter())
            {
                *counts.entry(country.as_str()).or_default() += 1;
            }
            if counts.is_empty() {
                continue;
            }
            out.push(PlatformTopCountries {
                platform: platform.to_string(),
                kind,
                countries: ranked(counts, Some(n)),
            });
        }
    }
    out
}

pub fn releases_by_year(view: &FilteredView<'_>, min_year: i32) -> Vec<YearCount> {
    let mut out = Vec::new();
    for (platform, titles) in titles_by_platform(view) {
        let mut per_year: BTreeMap<i32, usize> = BTreeMap::new();
        for year in titles.iter().filter_map(|t| t.release_year) {
            if year >= min_year {
                *per_year.entry(year).or_default() += 1;
            }
        }
        out.extend(per_year.into_iter().map(|(year, titles)| YearCount {
            platform: platform.to_string(),
            year,
            titles,
        }));
    }
    out
}

/// Every platform in the snapshot ordered by overall distinct title count.
/// Ignores filters so chart colours and ordering stay stable.
pub fn platform_order(catalog: &UnifiedCatalog) -> Vec<String> {
    let view = FilteredView {
        titles: catalog.titles.values().collect(),
        availability: catalog.availability.iter().collect(),
    };
    counts_per_platform(&view)
        .into_iter()
        .map(|c| c.platform)
        .collect()
}

pub fn filter_options(catalog: &UnifiedCatalog) -> FilterOptions {
    let mut genres = BTreeSet::new();
    let mut languages = BTreeSet::new();
    let mut countries = BTreeSet::new();
    let mut kinds = BTreeSet::new();
    for title in catalog.titles.values() {
        genres.extend(title.genres.iter().cloned());
        languages.extend(title.languages.iter().cloned());
        countries.extend(title.countries.iter().cloned());
        kinds.insert(title.kind);
    }
    let platforms: BTreeSet<String> = catalog.availability.iter().map(|a| a.platform.clone()).collect();
    let regions: BTreeSet<String> = catalog.availability.iter().map(|a| a.region.clone()).collect();
    let years = catalog.titles.values().filter_map(|t| t.release_year);
    FilterOptions {
        platforms: platforms.into_iter().collect(),
        genres: genres.into_iter().collect(),
        languages: languages.into_iter().collect(),
        countries: countries.into_iter().collect(),
        regions: regions.into_iter().collect(),
        media_types: kinds.into_iter().collect(),
        year_min: years.clone().min(),
        year_max: years.max(),
    }
}

/// One page of matching titles with the platforms each is on. Pages are
/// 1-based; `per_page` is clamped to 1..=500.
pub fn list_titles(view: &FilteredView<'_>, page: usize, per_page: usize) -> TitlePage {
    let per_page = per_page.clamp(1, 500);
    let page = page.max(1);
    let mut platforms: HashMap<&TitleId, BTreeSet<&str>> = HashMap::new();
    for record in &view.availability {
        platforms
            .entry(&record.title_id)
            .or_default()
            .insert(record.platform.as_str());
    }
    let items = view
        .titles
        .iter()
        .skip((page - 1).saturating_mul(per_page))
        .take(per_page)
        .map(|t| TitleRow {
            title: (*t).clone(),
            platforms: platforms
                .get(&t.id)
                .map(|set| set.iter().map(|p| p.to_string()).collect())
                .unwrap_or_default(),
        })
        .collect();
    TitlePage {
        total: view.titles.len(),
        page,
        per_page,
        items,
    }
}
