use clap::{Args, ValueEnum};
use serde_json::Value;

use crate::catalog::UnifiedCatalog;
use crate::query::aggregate;
use crate::query::{FilterError, FilterParams, Filters};

/// Filter flags shared by `query` and `export`. Multi-valued flags take
/// comma separated lists.
#[derive(Args, Debug, Clone, Default)]
pub struct FilterArgs {
    /// movie, series or both
    #[arg(long)]
    pub media_type: Option<String>,
    #[arg(long)]
    pub platform: Option<String>,
    #[arg(long)]
    pub genre: Option<String>,
    #[arg(long)]
    pub language: Option<String>,
    #[arg(long)]
    pub country: Option<String>,
    #[arg(long)]
    pub region: Option<String>,
    #[arg(long)]
    pub rating_min: Option<f64>,
    #[arg(long)]
    pub rating_max: Option<f64>,
    #[arg(long)]
    pub year_min: Option<i32>,
    #[arg(long)]
    pub year_max: Option<i32>,
}

impl From<FilterArgs> for FilterParams {
    fn from(args: FilterArgs) -> Self {
        FilterParams {
            media_type: args.media_type,
            platform: args.platform,
            genre: args.genre,
            language: args.language,
            country: args.country,
            region: args.region,
            rating_min: args.rating_min,
            rating_max: args.rating_max,
            year_min: args.year_min,
            year_max: args.year_max,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum Aggregate {
    Summary,
    Platforms,
    Genres,
    Overview,
    TitleCounts,
    Ratings,
    TopGenres,
    TopCountries,
    Releases,
    PlatformOrder,
    Options,
    Titles,
}

#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
    pub top: usize,
    pub min_year: i32,
    pub page: usize,
    pub per_page: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            top: 5,
            min_year: 2000,
            page: 1,
            per_page: 50,
        }
    }
}

/// Runs one aggregation over `catalog` and returns it as JSON.
pub fn run_query(
    catalog: &UnifiedCatalog,
    params: FilterParams,
    what: Aggregate,
    opts: QueryOptions,
) -> Result<Value, FilterError> {
    let filters = Filters::try_from(params)?;
    let view = filters.apply(catalog);
    let value = match what {
        Aggregate::Summary => serde_json::to_value(aggregate::summary(&view)),
        Aggregate::Platforms => serde_json::to_value(aggregate::counts_per_platform(&view)),
        Aggregate::Genres => serde_json::to_value(aggregate::counts_per_genre(&view)),
        Aggregate::Overview => serde_json::to_value(aggregate::platform_overview(&view)),
        Aggregate::TitleCounts => serde_json::to_value(aggregate::title_counts(&view)),
        Aggregate::Ratings => serde_json::to_value(aggregate::rating_distribution(&view)),
        Aggregate::TopGenres => serde_json::to_value(aggregate::top_genres(&view, opts.top)),
        Aggregate::TopCountries => serde_json::to_value(aggregate::top_countries(&view, opts.top)),
        Aggregate::Releases => {
            serde_json::to_value(aggregate::releases_by_year(&view, opts.min_year))
        }
        Aggregate::PlatformOrder => serde_json::to_value(aggregate::platform_order(catalog)),
        Aggregate::Options => serde_json::to_value(aggregate::filter_options(catalog)),
        Aggregate::Titles => {
            serde_json::to_value(aggregate::list_titles(&view, opts.page, opts.per_page))
        }
    };
    // The aggregates are plain data; encoding them cannot fail.
    Ok(value.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::filters::tests::sample_catalog;

    #[test]
    fn summary_honours_filters() {
        let catalog = sample_catalog();
        let args = FilterArgs {
            media_type: Some("movie".into()),
            ..FilterArgs::default()
        };
        let value = run_query(&catalog, args.into(), Aggregate::Summary, QueryOptions::default())
            .unwrap();
        assert_eq!(value["titles"], 3);
        assert_eq!(value["series"], 0);
    }

    #[test]
    fn platform_order_ignores_filters() {
        let catalog = sample_catalog();
        let params = FilterParams {
            platform: Some("Hulu".into()),
            ..FilterParams::default()
        };
        let value = run_query(&catalog, params, Aggregate::PlatformOrder, QueryOptions::default())
            .unwrap();
        assert_eq!(value, serde_json::json!(["Netflix", "Hulu"]));
    }

    #[test]
    fn bad_filters_surface_as_errors() {
        let catalog = sample_catalog();
        let params = FilterParams {
            rating_min: Some(9.0),
            rating_max: Some(1.0),
            ..FilterParams::default()
        };
        assert!(run_query(&catalog, params, Aggregate::Genres, QueryOptions::default()).is_err());
    }
}
