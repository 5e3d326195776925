use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::catalog::{
    AvailabilityKind, AvailabilitySource, CatalogQuery, MediaKind, Page, PageCursor, RawListing,
    RawPlatform,
};
use crate::database_ops::retry::{send_json, RetryPolicy};
use crate::error::SourceError;
use crate::util::env as env_util;

const PROVIDER: &str = "watchmode";
/// Largest page the list-titles endpoint serves.
pub const PAGE_LIMIT: u32 = 250;

#[derive(Debug, Clone)]
pub struct WatchmodeConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    /// Hard stop for runaway pagination.
    pub max_pages: u32,
    pub retry: RetryPolicy,
}

impl WatchmodeConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            base_url: env_util::env_opt("WATCHMODE_BASE_URL")
                .unwrap_or_else(|| "https://api.watchmode.com/v1".to_string()),
            api_key: env_util::env_req("WATCHMODE_KEY").context("watchmode api key")?,
            timeout: Duration::from_secs(env_util::env_parse("WATCHMODE_TIMEOUT_SECS", 30u64)),
            max_pages: env_util::env_parse("WATCHMODE_MAX_PAGES", 400u32),
            retry: RetryPolicy::from_env("WATCHMODE"),
        })
    }
}

/// Watchmode availability client.
///
/// Endpoints used:
/// - GET /sources/?regions=..&types=..           platforms per region/type
/// - GET /list-titles/?source_ids=..&page=..     paged platform catalog
#[derive(Debug, Clone)]
pub struct WatchmodeProvider {
    base_url: String,
    http: Client,
    api_key: String,
    max_pages: u32,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct SourceWire {
    id: i64,
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    regions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ListTitlesWire {
    #[serde(default)]
    titles: Vec<TitleWire>,
    page: u32,
    total_pages: u32,
}

#[derive(Debug, Deserialize)]
struct TitleWire {
    id: i64,
    title: String,
    year: Option<i32>,
    imdb_id: Option<String>,
    tmdb_id: Option<i64>,
    tmdb_type: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

impl TitleWire {
    fn into_listing(self, platform: &RawPlatform, observed_at: DateTime<Utc>) -> RawListing {
        // tmdb_type decides how the id is resolved on the metadata side.
        let media_kind = self
            .tmdb_type
            .as_deref()
            .and_then(MediaKind::parse)
            .or_else(|| self.kind.as_deref().and_then(MediaKind::parse));
        RawListing {
            watchmode_id: self.id,
            title: self.title,
            year: self.year.filter(|y| *y > 0),
            imdb_id: self.imdb_id.filter(|s| !s.trim().is_empty()),
            tmdb_id: self.tmdb_id.filter(|id| *id > 0),
            media_kind,
            platform_id: platform.id,
            platform: platform.name.clone(),
            region: platform.region.clone(),
            kind: platform.kind,
            observed_at,
        }
    }
}

fn platforms_from_wire(wire: Vec<SourceWire>, query: &CatalogQuery) -> Vec<RawPlatform> {
    let mut out: Vec<RawPlatform> = wire
        .into_iter()
        .filter(|s| AvailabilityKind::parse(&s.kind) == Some(query.kind))
        .filter(|s| s.regions.is_empty() || s.regions.iter().any(|r| r.eq_ignore_ascii_case(&query.region)))
        .map(|s| RawPlatform {
            id: s.id,
            name: s.name.trim().to_string(),
            region: query.region.clone(),
            kind: query.kind,
        })
        .collect();
    out.sort();
    out.dedup_by_key(|p| p.id);
    out
}

fn next_cursor(page: u32, total_pages: u32, max_pages: u32) -> Option<PageCursor> {
    if page < total_pages && page < max_pages {
        Some(PageCursor { page: page + 1 })
    } else {
        None
    }
}

impl WatchmodeProvider {
    pub fn new(config: WatchmodeConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent("streaming-compare/0.1")
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
            api_key: config.api_key,
            max_pages: config.max_pages.max(1),
            retry: config.retry,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(WatchmodeConfig::from_env()?)
    }

    async fn fetch<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, SourceError> {
        let url = format!("{}{}", self.base_url, path);
        self.retry
            .run(path, || {
                let req = self
                    .http
                    .get(&url)
                    .header("Accept", "application/json")
                    .query(&[("apiKey", self.api_key.as_str())])
                    .query(params);
                send_json(PROVIDER, path, req)
            })
            .await
    }
}

#[async_trait]
impl AvailabilitySource for WatchmodeProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    #[instrument(skip(self), fields(region = %query.region, kind = query.kind.as_str()))]
    async fn platforms(&self, query: &CatalogQuery) -> Result<Vec<RawPlatform>, SourceError> {
        let wire: Vec<SourceWire> = self
            .fetch(
                "/sources/",
                &[
                    ("regions", query.region.clone()),
                    ("types", query.kind.source_code().to_string()),
                ],
            )
            .await?;
        let platforms = platforms_from_wire(wire, query);
        debug!(count = platforms.len(), "platforms listed");
        Ok(platforms)
    }

    async fn listing_page(
        &self,
        platform: &RawPlatform,
        cursor: PageCursor,
    ) -> Result<Page<RawListing>, SourceError> {
        let wire: ListTitlesWire = self
            .fetch(
                "/list-titles/",
                &[
                    ("source_ids", platform.id.to_string()),
                    ("regions", platform.region.clone()),
                    ("source_types", platform.kind.source_code().to_string()),
                    ("sort_by", "release_date_desc".to_string()),
                    ("page", cursor.page.to_string()),
                    ("limit", PAGE_LIMIT.to_string()),
                ],
            )
            .await?;
        let observed_at = Utc::now().trunc_subsecs(0);
        let next = next_cursor(wire.page, wire.total_pages, self.max_pages);
        if next.is_none() && wire.page < wire.total_pages {
            warn!(
                platform = %platform.name,
                total_pages = wire.total_pages,
                max_pages = self.max_pages,
                "page cap reached; catalog truncated"
            );
        }
        debug!(
            platform = %platform.name,
            page = wire.page,
            total_pages = wire.total_pages,
            items = wire.titles.len(),
            "listing page"
        );
        Ok(Page {
            items: wire
                .titles
                .into_iter()
                .map(|t| t.into_listing(platform, observed_at))
                .collect(),
            next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn netflix() -> RawPlatform {
        RawPlatform {
            id: 203,
            name: "Netflix".into(),
            region: "US".into(),
            kind: AvailabilityKind::Subscription,
        }
    }

    #[test]
    fn titles_take_platform_context() {
        let wire: ListTitlesWire = serde_json::from_str(
            r#"{
                "titles": [
                    {"id": 1, "title": "Foo", "year": 2020, "imdb_id": "tt1",
                     "tmdb_id": 10, "tmdb_type": "movie", "type": "movie"},
                    {"id": 2, "title": "Bar", "year": 0, "imdb_id": "",
                     "tmdb_id": 0, "tmdb_type": null, "type": "tv_series"}
                ],
                "page": 1, "total_pages": 3, "total_results": 600
            }"#,
        )
        .unwrap();
        let observed = Utc::now().trunc_subsecs(0);
        let listings: Vec<RawListing> = wire
            .titles
            .into_iter()
            .map(|t| t.into_listing(&netflix(), observed))
            .collect();

        assert_eq!(listings[0].media_kind, Some(MediaKind::Movie));
        assert_eq!(listings[0].tmdb_id, Some(10));
        assert_eq!(listings[0].platform, "Netflix");
        assert_eq!(listings[0].region, "US");

        assert_eq!(listings[1].media_kind, Some(MediaKind::Series));
        assert_eq!(listings[1].year, None);
        assert_eq!(listings[1].imdb_id, None);
        assert_eq!(listings[1].tmdb_id, None);
        assert!(listings[1].metadata_id().is_none());
    }

    #[test]
    fn cursor_advances_until_last_page_or_cap() {
        assert_eq!(next_cursor(1, 3, 100), Some(PageCursor { page: 2 }));
        assert_eq!(next_cursor(3, 3, 100), None);
        assert_eq!(next_cursor(2, 9, 2), None);
        assert_eq!(next_cursor(1, 0, 100), None);
    }

    #[test]
    fn platforms_are_filtered_to_query() {
        let wire: Vec<SourceWire> = serde_json::from_str(
            r#"[
                {"id": 203, "name": "Netflix ", "type": "sub", "regions": ["US", "CA"]},
                {"id": 26, "name": "Prime Video", "type": "sub", "regions": ["GB"]},
                {"id": 349, "name": "iTunes", "type": "buy", "regions": ["US"]},
                {"id": 203, "name": "Netflix", "type": "sub", "regions": ["US"]}
            ]"#,
        )
        .unwrap();
        let query = CatalogQuery {
            region: "US".into(),
            kind: AvailabilityKind::Subscription,
        };
        let platforms = platforms_from_wire(wire, &query);
        assert_eq!(platforms, vec![netflix()]);
    }
}
