use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::catalog::{MediaKind, MetadataId, MetadataSource, RawDetails, ReferenceData};
use crate::database_ops::retry::{send_json, RetryPolicy};
use crate::error::SourceError;
use crate::util::env as env_util;

const PROVIDER: &str = "tmdb";

#[derive(Debug, Clone)]
pub struct TmdbConfig {
    pub base_url: String,
    /// v3 key sent as `api_key`.
    pub api_key: Option<String>,
    /// v4 read token sent as a bearer header.
    pub token: Option<String>,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl TmdbConfig {
    pub fn from_env() -> Result<Self> {
        let api_key = env_util::env_opt("TMDB_KEY");
        let token = env_util::env_opt("TMDB_TOKEN");
        if api_key.is_none() && token.is_none() {
            return Err(anyhow!("set TMDB_KEY or TMDB_TOKEN"));
        }
        Ok(Self {
            base_url: env_util::env_opt("TMDB_BASE_URL")
                .unwrap_or_else(|| "https://api.themoviedb.org/3".to_string()),
            api_key,
            token,
            timeout: Duration::from_secs(env_util::env_parse("TMDB_TIMEOUT_SECS", 20u64)),
            retry: RetryPolicy::from_env("TMDB"),
        })
    }
}

/// TMDB metadata client.
///
/// Endpoints used:
/// - GET /configuration/countries
/// - GET /configuration/languages
/// - GET /movie/{id}?append_to_response=external_ids
/// - GET /tv/{id}?append_to_response=external_ids
#[derive(Debug, Clone)]
pub struct TmdbProvider {
    base_url: String,
    http: Client,
    api_key: Option<String>,
    token: Option<String>,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct CountryWire {
    iso_3166_1: String,
    english_name: String,
}

#[derive(Debug, Deserialize)]
struct LanguageWire {
    iso_639_1: String,
    english_name: String,
}

#[derive(Debug, Deserialize)]
struct GenreWire {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ExternalIdsWire {
    imdb_id: Option<String>,
}

/// Movie and TV payloads share one shape; the kind-specific fields are
/// optional and folded together in `into_raw`.
#[derive(Debug, Deserialize)]
struct DetailsWire {
    id: i64,
    title: Option<String>,
    name: Option<String>,
    release_date: Option<String>,
    first_air_date: Option<String>,
    original_language: Option<String>,
    #[serde(default)]
    origin_country: Vec<String>,
    #[serde(default)]
    genres: Vec<GenreWire>,
    vote_average: Option<f64>,
    vote_count: Option<i64>,
    popularity: Option<f64>,
    runtime: Option<f64>,
    #[serde(default)]
    episode_run_time: Vec<f64>,
    number_of_episodes: Option<i64>,
    status: Option<String>,
    imdb_id: Option<String>,
    #[serde(default)]
    external_ids: ExternalIdsWire,
}

fn parse_date(raw: Option<&str>) -> Option<NaiveDate> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
}

impl DetailsWire {
    fn into_raw(self, kind: MediaKind, observed_at: DateTime<Utc>) -> RawDetails {
        let title = self.title.or(self.name).unwrap_or_default();
        let release_date = parse_date(self.release_date.as_deref())
            .or_else(|| parse_date(self.first_air_date.as_deref()));
        // Series have no single runtime; estimate mean episode length x episodes.
        let runtime_minutes = self.runtime.filter(|r| *r > 0.0).or_else(|| {
            let episodes = self.number_of_episodes?;
            if self.episode_run_time.is_empty() {
                return None;
            }
            let mean =
                self.episode_run_time.iter().sum::<f64>() / self.episode_run_time.len() as f64;
            Some(mean * episodes as f64)
        });
        RawDetails {
            tmdb_id: self.id,
            kind,
            imdb_id: self
                .imdb_id
                .filter(|s| !s.trim().is_empty())
                .or(self.external_ids.imdb_id.filter(|s| !s.trim().is_empty())),
            title,
            release_date,
            original_language: self.original_language,
            origin_countries: self.origin_country,
            genres: self.genres.into_iter().filter_map(|g| g.name).collect(),
            vote_average: self.vote_average,
            vote_count: self.vote_count,
            popularity: self.popularity,
            runtime_minutes,
            status: self.status,
            observed_at,
        }
    }
}

impl TmdbProvider {
    pub fn new(config: TmdbConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent("streaming-compare/0.1")
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
            api_key: config.api_key,
            token: config.token,
            retry: config.retry,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(TmdbConfig::from_env()?)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .header("Accept", "application/json");
        if let Some(token) = self.token.as_deref() {
            req = req.bearer_auth(token);
        }
        if let Some(key) = self.api_key.as_deref() {
            req = req.query(&[("api_key", key)]);
        }
        req
    }

    async fn fetch<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        extra: &[(&str, &str)],
    ) -> Result<T, SourceError> {
        self.retry
            .run(path, || send_json(PROVIDER, path, self.get(path).query(extra)))
            .await
    }
}

#[async_trait]
impl MetadataSource for TmdbProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    #[instrument(skip(self))]
    async fn reference_data(&self) -> Result<ReferenceData, SourceError> {
        let (countries, languages) = tokio::try_join!(
            self.fetch::<Vec<CountryWire>>("/configuration/countries", &[]),
            self.fetch::<Vec<LanguageWire>>("/configuration/languages", &[]),
        )?;
        let reference = ReferenceData {
            countries: countries
                .into_iter()
                .map(|c| (c.iso_3166_1.to_ascii_uppercase(), c.english_name))
                .collect::<BTreeMap<_, _>>(),
            languages: languages
                .into_iter()
                .map(|l| (l.iso_639_1.to_ascii_lowercase(), l.english_name))
                .collect::<BTreeMap<_, _>>(),
        };
        debug!(
            countries = reference.countries.len(),
            languages = reference.languages.len(),
            "reference data loaded"
        );
        Ok(reference)
    }

    async fn details(&self, id: MetadataId) -> Result<RawDetails, SourceError> {
        let path = format!("/{}/{}", id.kind.tmdb_segment(), id.tmdb_id);
        let wire: DetailsWire = self
            .fetch(&path, &[("append_to_response", "external_ids")])
            .await?;
        Ok(wire.into_raw(id.kind, Utc::now().trunc_subsecs(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn observed() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn movie_payload_maps_directly() {
        let wire: DetailsWire = serde_json::from_str(
            r#"{
                "id": 603, "title": "The Matrix", "release_date": "1999-03-30",
                "original_language": "en", "origin_country": ["US"],
                "genres": [{"id": 28, "name": "Action"}, {"id": 878, "name": "Science Fiction"}],
                "vote_average": 8.2, "vote_count": 25000, "popularity": 80.5,
                "runtime": 136, "status": "Released", "imdb_id": "tt0133093"
            }"#,
        )
        .unwrap();
        let raw = wire.into_raw(MediaKind::Movie, observed());
        assert_eq!(raw.title, "The Matrix");
        assert_eq!(raw.release_date, NaiveDate::from_ymd_opt(1999, 3, 30));
        assert_eq!(raw.runtime_minutes, Some(136.0));
        assert_eq!(raw.imdb_id.as_deref(), Some("tt0133093"));
        assert_eq!(raw.genres, vec!["Action", "Science Fiction"]);
        assert_eq!(raw.origin_countries, vec!["US"]);
    }

    #[test]
    fn series_payload_folds_tv_fields() {
        let wire: DetailsWire = serde_json::from_str(
            r#"{
                "id": 1399, "name": "Game of Thrones", "first_air_date": "2011-04-17",
                "original_language": "en", "origin_country": ["US"], "genres": [],
                "episode_run_time": [50, 60], "number_of_episodes": 73,
                "external_ids": {"imdb_id": "tt0944947"}
            }"#,
        )
        .unwrap();
        let raw = wire.into_raw(MediaKind::Series, observed());
        assert_eq!(raw.title, "Game of Thrones");
        assert_eq!(raw.release_date, NaiveDate::from_ymd_opt(2011, 4, 17));
        assert_eq!(raw.runtime_minutes, Some(55.0 * 73.0));
        assert_eq!(raw.imdb_id.as_deref(), Some("tt0944947"));
        assert_eq!(raw.kind, MediaKind::Series);
    }

    #[test]
    fn blank_dates_and_ids_are_dropped() {
        let wire: DetailsWire = serde_json::from_str(
            r#"{"id": 5, "title": "Untitled", "release_date": "", "imdb_id": ""}"#,
        )
        .unwrap();
        let raw = wire.into_raw(MediaKind::Movie, observed());
        assert_eq!(raw.release_date, None);
        assert_eq!(raw.imdb_id, None);
        assert_eq!(raw.runtime_minutes, None);
    }

    #[test]
    fn base_url_is_trimmed() {
        let provider = TmdbProvider::new(TmdbConfig {
            base_url: "http://localhost:9/3/".into(),
            api_key: Some("k".into()),
            token: None,
            timeout: Duration::from_secs(1),
            retry: RetryPolicy::no_wait(0),
        })
        .unwrap();
        assert_eq!(provider.base_url, "http://localhost:9/3");
        assert_eq!(provider.name(), "tmdb");
    }
}
