//! Bounded retry loop shared by the source clients, plus the mapping from
//! HTTP outcomes onto `SourceError`.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use reqwest::{header::HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::SourceError;
use crate::util::env as env_util;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Reads `<PREFIX>_MAX_RETRIES` and `<PREFIX>_BACKOFF_MS`.
    pub fn from_env(prefix: &str) -> Self {
        let defaults = Self::default();
        let max_retries = env_util::env_parse(&format!("{prefix}_MAX_RETRIES"), defaults.max_retries);
        let backoff_ms = env_util::env_parse(
            &format!("{prefix}_BACKOFF_MS"),
            defaults.backoff.as_millis() as u64,
        );
        Self {
            max_retries,
            backoff: Duration::from_millis(backoff_ms),
            max_backoff: defaults.max_backoff,
        }
    }

    pub fn no_wait(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Exponential delay for the given zero-based retry, with up to 25%
    /// jitter. A server-provided `Retry-After` is honoured when longer.
    pub fn delay_for(&self, attempt: u32, err: &SourceError) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        let base = self.backoff.saturating_mul(factor).min(self.max_backoff);
        let jitter_cap = base.as_millis() as u64 / 4;
        let jitter = if jitter_cap > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap))
        } else {
            Duration::ZERO
        };
        let delay = base + jitter;
        match err.retry_after() {
            Some(server) if server > delay => server,
            _ => delay,
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt, &err);
                    warn!(
                        provider = err.provider(),
                        what,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "request failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn truncate_for_log(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push('…');
    }
    s
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("Retry-After")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Maps a non-success response onto the error taxonomy.
pub fn classify_status(
    provider: &'static str,
    what: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: String,
) -> SourceError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => SourceError::RateLimited {
            provider,
            retry_after: parse_retry_after(headers),
        },
        StatusCode::NOT_FOUND => SourceError::NotFound {
            provider,
            what: what.to_string(),
        },
        _ => SourceError::SourceUnavailable {
            provider,
            status: Some(status.as_u16()),
            message: truncate_for_log(body, 500),
        },
    }
}

pub fn classify_transport(provider: &'static str, err: reqwest::Error) -> SourceError {
    if err.is_decode() {
        return SourceError::Decode {
            provider,
            message: err.to_string(),
        };
    }
    SourceError::SourceUnavailable {
        provider,
        status: err.status().map(|s| s.as_u16()),
        message: err.to_string(),
    }
}

/// Sends one request and decodes a JSON body, classifying every failure.
pub async fn send_json<T: DeserializeOwned>(
    provider: &'static str,
    what: &str,
    request: reqwest::RequestBuilder,
) -> Result<T, SourceError> {
    let resp = request
        .send()
        .await
        .map_err(|e| classify_transport(provider, e))?;
    let status = resp.status();
    if !status.is_success() {
        let headers = resp.headers().clone();
        let body = resp.text().await.unwrap_or_default();
        return Err(classify_status(provider, what, status, &headers, body));
    }
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| classify_transport(provider, e))?;
    serde_json::from_slice(&bytes).map_err(|e| SourceError::Decode {
        provider,
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unavailable(status: Option<u16>) -> SourceError {
        SourceError::SourceUnavailable {
            provider: "test",
            status,
            message: "boom".into(),
        }
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::no_wait(3)
            .run("thing", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(unavailable(Some(503)))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::no_wait(2)
            .run("thing", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SourceError::RateLimited {
                    provider: "test",
                    retry_after: None,
                })
            })
            .await;
        assert!(matches!(result, Err(SourceError::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::no_wait(5)
            .run("thing", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(unavailable(Some(401)))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_grows_and_respects_retry_after() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
        };
        let err = unavailable(None);
        let first = policy.delay_for(0, &err);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        let capped = policy.delay_for(10, &err);
        assert!(capped >= Duration::from_millis(1000) && capped <= Duration::from_millis(1250));

        let throttled = SourceError::RateLimited {
            provider: "test",
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(policy.delay_for(0, &throttled), Duration::from_secs(30));
    }

    #[test]
    fn statuses_map_onto_taxonomy() {
        let mut headers = HeaderMap::new();
        headers.insert("Retry-After", "12".parse().unwrap());
        let err = classify_status("tmdb", "movie/1", StatusCode::TOO_MANY_REQUESTS, &headers, String::new());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));

        let err = classify_status("tmdb", "movie/1", StatusCode::NOT_FOUND, &HeaderMap::new(), String::new());
        assert!(matches!(err, SourceError::NotFound { .. }));

        let err = classify_status("tmdb", "movie/1", StatusCode::BAD_GATEWAY, &HeaderMap::new(), "x".repeat(900));
        assert!(err.is_retryable());
        match err {
            SourceError::SourceUnavailable { status, message, .. } => {
                assert_eq!(status, Some(502));
                assert!(message.len() < 900);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
