//! Error taxonomy shared by the refresh pipeline.
//!
//! Source errors are produced by the external clients and carry enough
//! information for the retry loop to decide whether another attempt makes
//! sense. Persistence errors come from the snapshot store. `RefreshError` is
//! what a refresh run surfaces to the operator.

use std::time::Duration;

use thiserror::Error;

use crate::orchestrator::RefreshState;

#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// Service unreachable, timed out, or answered with a non-success status.
    #[error("{provider} unavailable (status={}): {message}", fmt_status(.status))]
    SourceUnavailable {
        provider: &'static str,
        status: Option<u16>,
        message: String,
    },

    /// Service throttled the request (HTTP 429).
    #[error("{provider} rate limited the request")]
    RateLimited {
        provider: &'static str,
        retry_after: Option<Duration>,
    },

    /// A single requested record does not exist upstream.
    #[error("{provider} has no record for {what}")]
    NotFound { provider: &'static str, what: String },

    #[error("{provider} returned an undecodable payload: {message}")]
    Decode {
        provider: &'static str,
        message: String,
    },
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| s.to_string()).unwrap_or_else(|| "none".into())
}

impl SourceError {
    /// Whether another attempt against the same endpoint may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::RateLimited { .. } => true,
            SourceError::SourceUnavailable { status, .. } => match status {
                None => true,
                Some(code) => *code >= 500 || *code == 408,
            },
            SourceError::NotFound { .. } | SourceError::Decode { .. } => false,
        }
    }

    pub fn provider(&self) -> &'static str {
        match self {
            SourceError::SourceUnavailable { provider, .. }
            | SourceError::RateLimited { provider, .. }
            | SourceError::NotFound { provider, .. }
            | SourceError::Decode { provider, .. } => provider,
        }
    }

    /// Server-suggested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SourceError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Connectivity to the store was lost or could not be established.
    #[error("snapshot store connection failed: {0}")]
    Connection(String),

    #[error("snapshot write failed: {0}")]
    Write(String),

    #[error("snapshot read failed: {0}")]
    Read(String),

    #[error("snapshot payload invalid: {0}")]
    Corrupt(String),
}

impl PersistenceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PersistenceError::Connection(_))
    }
}

impl From<sqlx::Error> for PersistenceError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => PersistenceError::Connection(err.to_string()),
            sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => {
                PersistenceError::Corrupt(err.to_string())
            }
            other => PersistenceError::Write(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("a refresh run is already in progress")]
    AlreadyRunning,

    #[error("refresh cancelled during {stage:?}")]
    Cancelled { stage: RefreshState },

    /// A source kept failing after its retry budget was spent.
    #[error("refresh abandoned: {error}")]
    SourceAbandoned {
        #[source]
        error: SourceError,
    },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl From<SourceError> for RefreshError {
    fn from(error: SourceError) -> Self {
        RefreshError::SourceAbandoned { error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        let throttled = SourceError::RateLimited {
            provider: "tmdb",
            retry_after: Some(Duration::from_secs(2)),
        };
        assert!(throttled.is_retryable());
        assert_eq!(throttled.retry_after(), Some(Duration::from_secs(2)));

        let down = SourceError::SourceUnavailable {
            provider: "watchmode",
            status: Some(503),
            message: "maintenance".into(),
        };
        assert!(down.is_retryable());

        let unreachable = SourceError::SourceUnavailable {
            provider: "watchmode",
            status: None,
            message: "connection refused".into(),
        };
        assert!(unreachable.is_retryable());

        let unauthorized = SourceError::SourceUnavailable {
            provider: "tmdb",
            status: Some(401),
            message: "invalid api key".into(),
        };
        assert!(!unauthorized.is_retryable());

        let missing = SourceError::NotFound {
            provider: "tmdb",
            what: "movie/1".into(),
        };
        assert!(!missing.is_retryable());
    }

    #[test]
    fn unavailable_message_mentions_status() {
        let err = SourceError::SourceUnavailable {
            provider: "tmdb",
            status: Some(502),
            message: "bad gateway".into(),
        };
        assert_eq!(err.to_string(), "tmdb unavailable (status=502): bad gateway");
    }

    #[test]
    fn pool_timeouts_are_connection_errors() {
        let err: PersistenceError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_retryable());
        let err: PersistenceError = sqlx::Error::RowNotFound.into();
        assert!(!err.is_retryable());
    }
}
