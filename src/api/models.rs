// API request/response models (DTOs)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::SnapshotMeta;

/// Standard API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T, snapshot_id: i64) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            meta: Some(Meta::now(Some(snapshot_id))),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            meta: Some(Meta::now(None)),
        }
    }
}

/// Metadata included in all API responses
#[derive(Debug, Serialize, Deserialize)]
pub struct Meta {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub version: String,
    /// Snapshot the data was read from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<i64>,
}

impl Meta {
    pub fn now(snapshot_id: Option<i64>) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: uuid::Uuid::new_v4().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            snapshot_id,
        }
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub store: String,
    pub snapshot_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub committed_at: Option<DateTime<Utc>>,
    pub uptime_seconds: u64,
}

/// `?n=` for the top-N endpoints.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TopParams {
    #[serde(default = "default_top_n")]
    pub n: usize,
}

fn default_top_n() -> usize {
    5
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ReleasesParams {
    #[serde(default = "default_min_year")]
    pub min_year: i32,
}

fn default_min_year() -> i32 {
    2000
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageParams {
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_per_page")]
    pub per_page: usize,
}

fn default_page() -> usize {
    1
}

fn default_per_page() -> usize {
    50
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LimitParams {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    20
}

/// Platform in overall title-count order with a link to its titles.
#[derive(Debug, Serialize, Deserialize)]
pub struct PlatformLink {
    pub platform: String,
    pub titles_href: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotList {
    pub current: Option<i64>,
    pub snapshots: Vec<SnapshotMeta>,
}
