// HTTP request handlers for the query API.
//
// Every handler reads one `Arc<Snapshot>` up front and answers from it, so a
// snapshot swap mid-request never mixes two versions in one response.

use std::sync::Arc;
use std::time::Instant;

use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

use crate::api::models::*;
use crate::database_ops::SnapshotStore;
use crate::error::PersistenceError;
use crate::query::aggregate;
use crate::query::{FilterError, FilterParams, FilteredView, Filters, SnapshotHandle};

/// Shared state handed to every worker.
pub struct AppState {
    pub snapshot: SnapshotHandle,
    pub store: Arc<dyn SnapshotStore>,
    pub started: Instant,
}

impl AppState {
    pub fn new(snapshot: SnapshotHandle, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            snapshot,
            store,
            started: Instant::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    BadFilter(#[from] FilterError),

    #[error(transparent)]
    Store(#[from] PersistenceError),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadFilter(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ApiResponse::<()>::error(self.to_string()))
    }
}

type ApiResult = Result<HttpResponse, ApiError>;

/// Filters the current snapshot and renders `f` of the resulting view.
fn filtered<T, F>(state: &AppState, params: FilterParams, f: F) -> ApiResult
where
    T: Serialize,
    F: FnOnce(&FilteredView<'_>) -> T,
{
    let filters = Filters::try_from(params)?;
    let snapshot = state.snapshot.current();
    let view = filters.apply(&snapshot.catalog);
    Ok(HttpResponse::Ok().json(ApiResponse::success(f(&view), snapshot.version())))
}

/// Health check endpoint
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let store = match state.store.current_meta().await {
        Ok(_) => "connected",
        Err(e) => {
            tracing::warn!(error = %e, "health check could not reach the snapshot store");
            "unavailable"
        }
    };
    let snapshot = state.snapshot.current();
    let response = HealthResponse {
        status: if store == "connected" { "healthy" } else { "degraded" }.to_string(),
        store: store.to_string(),
        snapshot_id: snapshot.version(),
        committed_at: (snapshot.version() > 0).then_some(snapshot.meta.committed_at),
        uptime_seconds: state.started.elapsed().as_secs(),
    };
    HttpResponse::Ok().json(ApiResponse::success(response, snapshot.version()))
}

/// Metadata of the snapshot being served.
pub async fn current_snapshot(state: web::Data<AppState>) -> HttpResponse {
    let snapshot = state.snapshot.current();
    HttpResponse::Ok().json(ApiResponse::success(&snapshot.meta, snapshot.version()))
}

pub async fn list_snapshots(state: web::Data<AppState>, params: web::Query<LimitParams>) -> ApiResult {
    let limit = params.limit.clamp(1, 500);
    let snapshots = state.store.list(limit).await?;
    let current = state.store.current_meta().await?.map(|m| m.id);
    Ok(HttpResponse::Ok().json(ApiResponse::success(
        SnapshotList { current, snapshots },
        state.snapshot.version(),
    )))
}

/// Distinct values available to the filter controls. Unfiltered.
pub async fn filter_options(state: web::Data<AppState>) -> HttpResponse {
    let snapshot = state.snapshot.current();
    let options = aggregate::filter_options(&snapshot.catalog);
    HttpResponse::Ok().json(ApiResponse::success(options, snapshot.version()))
}

pub async fn platform_order(state: web::Data<AppState>) -> HttpResponse {
    let snapshot = state.snapshot.current();
    let links: Vec<PlatformLink> = aggregate::platform_order(&snapshot.catalog)
        .into_iter()
        .map(|platform| PlatformLink {
            titles_href: format!("/api/v1/titles?platform={}", urlencoding::encode(&platform)),
            platform,
        })
        .collect();
    HttpResponse::Ok().json(ApiResponse::success(links, snapshot.version()))
}

pub async fn metrics(state: web::Data<AppState>, params: web::Query<FilterParams>) -> ApiResult {
    filtered(&state, params.into_inner(), aggregate::summary)
}

pub async fn platform_counts(state: web::Data<AppState>, params: web::Query<FilterParams>) -> ApiResult {
    filtered(&state, params.into_inner(), aggregate::counts_per_platform)
}

pub async fn genre_counts(state: web::Data<AppState>, params: web::Query<FilterParams>) -> ApiResult {
    filtered(&state, params.into_inner(), aggregate::counts_per_genre)
}

pub async fn platform_overview(state: web::Data<AppState>, params: web::Query<FilterParams>) -> ApiResult {
    filtered(&state, params.into_inner(), aggregate::platform_overview)
}

pub async fn title_counts(state: web::Data<AppState>, params: web::Query<FilterParams>) -> ApiResult {
    filtered(&state, params.into_inner(), aggregate::title_counts)
}

pub async fn rating_distribution(state: web::Data<AppState>, params: web::Query<FilterParams>) -> ApiResult {
    filtered(&state, params.into_inner(), aggregate::rating_distribution)
}

pub async fn top_genres(
    state: web::Data<AppState>,
    params: web::Query<FilterParams>,
    top: web::Query<TopParams>,
) -> ApiResult {
    let n = top.n.clamp(1, 50);
    filtered(&state, params.into_inner(), |view| aggregate::top_genres(view, n))
}

pub async fn top_countries(
    state: web::Data<AppState>,
    params: web::Query<FilterParams>,
    top: web::Query<TopParams>,
) -> ApiResult {
    let n = top.n.clamp(1, 50);
    filtered(&state, params.into_inner(), |view| aggregate::top_countries(view, n))
}

pub async fn releases_by_year(
    state: web::Data<AppState>,
    params: web::Query<FilterParams>,
    releases: web::Query<ReleasesParams>,
) -> ApiResult {
    let min_year = releases.min_year;
    filtered(&state, params.into_inner(), |view| {
        aggregate::releases_by_year(view, min_year)
    })
}

pub async fn list_titles(
    state: web::Data<AppState>,
    params: web::Query<FilterParams>,
    paging: web::Query<PageParams>,
) -> ApiResult {
    let PageParams { page, per_page } = paging.into_inner();
    filtered(&state, params.into_inner(), |view| {
        aggregate::list_titles(view, page, per_page)
    })
}

/// Matching availability rows, paginated like the title listing.
pub async fn list_availability(
    state: web::Data<AppState>,
    params: web::Query<FilterParams>,
    paging: web::Query<PageParams>,
) -> ApiResult {
    let per_page = paging.per_page.clamp(1, 500);
    let page = paging.page.max(1);
    filtered(&state, params.into_inner(), |view| {
        let items: Vec<_> = view
            .availability
            .iter()
            .skip((page - 1).saturating_mul(per_page))
            .take(per_page)
            .copied()
            .collect();
        serde_json::json!({
            "total": view.availability.len(),
            "page": page,
            "per_page": per_page,
            "items": items,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::routes::configure_routes;
    use crate::catalog::{Snapshot, SnapshotMeta};
    use crate::database_ops::MemorySnapshotStore;
    use crate::query::filters::tests::{avail, sample_catalog};
    use actix_web::{test, App};
    use chrono::{TimeZone, Utc};
    use serde_json::Value;

    fn state_with(catalog: crate::catalog::UnifiedCatalog) -> web::Data<AppState> {
        let snapshot = Snapshot {
            meta: SnapshotMeta {
                id: 7,
                committed_at: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
                content_hash: catalog.content_hash(),
                title_count: catalog.titles.len() as i64,
                availability_count: catalog.availability.len() as i64,
            },
            catalog,
        };
        web::Data::new(AppState::new(
            SnapshotHandle::new(snapshot),
            Arc::new(MemorySnapshotStore::new()),
        ))
    }

    macro_rules! app {
        ($state:expr) => {
            test::init_service(App::new().app_data($state).configure(configure_routes)).await
        };
    }

    #[actix_web::test]
    async fn health_reports_served_snapshot() {
        let app = app!(state_with(sample_catalog()));
        let req = test::TestRequest::get().uri("/health").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["status"], "healthy");
        assert_eq!(body["data"]["snapshot_id"], 7);
        assert_eq!(body["meta"]["snapshot_id"], 7);
    }

    #[actix_web::test]
    async fn platform_counts_respect_genre_filter() {
        let app = app!(state_with(sample_catalog()));
        let req = test::TestRequest::get()
            .uri("/api/v1/platforms?genre=Comedy")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        let rows = body["data"].as_array().unwrap();
        // b on Netflix US; c on Hulu US and Netflix GB
        assert_eq!(rows[0]["platform"], "Netflix");
        assert_eq!(rows[0]["titles"], 2);
        assert_eq!(rows[1]["platform"], "Hulu");
        assert_eq!(rows[1]["titles"], 1);
    }

    #[actix_web::test]
    async fn invalid_filters_are_bad_requests() {
        let app = app!(state_with(sample_catalog()));
        let req = test::TestRequest::get()
            .uri("/api/v1/metrics?media_type=podcast")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["success"], false);

        let req = test::TestRequest::get()
            .uri("/api/v1/metrics?rating_min=high")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn titles_are_paginated() {
        let app = app!(state_with(sample_catalog()));
        let req = test::TestRequest::get()
            .uri("/api/v1/titles?page=2&per_page=3")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["total"], 4);
        assert_eq!(body["data"]["page"], 2);
        let items = body["data"]["items"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["id"], "d");
        assert_eq!(items[0]["platforms"].as_array().unwrap().len(), 0);
    }

    #[actix_web::test]
    async fn summary_counts_movies_and_series() {
        let app = app!(state_with(sample_catalog()));
        let req = test::TestRequest::get()
            .uri("/api/v1/metrics?region=US")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["titles"], 3);
        assert_eq!(body["data"]["movies"], 2);
        assert_eq!(body["data"]["series"], 1);
        assert_eq!(body["data"]["platforms"], 2);
    }

    #[actix_web::test]
    async fn platform_order_links_are_encoded() {
        let mut catalog = sample_catalog();
        catalog.availability.push(avail("d", "Prime Video", "US"));
        catalog.sort_availability();
        let app = app!(state_with(catalog));
        let req = test::TestRequest::get()
            .uri("/api/v1/platform-order")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        let links = body["data"].as_array().unwrap();
        let prime = links
            .iter()
            .find(|l| l["platform"] == "Prime Video")
            .unwrap();
        assert_eq!(prime["titles_href"], "/api/v1/titles?platform=Prime%20Video");
    }

    #[actix_web::test]
    async fn snapshots_listing_reads_the_store() {
        let store = Arc::new(MemorySnapshotStore::new());
        let meta = store.commit(&sample_catalog()).await.unwrap();
        let state = web::Data::new(AppState::new(SnapshotHandle::empty(), store));
        let app = app!(state);
        let req = test::TestRequest::get().uri("/api/v1/snapshots").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["current"], meta.id);
        assert_eq!(body["data"]["snapshots"].as_array().unwrap().len(), 1);
    }
}
