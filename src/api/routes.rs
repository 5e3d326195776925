// API route configuration

use crate::api::handlers;
use crate::api::models::ApiResponse;
use actix_web::{error, web, HttpResponse};

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    // Malformed query strings get the same JSON envelope as filter errors.
    cfg.app_data(web::QueryConfig::default().error_handler(|err, _req| {
        let body = ApiResponse::<()>::error(err.to_string());
        error::InternalError::from_response(err, HttpResponse::BadRequest().json(body)).into()
    }));

    cfg
        // Health check
        .route("/health", web::get().to(handlers::health_check))
        .route("/", web::get().to(handlers::health_check))
        .service(
            web::scope("/api/v1")
                // Snapshot bookkeeping
                .route("/snapshot", web::get().to(handlers::current_snapshot))
                .route("/snapshots", web::get().to(handlers::list_snapshots))
                // Unfiltered lookups
                .route("/options", web::get().to(handlers::filter_options))
                .route("/platform-order", web::get().to(handlers::platform_order))
                // Filtered aggregations
                .route("/metrics", web::get().to(handlers::metrics))
                .route("/platforms", web::get().to(handlers::platform_counts))
                .route("/genres", web::get().to(handlers::genre_counts))
                .route("/overview", web::get().to(handlers::platform_overview))
                .route("/title-counts", web::get().to(handlers::title_counts))
                .route("/ratings", web::get().to(handlers::rating_distribution))
                .route("/top-genres", web::get().to(handlers::top_genres))
                .route("/top-countries", web::get().to(handlers::top_countries))
                .route("/releases", web::get().to(handlers::releases_by_year))
                // Listings
                .route("/titles", web::get().to(handlers::list_titles))
                .route("/availability", web::get().to(handlers::list_availability)),
        );
}
