//! Route table for the HTTP API

use super::handlers;
use actix_web::web;

/// Configure all API routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/health", web::get().to(handlers::health_check))
            .route("/models", web::get().to(handlers::list_models))
            .route("/predict", web::post().to(handlers::predict))
            .route("/analyze", web::post().to(handlers::analyze))
            .route("/fields", web::post().to(handlers::create_field))
            .route("/fields", web::get().to(handlers::list_fields))
            .route("/fields/{field_id}", web::get().to(handlers::get_field))
            .route("/fields/{field_id}", web::delete().to(handlers::delete_field))
            .route(
                "/fields/{field_id}/metrics",
                web::get().to(handlers::get_field_metrics),
            )
            .route(
                "/fields/{field_id}/spots",
                web::post().to(handlers::create_spot),
            )
            .route(
                "/fields/{field_id}/analysis-summary",
                web::get().to(handlers::analysis_summary),
            )
            .route("/spots/{spot_id}", web::get().to(handlers::get_spot))
            .route("/spots/{spot_id}", web::delete().to(handlers::delete_spot)),
    )
    .default_service(web::route().to(handlers::not_found));
}
