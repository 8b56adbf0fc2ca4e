//! HTTP layer of the crop analysis service
//!
//! Exposes health and model listing, image prediction and agronomic
//! analysis, field and spot records, and per-field geometry and summary
//! endpoints.

pub mod handlers;
pub mod routes;
pub mod types;

use crate::config::Config;
use crate::error::Result;
use crate::zoo::ModelZoo;
use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub zoo: Arc<ModelZoo>,
    pub pool: SqlitePool,
    pub config: Config,
}

/// Start the API server
pub async fn start_server(config: Config, zoo: Arc<ModelZoo>, pool: SqlitePool) -> Result<()> {
    let bind_address = config.server_address();
    info!("Starting API server on {}", bind_address);

    let enable_cors = config.server.enable_cors;
    let app_state = AppState {
        zoo: Arc::clone(&zoo),
        pool,
        config,
    };

    HttpServer::new(move || {
        let cors = if enable_cors {
            Cors::default()
                .allow_any_origin()
                .allow_any_method()
                .allow_any_header()
                .max_age(3600)
        } else {
            Cors::default()
        };

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .configure(routes::configure)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
