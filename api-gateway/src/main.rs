// ==============================================================================
// main.rs - Lab Results API Gateway Entry Point
// ==============================================================================
// Description: Axum web server for lab document upload and result retrieval
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use labs_ingest::logging::init_tracing;

mod config;
mod handlers;
mod intake;
mod middleware;
mod models;
mod queue;
mod state;

use config::GatewayConfig;
use state::AppState;

/// Multipart framing on top of the document itself
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("labs_api_gateway=info,labs_ingest=info,tower_http=info");

    info!("Starting Lab Results API Gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = GatewayConfig::from_env().context("Invalid gateway configuration")?;

    let state = AppState::connect(&config)
        .await
        .context("Failed to initialize application state")?;

    let app = build_router(state, &config);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("API Gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("API Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn build_router(state: AppState, config: &GatewayConfig) -> Router {
    let body_limit = state.validator().max_size() + MULTIPART_OVERHEAD;

    let api_routes = Router::new()
        .route(
            "/results",
            get(handlers::list_lab_results).post(handlers::upload_lab_result),
        )
        .route(
            "/results/{id}",
            get(handlers::get_lab_result).delete(handlers::delete_lab_result),
        )
        .route("/results/{id}/biomarkers", get(handlers::get_biomarkers))
        .route("/files/{*key}", get(handlers::download_file));

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(cors_origins(&config.cors_origins)))
        .allow_credentials(false)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            // Forward-auth identity (middleware::auth)
            HeaderName::from_static("x-user-id"),
            HeaderName::from_static("x-system-id"),
        ])
        .expose_headers([header::CONTENT_TYPE, header::CONTENT_DISPOSITION]);

    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .nest("/api/labs", api_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .with_state(state)
}

fn cors_origins(origins: &[String]) -> Vec<HeaderValue> {
    origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect()
}
