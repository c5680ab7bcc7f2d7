pub mod cache;
pub mod config;
pub mod error;
pub mod handlers;
pub mod imaging;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod state;
pub mod upstream;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{Method, header},
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::{GatewayError, Result};
pub use state::ServerContext;

// creating the router with routes
pub fn router(ctx: Arc<ServerContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::PUT,
            Method::POST,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/analyze_medical_report", post(handlers::analyze_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(DefaultBodyLimit::max(ctx.max_upload_size))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}
