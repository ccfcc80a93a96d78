pub mod assessment;
pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;

use crate::handlers::AppState;
use axum::{
    extract::DefaultBodyLimit,
    routing::get,
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub fn create_app(app_state: AppState) -> Router {
    // ブラウザ上の録音クライアントから任意のオリジンで呼ばれる
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let body_limit = app_state.config.max_request_size_bytes();

    Router::new()
        .route("/", get(handlers::index))
        .route(
            "/assess",
            get(handlers::assess_debug).post(handlers::assess),
        )
        .route("/debug", get(handlers::debug_sample))
        .route("/health", get(handlers::health_check))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
        )
        .with_state(app_state)
}
