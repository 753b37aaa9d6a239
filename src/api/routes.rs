//! API Routes
//!
//! Configures the Axum router with all worker endpoints.

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    add_handler, cas_handler, clear_handler, dec_handler, delete_handler, exists_handler,
    fetch_handler, health_handler, inc_handler, stats_handler, store_handler, AppState,
};

/// Creates the main router with all endpoints configured.
///
/// # Middleware
/// - CORS: Allows any origin (configurable for production)
/// - Tracing: Logs all requests for debugging
pub fn create_router(state: AppState) -> Router {
    // Configure CORS middleware
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/store", put(store_handler))
        .route("/add", put(add_handler))
        .route("/fetch/:key", get(fetch_handler))
        .route("/exists/:key", get(exists_handler))
        .route("/delete/:key", delete(delete_handler))
        .route("/inc/:key", post(inc_handler))
        .route("/dec/:key", post(dec_handler))
        .route("/cas/:key", post(cas_handler))
        .route("/clear", post(clear_handler))
        .route("/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
