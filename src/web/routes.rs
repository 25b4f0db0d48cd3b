use axum::{
    extract::DefaultBodyLimit,
    http::header,
    routing::{get, patch, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use crate::state::AppState;

/// SDP offers and candidate fragments are small
const MAX_BODY_BYTES: usize = 256 * 1024;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        // Browser WHIP clients need the session URL
        .expose_headers([header::LOCATION]);

    let whip_routes = Router::new()
        .route("/whip", post(handlers::whip_offer))
        .route(
            "/whip/:id",
            patch(handlers::whip_patch).delete(handlers::whip_delete),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES));

    let query_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/detections", get(handlers::detections))
        .route("/stats", get(handlers::stats))
        .route("/stream", get(handlers::mjpeg_stream))
        .route("/annotated-frame.jpg", get(handlers::annotated_frame));

    Router::new()
        .merge(whip_routes)
        .merge(query_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
