pub mod query;
pub mod stream;
pub mod whip;

use axum::http::{header, HeaderMap};
use axum::Json;
use serde::Serialize;

pub use query::{detections, stats};
pub use stream::{annotated_frame, mjpeg_stream};
pub use whip::{whip_delete, whip_offer, whip_patch};

// ============================================================================
// Health
// ============================================================================

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Whether the request's media type (parameters ignored) is `expected`
pub(crate) fn has_content_type(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|media_type| media_type.trim().eq_ignore_ascii_case(expected))
}
