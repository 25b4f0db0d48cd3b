//! WHIP signaling endpoints

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::info;

use super::has_content_type;
use crate::error::{AppError, Result};
use crate::state::AppState;

const SDP_CONTENT_TYPE: &str = "application/sdp";
const TRICKLE_CONTENT_TYPE: &str = "application/trickle-ice-sdpfrag";

fn body_text(body: &Bytes) -> Result<&str> {
    std::str::from_utf8(body).map_err(|_| AppError::BadRequest("body is not UTF-8".to_string()))
}

/// `POST /whip`: create a session from an SDP offer
pub async fn whip_offer(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    if !has_content_type(&headers, SDP_CONTENT_TYPE) {
        return Err(AppError::UnsupportedMediaType(SDP_CONTENT_TYPE));
    }
    let offer = body_text(&body)?;

    let (id, answer) = state.sessions.create(offer).await?;
    info!("WHIP session {} answered", id);

    Ok((
        StatusCode::CREATED,
        [
            (header::CONTENT_TYPE, SDP_CONTENT_TYPE.to_string()),
            (header::LOCATION, format!("/whip/{}", id)),
        ],
        answer,
    )
        .into_response())
}

/// `PATCH /whip/{id}`: trickle ICE candidates
pub async fn whip_patch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode> {
    // Unknown sessions are rejected before anything else is looked at
    if state.sessions.get(&id).is_none() {
        return Err(AppError::NotFound(format!("session {}", id)));
    }
    if !has_content_type(&headers, TRICKLE_CONTENT_TYPE) {
        return Err(AppError::UnsupportedMediaType(TRICKLE_CONTENT_TYPE));
    }
    let fragment = body_text(&body)?;

    state.sessions.add_candidates(&id, fragment).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /whip/{id}`: end a session
pub async fn whip_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    if state.sessions.close(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("session {}", id)))
    }
}
