use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::inference::DetectorError;
use crate::video::encoder::EncodeError;
use crate::video::TransportError;
use crate::webrtc::SignalingError;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unsupported media type: expected {0}")]
    UnsupportedMediaType(&'static str),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Detector(#[from] DetectorError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::Signaling(e) => match e {
                SignalingError::MalformedOffer(_) => StatusCode::BAD_REQUEST,
                SignalingError::UnknownSession(_) => StatusCode::NOT_FOUND,
                SignalingError::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::Transport(_) | AppError::Detector(_) | AppError::Encode(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Config(_)
            | AppError::Io(_)
            | AppError::Serialization(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            success: false,
            message: self.to_string(),
        };

        if status.is_server_error() {
            tracing::error!(status = %status, error_message = %body.message, "Request failed");
        } else {
            tracing::debug!(status = %status, error_message = %body.message, "Request rejected");
        }

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signaling_errors_map_to_client_errors() {
        let malformed = AppError::from(SignalingError::MalformedOffer("empty".into()));
        assert_eq!(malformed.status_code(), StatusCode::BAD_REQUEST);

        let unknown = AppError::from(SignalingError::UnknownSession("abc".into()));
        assert_eq!(unknown.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_unsupported_media_type() {
        let err = AppError::UnsupportedMediaType("application/sdp");
        assert_eq!(err.status_code(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(err.to_string().contains("application/sdp"));
    }
}
