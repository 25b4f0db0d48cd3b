//! Annotated preview as MJPEG and single JPEG

use axum::{
    body::Body,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
};
use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::stream::ClientGuard;

/// Resend the current image when nothing new arrived for this long
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Deserialize, Default)]
pub struct StreamQuery {
    /// Optional client ID (if not provided, a random UUID will be generated)
    pub client_id: Option<String>,
}

/// `GET /stream`: `multipart/x-mixed-replace` preview
pub async fn mjpeg_stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let client_id = query
        .client_id
        .filter(|id| !id.is_empty() && id.len() <= 64)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let guard = ClientGuard::new(client_id, state.preview.clone());

    // Capacity 1: a client that has not consumed the previous part gets the
    // newest image once it catches up instead of a backlog
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Bytes>(1);

    let preview = state.preview.clone();
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        let _guard = guard;
        let mut updates = preview.subscribe();
        let mut last_seq = 0u64;

        if let Some(frame) = preview.latest() {
            if tx.send(multipart_part(&frame.jpeg)).await.is_err() {
                return;
            }
            last_seq = frame.sequence;
        }

        loop {
            let update = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tx.closed() => break,
                update = tokio::time::timeout(KEEPALIVE_INTERVAL, updates.recv()) => update,
            };

            let resend = match update {
                Ok(Ok(())) | Ok(Err(RecvError::Lagged(_))) => false,
                Ok(Err(RecvError::Closed)) => break,
                Err(_) => true,
            };

            let Some(frame) = preview.latest() else {
                continue;
            };
            if frame.sequence == last_seq && !resend {
                continue;
            }
            if tx.send(multipart_part(&frame.jpeg)).await.is_err() {
                break;
            }
            last_seq = frame.sequence;
        }
    });

    let body_stream = async_stream::stream! {
        while let Some(data) = rx.recv().await {
            yield Ok::<Bytes, std::io::Error>(data);
        }
    };

    (
        [
            (header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=frame"),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::PRAGMA, "no-cache"),
        ],
        Body::from_stream(body_stream),
    )
        .into_response()
}

/// `GET /annotated-frame.jpg`: latest preview image
pub async fn annotated_frame(State(state): State<Arc<AppState>>) -> Result<Response> {
    let frame = state
        .preview
        .latest()
        .ok_or_else(|| AppError::NotFound("no annotated frame yet".to_string()))?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/jpeg"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        frame.jpeg.clone(),
    )
        .into_response())
}

/// One multipart part: boundary, headers and JPEG payload
fn multipart_part(jpeg_data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(128 + jpeg_data.len());

    buf.put_slice(b"--frame\r\n");
    buf.put_slice(b"Content-Type: image/jpeg\r\n");
    buf.put_slice(format!("Content-Length: {}\r\n", jpeg_data.len()).as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(jpeg_data);
    buf.put_slice(b"\r\n");

    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multipart_part_layout() {
        let part = multipart_part(&[0xFF, 0xD8, 0xFF, 0xD9]);
        let head = b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\n";
        assert!(part.starts_with(head));
        assert_eq!(&part[head.len()..head.len() + 4], &[0xFF, 0xD8, 0xFF, 0xD9]);
        assert!(part.ends_with(b"\r\n"));
    }
}
