//! Read-only views of the pipeline

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::inference::InferenceResult;
use crate::state::AppState;
use crate::video::unix_timestamp;

/// `/detections` body; `status` is only present when nothing was published yet
#[derive(Debug, Serialize)]
pub struct DetectionsResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'static str>,
    #[serde(flatten)]
    pub result: InferenceResult,
}

pub async fn detections(State(state): State<Arc<AppState>>) -> Json<DetectionsResponse> {
    let response = match state.results.latest() {
        Some(result) => DetectionsResponse {
            status: None,
            result: (*result).clone(),
        },
        None => DetectionsResponse {
            status: Some("no_detections"),
            result: InferenceResult::new(unix_timestamp(), (0, 0), Vec::new(), 0.0, 0, 0.0),
        },
    };
    Json(response)
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub capture_fps: f64,
    pub inference_fps: f64,
    pub last_inference_time_ms: f64,
    pub num_detections: usize,
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub active_sessions: usize,
    pub has_stream: bool,
    pub is_processing: bool,
    pub stream_clients: u64,
    pub stream_fps: u32,
    pub stream_max_width: u32,
    pub jpeg_quality: u8,
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let config = state.config.get();
    let stats = &state.stats;

    Json(StatsResponse {
        capture_fps: round1(stats.capture.rate()),
        inference_fps: round1(stats.inference.rate()),
        last_inference_time_ms: stats.last_latency_ms(),
        num_detections: state
            .results
            .latest()
            .map_or(0, |result| result.num_detections),
        frames_captured: stats.frames_captured(),
        frames_dropped: stats.frames_dropped(),
        active_sessions: state.sessions.session_count(),
        has_stream: stats.stream_attached(),
        is_processing: state.gate.is_busy(),
        stream_clients: state.preview.client_count(),
        stream_fps: config.preview.fps,
        stream_max_width: config.preview.max_width,
        jpeg_quality: config.preview.jpeg_quality,
    })
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
