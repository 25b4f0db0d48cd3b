//! Detection results and the latest-result slot

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Detection as reported by a detector backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub class_id: u32,
    pub class_name: String,
    pub confidence: f32,
    /// `[x1, y1, x2, y2]` in source-frame pixels
    pub bbox: [f32; 4],
    #[serde(default)]
    pub track_id: Option<u64>,
}

/// Detection with its derived anomaly flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: [f32; 4],
    pub track_id: Option<u64>,
    pub is_anomaly: bool,
}

/// Class labels that raise the anomaly flag (case-insensitive)
#[derive(Debug, Clone, Default)]
pub struct AnomalyClasses {
    labels: Vec<String>,
}

impl AnomalyClasses {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            labels: labels
                .into_iter()
                .map(|l| l.as_ref().trim().to_lowercase())
                .filter(|l| !l.is_empty())
                .collect(),
        }
    }

    pub fn contains(&self, class_name: &str) -> bool {
        let name = class_name.trim().to_lowercase();
        self.labels.iter().any(|l| *l == name)
    }

    /// Attach the anomaly flag to a raw detection
    pub fn classify(&self, raw: RawDetection) -> Detection {
        let is_anomaly = self.contains(&raw.class_name);
        Detection {
            class_id: raw.class_id,
            class_name: raw.class_name,
            confidence: raw.confidence.clamp(0.0, 1.0),
            bbox: raw.bbox,
            track_id: raw.track_id,
            is_anomaly,
        }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}

/// Outcome of one detector invocation; replaced wholesale, never merged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    /// Capture timestamp (Unix seconds) of the source frame
    pub timestamp: f64,
    pub frame_width: u32,
    pub frame_height: u32,
    pub num_detections: usize,
    pub detections: Vec<Detection>,
    pub inference_time_ms: f64,
    /// Running number of completed inferences
    pub inference_count: u64,
    /// Completed inferences per second since the first one
    pub inference_fps: f64,
    pub has_anomaly: bool,
    pub anomaly_count: usize,
}

impl InferenceResult {
    pub fn new(
        timestamp: f64,
        (frame_width, frame_height): (u32, u32),
        detections: Vec<Detection>,
        inference_time_ms: f64,
        inference_count: u64,
        inference_fps: f64,
    ) -> Self {
        let anomaly_count = detections.iter().filter(|d| d.is_anomaly).count();
        Self {
            timestamp,
            frame_width,
            frame_height,
            num_detections: detections.len(),
            detections,
            inference_time_ms: round2(inference_time_ms),
            inference_count,
            inference_fps: round2(inference_fps),
            has_anomaly: anomaly_count > 0,
            anomaly_count,
        }
    }

    /// Labels of the anomalous detections, in detection order
    pub fn anomaly_labels(&self) -> Vec<&str> {
        self.detections
            .iter()
            .filter(|d| d.is_anomaly)
            .map(|d| d.class_name.as_str())
            .collect()
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Latest-result slot
///
/// Written only by the inference scheduler; the lock is held just for the
/// pointer swap or clone.
#[derive(Debug, Default)]
pub struct ResultStore {
    latest: RwLock<Option<Arc<InferenceResult>>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, result: InferenceResult) -> Arc<InferenceResult> {
        let result = Arc::new(result);
        *self.latest.write() = Some(result.clone());
        result
    }

    pub fn latest(&self) -> Option<Arc<InferenceResult>> {
        self.latest.read().clone()
    }
}
