//! Detector backends
//!
//! The detector is an opaque `detect(frame) -> detections` function. Two
//! adapters are provided: [`BlockingDetector`] wraps an in-process model
//! and runs it on the blocking pool, [`HttpDetector`] posts JPEG frames to
//! an external inference service.

use async_trait::async_trait;
use image::RgbImage;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use super::RawDetection;
use crate::config::DetectorConfig;
use crate::video::encoder::JpegEncoder;

/// Detector invocation failures; each one costs a single cycle
#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Detector unavailable: {0}")]
    Unavailable(String),

    #[error("Detector timed out after {0:?}")]
    Timeout(Duration),

    #[error("Detector failed: {0}")]
    Failed(String),

    #[error("Invalid detector response: {0}")]
    InvalidResponse(String),

    #[error("Detector panicked: {0}")]
    Panicked(String),
}

impl DetectorError {
    fn from_join(e: tokio::task::JoinError) -> Self {
        if e.is_panic() {
            let payload = e.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            DetectorError::Panicked(message)
        } else {
            DetectorError::Failed("detector task cancelled".to_string())
        }
    }
}

/// Opaque per-frame detector
///
/// Implementations may be slow and need not be reentrant; the scheduler
/// never calls `detect` while a previous call is still running.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, frame: Arc<RgbImage>) -> Result<Vec<RawDetection>, DetectorError>;

    /// Name for logs and `/stats`
    fn name(&self) -> &str;
}

/// Adapter running a synchronous model on the blocking thread pool
pub struct BlockingDetector<F> {
    name: String,
    func: Arc<F>,
}

impl<F> BlockingDetector<F>
where
    F: Fn(&RgbImage) -> Result<Vec<RawDetection>, DetectorError> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

#[async_trait]
impl<F> Detector for BlockingDetector<F>
where
    F: Fn(&RgbImage) -> Result<Vec<RawDetection>, DetectorError> + Send + Sync + 'static,
{
    async fn detect(&self, frame: Arc<RgbImage>) -> Result<Vec<RawDetection>, DetectorError> {
        let func = self.func.clone();
        tokio::task::spawn_blocking(move || func(&frame))
            .await
            .map_err(DetectorError::from_join)?
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Response shapes accepted from an inference service
#[derive(Deserialize)]
#[serde(untagged)]
enum DetectResponse {
    Wrapped { detections: Vec<RawDetection> },
    Bare(Vec<RawDetection>),
}

impl DetectResponse {
    fn into_detections(self) -> Vec<RawDetection> {
        match self {
            DetectResponse::Wrapped { detections } => detections,
            DetectResponse::Bare(detections) => detections,
        }
    }
}

/// Detector backed by an HTTP inference service
///
/// Each call JPEG-encodes the frame, POSTs it as `image/jpeg` to the
/// configured endpoint and expects a JSON list of detections back, either
/// bare or wrapped in `{"detections": [...]}`.
pub struct HttpDetector {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
    confidence_threshold: f32,
    jpeg_quality: u8,
    encoder: Arc<Mutex<Option<JpegEncoder>>>,
}

impl HttpDetector {
    pub fn new(config: &DetectorConfig) -> Result<Self, DetectorError> {
        reqwest::Url::parse(&config.endpoint).map_err(|e| {
            DetectorError::Unavailable(format!("Invalid endpoint {}: {}", config.endpoint, e))
        })?;

        let timeout = Duration::from_millis(config.timeout_ms.max(1));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| DetectorError::Unavailable(format!("Failed to create HTTP client: {}", e)))?;

        info!("Using HTTP detector at {}", config.endpoint);

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            timeout,
            confidence_threshold: config.confidence_threshold,
            jpeg_quality: config.jpeg_quality,
            encoder: Arc::new(Mutex::new(None)),
        })
    }

    async fn encode(&self, frame: Arc<RgbImage>) -> Result<bytes::Bytes, DetectorError> {
        let encoder = self.encoder.clone();
        let quality = self.jpeg_quality;
        tokio::task::spawn_blocking(move || {
            let mut guard = encoder.lock();
            if guard.is_none() {
                *guard = Some(
                    JpegEncoder::new(quality).map_err(|e| DetectorError::Failed(e.to_string()))?,
                );
            }
            match guard.as_mut() {
                Some(encoder) => encoder
                    .encode_rgb(&frame)
                    .map_err(|e| DetectorError::Failed(e.to_string())),
                None => Err(DetectorError::Failed("JPEG encoder unavailable".to_string())),
            }
        })
        .await
        .map_err(DetectorError::from_join)?
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn detect(&self, frame: Arc<RgbImage>) -> Result<Vec<RawDetection>, DetectorError> {
        let jpeg = self.encode(frame).await?;

        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(jpeg)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DetectorError::Timeout(self.timeout)
                } else {
                    DetectorError::Unavailable(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(DetectorError::Failed(format!(
                "Inference service returned {}",
                response.status()
            )));
        }

        let parsed: DetectResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                DetectorError::Timeout(self.timeout)
            } else {
                DetectorError::InvalidResponse(e.to_string())
            }
        })?;

        let detections: Vec<RawDetection> = parsed
            .into_detections()
            .into_iter()
            .filter(|d| d.confidence >= self.confidence_threshold)
            .collect();
        debug!("Inference service returned {} detections", detections.len());
        Ok(detections)
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Bytes, routing::post, Json, Router};
    use image::Rgb;

    fn frame() -> Arc<RgbImage> {
        Arc::new(RgbImage::from_pixel(32, 24, Rgb([0, 128, 255])))
    }

    fn detection(name: &str, confidence: f32) -> RawDetection {
        RawDetection {
            class_id: 1,
            class_name: name.to_string(),
            confidence,
            bbox: [0.0, 0.0, 10.0, 10.0],
            track_id: None,
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/detect", addr)
    }

    fn config(endpoint: String) -> DetectorConfig {
        DetectorConfig {
            endpoint,
            timeout_ms: 2000,
            confidence_threshold: 0.5,
            jpeg_quality: 80,
        }
    }

    #[tokio::test]
    async fn test_blocking_detector_runs_function() {
        let detector = BlockingDetector::new("fake", |image: &RgbImage| {
            Ok(vec![detection("person", image.width() as f32 / 100.0)])
        });
        let detections = detector.detect(frame()).await.unwrap();
        assert_eq!(detections.len(), 1);
        assert!((detections[0].confidence - 0.32).abs() < 1e-6);
        assert_eq!(detector.name(), "fake");
    }

    #[tokio::test]
    async fn test_blocking_detector_panic_is_an_error() {
        let detector = BlockingDetector::new("boom", |_: &RgbImage| -> Result<Vec<RawDetection>, DetectorError> {
            panic!("model exploded")
        });
        match detector.detect(frame()).await {
            Err(DetectorError::Panicked(message)) => assert!(message.contains("model exploded")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_detector_filters_by_confidence() {
        let router = Router::new().route(
            "/detect",
            post(|body: Bytes| async move {
                // Request body must be a JPEG
                assert_eq!(&body[..2], &[0xFF, 0xD8]);
                Json(serde_json::json!({
                    "detections": [
                        detection("person", 0.9),
                        detection("dog", 0.2),
                    ]
                }))
            }),
        );
        let endpoint = serve(router).await;

        let detector = HttpDetector::new(&config(endpoint)).unwrap();
        let detections = detector.detect(frame()).await.unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_name, "person");
    }

    #[tokio::test]
    async fn test_http_detector_accepts_bare_list() {
        let router = Router::new().route(
            "/detect",
            post(|| async { Json(vec![detection("cow", 0.75)]) }),
        );
        let endpoint = serve(router).await;

        let detector = HttpDetector::new(&config(endpoint)).unwrap();
        let detections = detector.detect(frame()).await.unwrap();
        assert_eq!(detections[0].class_name, "cow");
    }

    #[tokio::test]
    async fn test_http_detector_server_error() {
        let router = Router::new().route(
            "/detect",
            post(|| async { axum::http::StatusCode::INTERNAL_SERVER_ERROR }),
        );
        let endpoint = serve(router).await;

        let detector = HttpDetector::new(&config(endpoint)).unwrap();
        assert!(matches!(
            detector.detect(frame()).await,
            Err(DetectorError::Failed(_))
        ));
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        assert!(matches!(
            HttpDetector::new(&config("not a url".to_string())),
            Err(DetectorError::Unavailable(_))
        ));
    }
}
