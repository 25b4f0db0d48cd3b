use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Web server settings
    pub web: WebConfig,
    /// WHIP peer connection settings
    pub webrtc: WebRtcConfig,
    /// Capture ingest loop settings
    pub capture: CaptureConfig,
    /// Inference scheduling settings
    pub inference: InferenceConfig,
    /// Detector backend settings
    pub detector: DetectorConfig,
    /// Annotated preview stream settings
    pub preview: PreviewConfig,
    /// Runtime and shutdown settings
    pub runtime: RuntimeConfig,
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebConfig {
    /// Bind address
    pub bind_address: String,
    /// HTTP port
    pub http_port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8000,
        }
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnServer {
    /// TURN server URLs
    pub urls: Vec<String>,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub credential: String,
}

/// WHIP peer connection configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN servers
    pub turn_servers: Vec<TurnServer>,
    /// Upper bound on local ICE gathering before the answer is returned (ms)
    pub ice_gathering_timeout_ms: u64,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            // Host candidates are enough for publishers on the same network
            stun_servers: vec![],
            turn_servers: vec![],
            ice_gathering_timeout_ms: 2000,
        }
    }
}

impl WebRtcConfig {
    pub fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gathering_timeout_ms)
    }
}

/// Capture ingest loop configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    /// Per-read timeout on the transport (ms)
    pub read_timeout_ms: u64,
    /// Consecutive read errors (not timeouts) that end the loop
    pub max_consecutive_errors: u32,
    /// Pause after a read error before retrying (ms)
    pub error_backoff_ms: u64,
    /// Discard incoming frames while a detector invocation is in flight
    pub drop_frames_while_busy: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 500,
            max_consecutive_errors: 50,
            error_backoff_ms: 50,
            drop_frames_while_busy: true,
        }
    }
}

impl CaptureConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

/// Inference scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InferenceConfig {
    /// Scheduler poll cadence (ms)
    pub poll_interval_ms: u64,
    /// Minimum time between two detector invocations (ms)
    pub min_interval_ms: u64,
    /// Class labels flagged as anomalies (case-insensitive)
    pub anomaly_classes: Vec<String>,
    /// Where to write the latest result after each inference (relative to data dir)
    pub snapshot_path: Option<PathBuf>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            min_interval_ms: 120,
            anomaly_classes: vec!["person".to_string()],
            snapshot_path: Some(PathBuf::from("latest_detections/detections.json")),
        }
    }
}

impl InferenceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

/// Detector backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectorConfig {
    /// Inference service endpoint receiving JPEG frames
    pub endpoint: String,
    /// Request timeout (ms)
    pub timeout_ms: u64,
    /// Detections below this confidence are discarded
    pub confidence_threshold: f32,
    /// JPEG quality of frames sent to the service
    pub jpeg_quality: u8,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9000/detect".to_string(),
            timeout_ms: 2000,
            confidence_threshold: 0.25,
            jpeg_quality: 90,
        }
    }
}

/// Annotated preview configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PreviewConfig {
    /// Enable the preview encoder
    pub enabled: bool,
    /// Encode cadence
    pub fps: u32,
    /// Downscale wider frames to this width (0 = keep source width)
    pub max_width: u32,
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
    /// TrueType font used for box labels; labels are drawn as bars only without it
    pub font_path: Option<PathBuf>,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fps: 12,
            max_width: 960,
            jpeg_quality: 85,
            font_path: None,
        }
    }
}

impl PreviewConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_micros((1_000_000 / self.fps.max(1) as u64).max(1))
    }
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Async worker threads
    pub worker_threads: usize,
    /// Upper bound on the blocking pool used for detection and encoding
    pub max_blocking_threads: usize,
    /// How long shutdown waits for sessions and background tasks (ms)
    pub shutdown_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            max_blocking_threads: 4,
            shutdown_timeout_ms: 5000,
        }
    }
}

impl RuntimeConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{ "inference": { "min_interval_ms": 250 }, "web": { "http_port": 9100 } }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.inference.min_interval_ms, 250);
        assert_eq!(config.inference.poll_interval_ms, 10);
        assert_eq!(config.inference.anomaly_classes, vec!["person".to_string()]);
        assert_eq!(config.web.http_port, 9100);
        assert_eq!(config.web.bind_address, "0.0.0.0");
        assert_eq!(config.capture.max_consecutive_errors, 50);
    }

    #[test]
    fn test_preview_interval() {
        let preview = PreviewConfig {
            fps: 20,
            ..Default::default()
        };
        assert_eq!(preview.interval(), Duration::from_millis(50));

        let zero = PreviewConfig {
            fps: 0,
            ..Default::default()
        };
        assert_eq!(zero.interval(), Duration::from_secs(1));

        let huge = PreviewConfig {
            fps: 5_000_000,
            ..Default::default()
        };
        assert_eq!(huge.interval(), Duration::from_micros(1));
    }
}
