//! Annotated MJPEG preview
//!
//! The encoder runs on its own cadence, independent of inference. Each tick
//! it pairs the latest frame with the latest result (two separate reads, so
//! the pair is only approximately in sync), draws the detections, downsamples
//! and JPEG-encodes on the blocking pool, then swaps the output into the
//! [`PreviewStore`] that HTTP clients read from.

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::overlay::{downscale, Overlay};
use crate::config::PreviewConfig;
use crate::inference::{InferenceResult, ResultStore};
use crate::utils::LogThrottler;
use crate::video::encoder::{EncodeError, JpegEncoder};
use crate::video::{FrameStamp, FrameStore};
use crate::warn_throttled;

/// One encoded preview image
#[derive(Debug, Clone)]
pub struct PreviewFrame {
    pub jpeg: Bytes,
    pub width: u32,
    pub height: u32,
    /// Preview sequence number
    pub sequence: u64,
    /// Stamp of the source frame
    pub source: FrameStamp,
}

/// Latest encoded preview plus change notification for stream clients
pub struct PreviewStore {
    current: ArcSwapOption<PreviewFrame>,
    notify: broadcast::Sender<()>,
    sequence: AtomicU64,
    clients: AtomicU64,
}

impl PreviewStore {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(16);
        Self {
            current: ArcSwapOption::const_empty(),
            notify,
            sequence: AtomicU64::new(0),
            clients: AtomicU64::new(0),
        }
    }

    /// Replace the current preview and wake stream clients
    pub fn publish(&self, jpeg: Bytes, width: u32, height: u32, source: FrameStamp) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        self.current.store(Some(Arc::new(PreviewFrame {
            jpeg,
            width,
            height,
            sequence,
            source,
        })));
        let _ = self.notify.send(());
        sequence
    }

    pub fn latest(&self) -> Option<Arc<PreviewFrame>> {
        self.current.load_full()
    }

    /// Subscribe to preview updates
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify.subscribe()
    }

    /// Number of connected `/stream` clients
    pub fn client_count(&self) -> u64 {
        self.clients.load(Ordering::Relaxed)
    }
}

impl Default for PreviewStore {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard counting a stream client for as long as it is connected
pub struct ClientGuard {
    id: String,
    store: Arc<PreviewStore>,
    connected_at: Instant,
}

impl ClientGuard {
    pub fn new(id: String, store: Arc<PreviewStore>) -> Self {
        let total = store.clients.fetch_add(1, Ordering::Relaxed) + 1;
        info!("Stream client {} connected (total: {})", id, total);
        Self {
            id,
            store,
            connected_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.store.clients.fetch_sub(1, Ordering::Relaxed);
        info!(
            "Stream client {} disconnected after {:.1}s",
            self.id,
            self.connected_at.elapsed().as_secs_f32()
        );
    }
}

/// Inputs of the last rendered preview
struct Rendered {
    stamp: FrameStamp,
    result: Option<Arc<InferenceResult>>,
}

impl Rendered {
    fn matches(&self, stamp: FrameStamp, result: &Option<Arc<InferenceResult>>) -> bool {
        let same_result = match (&self.result, result) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        self.stamp == stamp && same_result
    }
}

pub struct PreviewEncoder {
    frames: Arc<FrameStore>,
    results: Arc<ResultStore>,
    store: Arc<PreviewStore>,
    overlay: Arc<Overlay>,
    interval: Duration,
    max_width: u32,
    quality: u8,
    encoder: Arc<Mutex<Option<JpegEncoder>>>,
    last: Mutex<Option<Rendered>>,
    error_log: LogThrottler,
}

impl PreviewEncoder {
    pub fn new(
        frames: Arc<FrameStore>,
        results: Arc<ResultStore>,
        store: Arc<PreviewStore>,
        overlay: Overlay,
        config: &PreviewConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            frames,
            results,
            store,
            overlay: Arc::new(overlay),
            interval: config.interval(),
            max_width: config.max_width,
            quality: config.jpeg_quality,
            encoder: Arc::new(Mutex::new(None)),
            last: Mutex::new(None),
            error_log: LogThrottler::with_secs(5),
        })
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            "Preview encoder started ({:?} interval, max width {}, quality {})",
            self.interval, self.max_width, self.quality
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.render_once().await {
                        warn_throttled!(
                            self.error_log,
                            "preview",
                            "Preview encode failed, keeping previous output: {}",
                            e
                        );
                    }
                }
            }
        }
        info!("Preview encoder stopped");
    }

    /// Render and publish one preview; `Ok(false)` if inputs were unchanged
    pub async fn render_once(&self) -> Result<bool, EncodeError> {
        let Some(frame) = self.frames.read_latest() else {
            return Ok(false);
        };
        let result = self.results.latest();
        if self
            .last
            .lock()
            .as_ref()
            .is_some_and(|last| last.matches(frame.stamp, &result))
        {
            return Ok(false);
        }

        let image = frame.image().clone();
        let detections = result
            .as_ref()
            .map(|r| r.detections.clone())
            .unwrap_or_default();
        let overlay = self.overlay.clone();
        let encoder = self.encoder.clone();
        let (max_width, quality) = (self.max_width, self.quality);

        let (jpeg, width, height) = tokio::task::spawn_blocking(move || {
            let mut canvas = image.as_ref().clone();
            overlay.draw(&mut canvas, &detections);
            let canvas = downscale(canvas, max_width);

            let mut guard = encoder.lock();
            if guard.is_none() {
                *guard = Some(JpegEncoder::new(quality)?);
            }
            let encoder = guard
                .as_mut()
                .ok_or_else(|| EncodeError::Init("JPEG encoder unavailable".to_string()))?;
            let jpeg = encoder.encode_rgb(&canvas)?;
            Ok::<_, EncodeError>((jpeg, canvas.width(), canvas.height()))
        })
        .await
        .map_err(|e| EncodeError::Compress(format!("render task failed: {}", e)))??;

        let sequence = self.store.publish(jpeg, width, height, frame.stamp);
        debug!("Preview #{} encoded at {}x{}", sequence, width, height);
        *self.last.lock() = Some(Rendered {
            stamp: frame.stamp,
            result,
        });
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{AnomalyClasses, RawDetection};
    use image::{Rgb, RgbImage};

    fn setup(
        max_width: u32,
    ) -> (
        Arc<FrameStore>,
        Arc<ResultStore>,
        Arc<PreviewStore>,
        Arc<PreviewEncoder>,
    ) {
        let frames = Arc::new(FrameStore::new());
        let results = Arc::new(ResultStore::new());
        let store = Arc::new(PreviewStore::new());
        let config = PreviewConfig {
            max_width,
            ..PreviewConfig::default()
        };
        let encoder = PreviewEncoder::new(
            frames.clone(),
            results.clone(),
            store.clone(),
            Overlay::without_font(),
            &config,
        );
        (frames, results, store, encoder)
    }

    fn jpeg_size(jpeg: &[u8]) -> (usize, usize) {
        let header = turbojpeg::Decompressor::new()
            .unwrap()
            .read_header(jpeg)
            .unwrap();
        (header.width, header.height)
    }

    #[tokio::test]
    async fn test_nothing_rendered_without_frame() {
        let (_frames, _results, store, encoder) = setup(960);
        assert!(!encoder.render_once().await.unwrap());
        assert!(store.latest().is_none());
    }

    #[tokio::test]
    async fn test_renders_downsampled_jpeg() {
        let (frames, _results, store, encoder) = setup(160);
        frames.write(RgbImage::from_pixel(320, 240, Rgb([30, 60, 90])), Instant::now());

        assert!(encoder.render_once().await.unwrap());
        let preview = store.latest().unwrap();
        assert_eq!((preview.width, preview.height), (160, 120));
        assert_eq!(jpeg_size(&preview.jpeg), (160, 120));
        assert_eq!(preview.sequence, 1);
    }

    #[tokio::test]
    async fn test_rerenders_only_on_new_input() {
        let (frames, results, store, encoder) = setup(960);
        let mut updates = store.subscribe();
        frames.write(RgbImage::new(64, 48), Instant::now());

        assert!(encoder.render_once().await.unwrap());
        assert!(updates.try_recv().is_ok());
        // Same frame, same result
        assert!(!encoder.render_once().await.unwrap());

        // New result on the same frame triggers a re-render
        let classes = AnomalyClasses::new(["person"]);
        let detection = classes.classify(RawDetection {
            class_id: 0,
            class_name: "person".to_string(),
            confidence: 0.9,
            bbox: [4.0, 4.0, 40.0, 40.0],
            track_id: None,
        });
        results.publish(InferenceResult::new(0.0, (64, 48), vec![detection], 5.0, 1, 1.0));
        assert!(encoder.render_once().await.unwrap());

        // New frame triggers a re-render
        frames.write(RgbImage::new(64, 48), Instant::now());
        assert!(encoder.render_once().await.unwrap());
        assert_eq!(store.latest().unwrap().sequence, 3);
    }

    #[test]
    fn test_client_guard_counts_connections() {
        let store = Arc::new(PreviewStore::new());
        let a = ClientGuard::new("a".to_string(), store.clone());
        let b = ClientGuard::new("b".to_string(), store.clone());
        assert_eq!(store.client_count(), 2);
        assert_eq!(a.id(), "a");
        drop(a);
        drop(b);
        assert_eq!(store.client_count(), 0);
    }
}
