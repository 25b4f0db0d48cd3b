//! Capture ingest loop
//!
//! One loop per attached video track pulls encoded frames from the
//! transport, decodes them and publishes the result to the frame store.
//! Only one publisher feeds the store at a time: attaching a new track
//! cancels the loop of the previous one.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::{FrameSource, FrameStore, RawFrame, TransportError};
use crate::config::CaptureConfig;
use crate::inference::BusyGate;
use crate::stats::PipelineStats;
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Capture loop tuning
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub read_timeout: Duration,
    pub max_consecutive_errors: u32,
    pub error_backoff: Duration,
    pub drop_frames_while_busy: bool,
}

impl From<&CaptureConfig> for CaptureSettings {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            read_timeout: config.read_timeout(),
            max_consecutive_errors: config.max_consecutive_errors.max(1),
            error_backoff: config.error_backoff(),
            drop_frames_while_busy: config.drop_frames_while_busy,
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self::from(&CaptureConfig::default())
    }
}

/// Why a capture loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureExit {
    /// Session closed or replaced by a newer publisher
    Cancelled,
    /// Track ended
    Closed,
    /// Too many consecutive read failures
    ErrorStreak(u32),
}

struct ActiveCapture {
    session_id: String,
    generation: u64,
    cancel: CancellationToken,
}

pub struct CaptureIngest {
    frames: Arc<FrameStore>,
    stats: Arc<PipelineStats>,
    gate: BusyGate,
    settings: CaptureSettings,
    tracker: TaskTracker,
    active: Mutex<Option<ActiveCapture>>,
    generation: AtomicU64,
    decode_log: LogThrottler,
}

impl CaptureIngest {
    pub fn new(
        frames: Arc<FrameStore>,
        stats: Arc<PipelineStats>,
        gate: BusyGate,
        settings: CaptureSettings,
        tracker: TaskTracker,
    ) -> Arc<Self> {
        Arc::new(Self {
            frames,
            stats,
            gate,
            settings,
            tracker,
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
            decode_log: LogThrottler::with_secs(5),
        })
    }

    /// Start ingesting from `source`, replacing any current publisher
    ///
    /// The loop stops when `cancel` fires, when the track closes or after
    /// a sustained read error streak.
    pub fn attach(
        self: &Arc<Self>,
        session_id: &str,
        source: Box<dyn FrameSource>,
        cancel: CancellationToken,
    ) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self.active.lock().replace(ActiveCapture {
            session_id: session_id.to_string(),
            generation,
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            info!(
                "Session {} replaces session {} as the video publisher",
                session_id, previous.session_id
            );
            previous.cancel.cancel();
        }

        info!("Capture attached for session {}: {}", session_id, source.describe());
        self.stats.set_stream_attached(true);

        let this = self.clone();
        let session_id = session_id.to_string();
        self.tracker.spawn(async move {
            let exit = this.run_capture(&session_id, source, cancel).await;
            match exit {
                CaptureExit::ErrorStreak(n) => {
                    error!("Capture for session {} stopped after {} consecutive errors", session_id, n)
                }
                other => info!("Capture for session {} ended: {:?}", session_id, other),
            }
            this.release(&session_id, generation);
        });
    }

    /// Stop the capture loop if it belongs to `session_id`
    pub fn detach(&self, session_id: &str) {
        let active = self.active.lock();
        if let Some(active) = active.as_ref().filter(|a| a.session_id == session_id) {
            active.cancel.cancel();
        }
    }

    /// Session currently feeding the frame store
    pub fn active_session(&self) -> Option<String> {
        self.active.lock().as_ref().map(|a| a.session_id.clone())
    }

    /// Cancel the active loop and wait for every loop task to exit
    pub async fn shutdown(&self) {
        if let Some(active) = self.active.lock().as_ref() {
            active.cancel.cancel();
        }
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn release(&self, session_id: &str, generation: u64) {
        self.decode_log.clear(session_id);
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|a| a.generation == generation) {
            *active = None;
            self.stats.set_stream_attached(false);
        }
    }

    async fn run_capture(
        &self,
        session_id: &str,
        mut source: Box<dyn FrameSource>,
        cancel: CancellationToken,
    ) -> CaptureExit {
        let settings = &self.settings;
        let mut timeouts: u32 = 0;
        let mut errors: u32 = 0;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return CaptureExit::Cancelled,
                next = tokio::time::timeout(settings.read_timeout, source.recv()) => next,
            };

            let raw = match next {
                Ok(Ok(raw)) => raw,
                Err(_) | Ok(Err(TransportError::Timeout)) => {
                    timeouts += 1;
                    if timeouts == 3 || timeouts % 10 == 0 {
                        warn!(
                            "No frame from session {} for {} consecutive reads",
                            session_id, timeouts
                        );
                    }
                    continue;
                }
                Ok(Err(TransportError::Closed)) => return CaptureExit::Closed,
                Ok(Err(e)) => {
                    errors += 1;
                    warn!(
                        "Frame read error on session {} ({}/{}): {}",
                        session_id, errors, settings.max_consecutive_errors, e
                    );
                    if errors >= settings.max_consecutive_errors {
                        return CaptureExit::ErrorStreak(errors);
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return CaptureExit::Cancelled,
                        _ = tokio::time::sleep(settings.error_backoff) => {}
                    }
                    continue;
                }
            };

            if timeouts >= 3 {
                debug!("Frames resumed on session {}", session_id);
            }
            timeouts = 0;
            errors = 0;

            self.ingest(session_id, source.as_mut(), &raw);
        }
    }

    fn ingest(&self, session_id: &str, source: &mut dyn FrameSource, raw: &RawFrame) {
        let decoded = match Handle::current().runtime_flavor() {
            RuntimeFlavor::MultiThread => tokio::task::block_in_place(|| source.decode(raw)),
            _ => source.decode(raw),
        };

        // The decoder sees every access unit so inter-coded frames keep their
        // references; only the store write is skipped while the detector runs
        match decoded {
            Ok(Some(_)) if self.settings.drop_frames_while_busy && self.gate.is_busy() => {
                self.stats.record_dropped();
            }
            Ok(Some(image)) => {
                self.frames.write(image, raw.received_at);
                self.stats.record_captured();
            }
            Ok(None) => {}
            Err(e) => {
                warn_throttled!(
                    self.decode_log,
                    session_id,
                    "Dropping undecodable frame on session {}: {}",
                    session_id,
                    e
                );
            }
        }
    }
}
