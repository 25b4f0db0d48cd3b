use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ConfigStore;
use crate::inference::{BusyGate, ResultStore};
use crate::stats::PipelineStats;
use crate::stream::PreviewStore;
use crate::video::{CaptureIngest, CaptureSettings, FrameStore};
use crate::webrtc::{PeerTransport, SessionRegistry};

/// Application-wide state shared across handlers
///
/// The stores are written by exactly one background component each:
/// - `frames` by the capture loop of the active session
/// - `results` by the inference scheduler
/// - `preview` by the preview encoder
///
/// Handlers only read them.
pub struct AppState {
    /// Configuration store
    pub config: ConfigStore,
    /// Latest decoded frame
    pub frames: Arc<FrameStore>,
    /// Latest inference result
    pub results: Arc<ResultStore>,
    /// Latest annotated preview JPEG
    pub preview: Arc<PreviewStore>,
    /// Pipeline counters
    pub stats: Arc<PipelineStats>,
    /// Held while a detector invocation is in flight
    pub gate: BusyGate,
    /// Capture loop owner
    pub ingest: Arc<CaptureIngest>,
    /// WHIP sessions
    pub sessions: Arc<SessionRegistry>,
    /// Cancelled once on shutdown
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Create new application state
    pub fn new(config: ConfigStore, transport: Arc<dyn PeerTransport>) -> Arc<Self> {
        let current = config.get();
        let frames = Arc::new(FrameStore::new());
        let stats = Arc::new(PipelineStats::new());
        let gate = BusyGate::new();
        let ingest = CaptureIngest::new(
            frames.clone(),
            stats.clone(),
            gate.clone(),
            CaptureSettings::from(&current.capture),
            TaskTracker::new(),
        );
        let sessions = SessionRegistry::new(transport, ingest.clone());

        Arc::new(Self {
            config,
            frames,
            results: Arc::new(ResultStore::new()),
            preview: Arc::new(PreviewStore::new()),
            stats,
            gate,
            ingest,
            sessions,
            shutdown: CancellationToken::new(),
        })
    }
}
