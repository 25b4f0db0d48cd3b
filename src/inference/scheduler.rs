//! Rate-bounded, non-reentrant inference scheduler
//!
//! The scheduler polls the frame store on a short fixed cadence and starts
//! a detector invocation only when all of the following hold:
//!
//! - the busy gate is free (no invocation in flight)
//! - at least `min_interval` has passed since the previous invocation started
//! - the frame store holds a frame newer than the last one handed out
//!
//! Anything else is a no-op tick. There is no queue: a frame that arrives
//! while the detector is busy is simply superseded by later frames.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::snapshot::write_snapshot;
use super::{AnomalyClasses, BusyGate, BusyGuard, Detector, InferenceResult, ResultStore};
use crate::config::InferenceConfig;
use crate::stats::PipelineStats;
use crate::video::{Frame, FrameStamp, FrameStore};

/// Timing and output settings for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub min_interval: Duration,
    pub snapshot_path: Option<PathBuf>,
}

impl SchedulerSettings {
    /// Build settings, resolving a relative snapshot path against `data_dir`
    pub fn from_config(config: &InferenceConfig, data_dir: &Path) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            min_interval: config.min_interval(),
            snapshot_path: config.snapshot_path.as_ref().map(|p| {
                if p.is_absolute() {
                    p.clone()
                } else {
                    data_dir.join(p)
                }
            }),
        }
    }
}

#[derive(Debug, Default)]
struct Progress {
    last_invoked: Option<Instant>,
    last_stamp: Option<FrameStamp>,
    first_completed: Option<Instant>,
}

pub struct InferenceScheduler {
    frames: Arc<FrameStore>,
    results: Arc<ResultStore>,
    stats: Arc<PipelineStats>,
    gate: BusyGate,
    detector: Arc<dyn Detector>,
    classes: AnomalyClasses,
    settings: SchedulerSettings,
    progress: Mutex<Progress>,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl InferenceScheduler {
    pub fn new(
        frames: Arc<FrameStore>,
        results: Arc<ResultStore>,
        stats: Arc<PipelineStats>,
        gate: BusyGate,
        detector: Arc<dyn Detector>,
        classes: AnomalyClasses,
        settings: SchedulerSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            frames,
            results,
            stats,
            gate,
            detector,
            classes,
            settings,
            progress: Mutex::new(Progress::default()),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    /// Number of invocations that produced a result
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Number of invocations that failed
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Poll until cancelled, then wait for an in-flight invocation to finish
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            "Inference scheduler started (detector: {}, poll: {:?}, min interval: {:?})",
            self.detector.name(),
            self.settings.poll_interval,
            self.settings.min_interval
        );

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(handle) = self.try_dispatch() {
                        in_flight = Some(handle);
                    }
                }
            }
        }

        if let Some(handle) = in_flight.filter(|h| !h.is_finished()) {
            debug!("Waiting for in-flight inference to finish");
            let _ = handle.await;
        }
        info!(
            "Inference scheduler stopped ({} completed, {} failed)",
            self.completed(),
            self.failed()
        );
    }

    /// One scheduling decision; returns the spawned invocation, if any
    fn try_dispatch(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.gate.is_busy() {
            return None;
        }

        let now = Instant::now();
        let mut progress = self.progress.lock();
        if let Some(last) = progress.last_invoked {
            if now.duration_since(last) < self.settings.min_interval {
                return None;
            }
        }

        let frame = self.frames.read_latest()?;
        if progress.last_stamp.is_some_and(|seen| frame.stamp <= seen) {
            return None;
        }

        let guard = self.gate.try_acquire()?;
        progress.last_invoked = Some(now);
        // A failed invocation still consumes the frame
        progress.last_stamp = Some(frame.stamp);
        drop(progress);

        let this = self.clone();
        Some(tokio::spawn(async move { this.invoke(frame, guard).await }))
    }

    async fn invoke(self: Arc<Self>, frame: Arc<Frame>, guard: BusyGuard) {
        let Some(result) = self.infer(frame, guard).await else {
            return;
        };

        if let Some(path) = &self.settings.snapshot_path {
            if let Err(e) = write_snapshot(path, &result).await {
                debug!("Failed to write detection snapshot {}: {}", path.display(), e);
            }
        }
    }

    /// Run the detector and publish its result; the gate is released on return
    async fn infer(&self, frame: Arc<Frame>, guard: BusyGuard) -> Option<Arc<InferenceResult>> {
        let started = Instant::now();
        let outcome = self.detector.detect(frame.image().clone()).await;
        let latency = started.elapsed();

        let raw = match outcome {
            Ok(raw) => raw,
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Inference failed, skipping cycle: {}", e);
                return None;
            }
        };

        let detections = raw.into_iter().map(|d| self.classes.classify(d)).collect();
        let count = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        let fps = {
            let mut progress = self.progress.lock();
            let first = *progress.first_completed.get_or_insert(started);
            let elapsed = first.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                count as f64 / elapsed
            } else {
                0.0
            }
        };

        let result = InferenceResult::new(
            frame.timestamp,
            (frame.width(), frame.height()),
            detections,
            latency.as_secs_f64() * 1000.0,
            count,
            fps,
        );

        if result.has_anomaly {
            info!(
                "Anomaly detected: {} ({} of {} detections)",
                result.anomaly_labels().join(", "),
                result.anomaly_count,
                result.num_detections
            );
        } else {
            debug!(
                "Inference #{} done in {:.1}ms: {} detections",
                count, result.inference_time_ms, result.num_detections
            );
        }

        let result = self.results.publish(result);
        self.stats.record_inference(latency);
        drop(guard);
        Some(result)
    }
}
