//! Throughput metrics for capture and inference

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Rolling window rate meter
///
/// Counts events in the current window; once the window has elapsed the
/// rate is computed as `count / elapsed` and the count starts over. This
/// reports current throughput rather than a lifetime average.
#[derive(Debug)]
pub struct RateMeter {
    inner: Mutex<RateWindow>,
    window: Duration,
}

#[derive(Debug)]
struct RateWindow {
    count: u64,
    started: Instant,
    rate: f64,
}

impl RateWindow {
    fn roll(&mut self, now: Instant, window: Duration) {
        let elapsed = now.duration_since(self.started);
        if elapsed >= window * 2 {
            // Idle for at least a full window; the old count belongs to neither
            self.rate = 0.0;
            self.count = 0;
            self.started = now;
        } else if elapsed >= window {
            self.rate = self.count as f64 / elapsed.as_secs_f64();
            self.count = 0;
            self.started = now;
        }
    }
}

impl RateMeter {
    /// Create a meter with a 1-second window
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(1))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            inner: Mutex::new(RateWindow {
                count: 0,
                started: Instant::now(),
                rate: 0.0,
            }),
            window,
        }
    }

    /// Record one event
    pub fn tick(&self) {
        self.tick_at(Instant::now());
    }

    fn tick_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        inner.count += 1;
        inner.roll(now, self.window);
    }

    /// Events per second over the last completed window
    pub fn rate(&self) -> f64 {
        self.rate_at(Instant::now())
    }

    fn rate_at(&self, now: Instant) -> f64 {
        let mut inner = self.inner.lock();
        // Reading also closes an expired window so an idle stream decays to 0
        inner.roll(now, self.window);
        inner.rate
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Pipeline-wide counters read by the query surface
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub capture: RateMeter,
    pub inference: RateMeter,
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    last_latency_us: AtomicU64,
    stream_attached: AtomicBool,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A frame was decoded and stored
    pub fn record_captured(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
        self.capture.tick();
    }

    /// A frame was discarded because the consumer was busy
    pub fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// A detector invocation finished with a result
    pub fn record_inference(&self, latency: Duration) {
        self.last_latency_us
            .store(latency.as_micros() as u64, Ordering::Relaxed);
        self.inference.tick();
    }

    pub fn set_stream_attached(&self, attached: bool) {
        self.stream_attached.store(attached, Ordering::SeqCst);
    }

    pub fn stream_attached(&self) -> bool {
        self.stream_attached.load(Ordering::SeqCst)
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn last_latency_ms(&self) -> f64 {
        self.last_latency_us.load(Ordering::Relaxed) as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_within_first_window_is_zero() {
        let meter = RateMeter::new();
        meter.tick();
        meter.tick();
        assert_eq!(meter.rate(), 0.0);
    }

    #[test]
    fn test_rate_after_window() {
        let meter = RateMeter::with_window(Duration::from_secs(1));
        let start = meter.inner.lock().started;

        for i in 1..=10 {
            meter.tick_at(start + Duration::from_millis(i * 50));
        }
        // Eleventh tick lands after the window boundary and closes it
        meter.tick_at(start + Duration::from_millis(1000));

        let rate = meter.rate_at(start + Duration::from_millis(1100));
        assert!((rate - 11.0).abs() < 1e-9, "rate was {}", rate);
    }

    #[test]
    fn test_rate_decays_when_idle() {
        let meter = RateMeter::with_window(Duration::from_secs(1));
        let start = meter.inner.lock().started;

        meter.tick_at(start + Duration::from_millis(100));
        meter.tick_at(start + Duration::from_millis(1000));
        assert!(meter.rate_at(start + Duration::from_millis(1000)) > 0.0);

        // Nothing in the following window
        assert_eq!(meter.rate_at(start + Duration::from_millis(2500)), 0.0);
    }

    #[test]
    fn test_rate_after_long_gap_is_zero() {
        let meter = RateMeter::with_window(Duration::from_secs(1));
        let start = meter.inner.lock().started;

        meter.tick_at(start + Duration::from_millis(100));
        meter.tick_at(start + Duration::from_millis(900));

        // An unclosed window read long afterwards is not spread over the gap
        assert_eq!(meter.rate_at(start + Duration::from_secs(10)), 0.0);
    }

    #[test]
    fn test_pipeline_counters() {
        let stats = PipelineStats::new();
        stats.record_captured();
        stats.record_captured();
        stats.record_dropped();
        stats.record_inference(Duration::from_micros(12_500));

        assert_eq!(stats.frames_captured(), 2);
        assert_eq!(stats.frames_dropped(), 1);
        assert!((stats.last_latency_ms() - 12.5).abs() < 1e-9);
        assert!(!stats.stream_attached());
    }
}
