//! Latest-frame slot shared between capture and its consumers

use arc_swap::ArcSwapOption;
use image::RgbImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Ordering key of a stored frame
///
/// Compares by capture instant first; the store-assigned sequence breaks
/// ties on platforms with a coarse monotonic clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameStamp {
    pub captured_at: Instant,
    pub sequence: u64,
}

/// A decoded video frame with metadata
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded RGB24 pixels (shared, never mutated after the write)
    image: Arc<RgbImage>,
    /// Monotonic capture instant and sequence
    pub stamp: FrameStamp,
    /// Wall-clock capture time as Unix seconds
    pub timestamp: f64,
}

impl Frame {
    /// Get the decoded image
    pub fn image(&self) -> &Arc<RgbImage> {
        &self.image
    }

    /// Get width
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Get height
    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Single-slot store holding the most recent frame
///
/// Writes swap an `Arc` atomically, so a writer never waits for readers
/// and readers observe either the previous or the new frame.
pub struct FrameStore {
    slot: ArcSwapOption<Frame>,
    sequence: AtomicU64,
}

impl FrameStore {
    pub fn new() -> Self {
        Self {
            slot: ArcSwapOption::const_empty(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Replace the stored frame unconditionally
    pub fn write(&self, image: RgbImage, captured_at: Instant) -> FrameStamp {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let stamp = FrameStamp {
            captured_at,
            sequence,
        };
        let frame = Frame {
            image: Arc::new(image),
            stamp,
            timestamp: unix_timestamp(),
        };
        self.slot.store(Some(Arc::new(frame)));
        stamp
    }

    /// Latest frame, or `None` while nothing has been captured yet
    pub fn read_latest(&self) -> Option<Arc<Frame>> {
        self.slot.load_full()
    }

    /// Number of frames written since startup
    pub fn frames_written(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Current wall-clock time as fractional Unix seconds
pub fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid(width: u32, height: u32, value: u8) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb([value, value, value]))
    }

    #[test]
    fn test_empty_store_is_not_ready() {
        let store = FrameStore::new();
        assert!(store.read_latest().is_none());
        assert_eq!(store.frames_written(), 0);
    }

    #[test]
    fn test_read_returns_most_recent_write() {
        let store = FrameStore::new();

        for value in 0..10u8 {
            let stamp = store.write(solid(4, 2, value), Instant::now());
            let latest = store.read_latest().unwrap();
            assert_eq!(latest.stamp, stamp);
            assert_eq!(latest.image().get_pixel(0, 0)[0], value);
            assert_eq!((latest.width(), latest.height()), (4, 2));
        }

        assert_eq!(store.frames_written(), 10);
    }

    #[test]
    fn test_stamps_are_strictly_increasing() {
        let store = FrameStore::new();
        let now = Instant::now();

        // Same instant twice: sequence still orders them
        let a = store.write(solid(1, 1, 0), now);
        let b = store.write(solid(1, 1, 1), now);
        assert!(b > a);
    }

    #[test]
    fn test_reader_keeps_old_frame_after_overwrite() {
        let store = FrameStore::new();
        store.write(solid(2, 2, 10), Instant::now());
        let held = store.read_latest().unwrap();

        store.write(solid(2, 2, 20), Instant::now());

        assert_eq!(held.image().get_pixel(0, 0)[0], 10);
        assert_eq!(store.read_latest().unwrap().image().get_pixel(0, 0)[0], 20);
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        let store = Arc::new(FrameStore::new());
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..500u32 {
                    store.write(solid(3, 3, (i % 251) as u8), Instant::now());
                }
            })
        };

        let mut last_seen = 0;
        for _ in 0..500 {
            if let Some(frame) = store.read_latest() {
                // Every observed frame is complete and never goes backwards
                assert_eq!(frame.image().as_raw().len(), 27);
                assert!(frame.stamp.sequence >= last_seen);
                last_seen = frame.stamp.sequence;
            }
        }

        writer.join().unwrap();
        assert_eq!(store.read_latest().unwrap().stamp.sequence, 500);
    }
}
