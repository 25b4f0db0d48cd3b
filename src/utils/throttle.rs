//! Log throttling utility
//!
//! Limits how often the same log message is recorded so a broken stream
//! (e.g. a decoder failing on every frame) cannot flood the log.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Per-key log throttler that counts what it suppresses
pub struct LogThrottler {
    keys: Mutex<HashMap<String, KeyState>>,
    interval: Duration,
}

struct KeyState {
    last_logged: Instant,
    suppressed: u64,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Check whether a message for `key` should be logged now
    ///
    /// Returns `Some(n)` with the number of messages suppressed since the
    /// last one that was logged, or `None` if this one is throttled.
    pub fn should_log(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut keys = self.keys.lock();
        match keys.get_mut(key) {
            Some(state) if now.duration_since(state.last_logged) < self.interval => {
                state.suppressed += 1;
                None
            }
            Some(state) => {
                let suppressed = std::mem::take(&mut state.suppressed);
                state.last_logged = now;
                Some(suppressed)
            }
            None => {
                keys.insert(
                    key.to_string(),
                    KeyState {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Forget a key so its next occurrence is logged immediately
    pub fn clear(&self, key: &str) {
        self.keys.lock().remove(key);
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `warn!`, appending the suppressed count when non-zero
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.should_log($key) {
            if suppressed > 0 {
                tracing::warn!("{} (suppressed {} repeats)", format!($($arg)*), suppressed);
            } else {
                tracing::warn!($($arg)*);
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_call_logs() {
        let throttler = LogThrottler::with_secs(1);
        assert_eq!(throttler.should_log("decode"), Some(0));
    }

    #[test]
    fn test_suppressed_count_reported() {
        let throttler = LogThrottler::new(Duration::from_millis(50));
        assert_eq!(throttler.should_log("decode"), Some(0));
        assert_eq!(throttler.should_log("decode"), None);
        assert_eq!(throttler.should_log("decode"), None);

        std::thread::sleep(Duration::from_millis(70));
        assert_eq!(throttler.should_log("decode"), Some(2));
    }

    #[test]
    fn test_keys_are_independent() {
        let throttler = LogThrottler::with_secs(10);
        assert!(throttler.should_log("a").is_some());
        assert!(throttler.should_log("b").is_some());
        assert!(throttler.should_log("a").is_none());

        throttler.clear("a");
        assert!(throttler.should_log("a").is_some());
    }
}
