//! Single-slot busy gate guarding detector invocations

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Non-blocking single-slot gate
///
/// `try_acquire` either takes the only slot or fails immediately. There is
/// no waiting and no queue: a request that finds the gate held is skipped.
#[derive(Debug, Clone, Default)]
pub struct BusyGate {
    busy: Arc<AtomicBool>,
}

impl BusyGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the slot, or `None` if an invocation is already in flight
    pub fn try_acquire(&self) -> Option<BusyGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard {
                busy: self.busy.clone(),
            })
    }

    /// Whether the slot is currently held
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// RAII guard releasing the gate on drop (including on panic unwind)
#[derive(Debug)]
pub struct BusyGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_slot() {
        let gate = BusyGate::new();
        assert!(!gate.is_busy());

        let guard = gate.try_acquire().expect("first acquire");
        assert!(gate.is_busy());
        assert!(gate.try_acquire().is_none());

        // Clones share the slot
        let other = gate.clone();
        assert!(other.try_acquire().is_none());

        drop(guard);
        assert!(!gate.is_busy());
        assert!(other.try_acquire().is_some());
    }

    #[test]
    fn test_contended_acquire_grants_one() {
        let gate = BusyGate::new();
        let winners: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let gate = gate.clone();
                    s.spawn(move || gate.try_acquire().map(std::mem::forget).is_some())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap() as usize).sum()
        });
        assert_eq!(winners, 1);
    }
}
