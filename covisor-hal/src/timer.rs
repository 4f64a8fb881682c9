//! Timer abstraction for dispatch deadlines and bounded hardware waits

use core::sync::atomic::{AtomicU64, Ordering};

/// Minimal clock interface the core needs: a monotonic nanosecond timestamp
/// and a short busy wait. Arming of the per-coprocessor dispatch deadline is
/// handled inside the scheduler runtime record; the platform only has to
/// call the tick entry points with `current_time_ns()`.
pub trait Timer: Send + Sync {
    /// Current timestamp in nanoseconds.
    fn current_time_ns(&self) -> u64;

    /// Busy wait for the given duration (precise, non-blocking).
    fn busy_wait_ns(&self, duration_ns: u64);
}

/// A manually advanced clock.
///
/// Platforms without a calibrated hardware timer early in boot use this as a
/// stand-in; the test suites drive it to make dispatch deterministic.
#[derive(Debug, Default)]
pub struct ManualTimer {
    now_ns: AtomicU64,
}

impl ManualTimer {
    pub const fn new() -> Self {
        ManualTimer { now_ns: AtomicU64::new(0) }
    }

    /// Move the clock forward.
    pub fn advance_ns(&self, delta_ns: u64) {
        self.now_ns.fetch_add(delta_ns, Ordering::Relaxed);
    }
}

impl Timer for ManualTimer {
    fn current_time_ns(&self) -> u64 {
        self.now_ns.load(Ordering::Relaxed)
    }

    fn busy_wait_ns(&self, duration_ns: u64) {
        // Waiting on a manual clock is simply advancing it.
        self.advance_ns(duration_ns);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_timer_advances() {
        let t = ManualTimer::new();
        assert_eq!(t.current_time_ns(), 0);
        t.advance_ns(1_000);
        t.busy_wait_ns(500);
        assert_eq!(t.current_time_ns(), 1_500);
    }
}
