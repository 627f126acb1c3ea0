//! Monotonic time source used for timestamp extrapolation and pause sleeps

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Nanosecond clock shared by the sink and its device
pub trait Clock: Send + Sync {
    /// Monotonic nanoseconds since an arbitrary fixed origin
    fn now_nanos(&self) -> u64;

    /// Block the calling thread for `duration`
    fn sleep(&self, duration: Duration);
}

/// Shared handle to a clock
pub type SharedClock = Arc<dyn Clock>;

fn process_origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

/// Nanoseconds on the process-wide monotonic clock
pub fn monotonic_nanos() -> u64 {
    process_origin().elapsed().as_nanos() as u64
}

/// Wall clock backed by [`Instant`]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> u64 {
        monotonic_nanos()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Clock that only moves when told to.
///
/// `sleep` advances the clock instead of blocking, so code that sleeps on
/// the session clock runs instantly in tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new(start_nanos: u64) -> Self {
        Self {
            nanos: AtomicU64::new(start_nanos),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_sleep_advances() {
        let clock = ManualClock::new(1_000);
        clock.sleep(Duration::from_millis(5));
        assert_eq!(clock.now_nanos(), 1_000 + 5_000_000);

        clock.set(42);
        assert_eq!(clock.now_nanos(), 42);
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock;
        let a = clock.now_nanos();
        let b = clock.now_nanos();
        assert!(b >= a);
    }
}
