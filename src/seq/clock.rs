//! Time sources for the sequencer's ready-waits

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Something that can tell the time and wait
pub trait Clock {
    /// Time elapsed since an arbitrary, fixed origin
    fn now(&self) -> Duration;

    /// Wait for (at least) `duration`
    fn pause(&self, duration: Duration);
}

/// The wall clock
#[derive(Debug, Copy, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn pause(&self, duration: Duration) {
        if duration.is_zero() {
            std::thread::yield_now();
        } else {
            std::thread::sleep(duration);
        }
    }
}

/// A clock that only moves when paused (or told to), so timeouts are deterministic in tests
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward without waiting
    pub fn advance(&self, duration: Duration) {
        self.nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Relaxed))
    }

    fn pause(&self, duration: Duration) {
        // A zero-length pause still has to make progress, or a hung device would never time out.
        self.advance(duration.max(Duration::from_micros(1)));
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Duration {
        (**self).now()
    }

    fn pause(&self, duration: Duration) {
        (**self).pause(duration)
    }
}

impl<C: Clock + ?Sized> Clock for Box<C> {
    fn now(&self) -> Duration {
        (**self).now()
    }

    fn pause(&self, duration: Duration) {
        (**self).pause(duration)
    }
}

#[test]
fn test_manual_clock() {
    let clock = ManualClock::new();
    assert_eq!(clock.now(), Duration::ZERO);

    clock.pause(Duration::from_millis(3));
    clock.advance(Duration::from_millis(2));
    assert_eq!(clock.now(), Duration::from_millis(5));

    clock.pause(Duration::ZERO);
    assert!(clock.now() > Duration::from_millis(5));
}
