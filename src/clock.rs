//! Clock abstractions used by the rate accounting engine.

use chrono::Timelike;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock instant with microsecond resolution (microseconds since the Unix epoch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Milliseconds elapsed since `earlier`, as a float. Saturates at zero when the
    /// wall clock stepped backwards.
    pub fn millis_since(self, earlier: Timestamp) -> f64 {
        self.0.saturating_sub(earlier.0) as f64 / 1000.0
    }
}

/// Clock abstraction so timing and hour selection can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current wall-clock time.
    fn now(&self) -> Timestamp;

    /// Current local hour of day in `0..24`.
    fn local_hour(&self) -> usize;
}

/// Clock backed by the system wall clock and the local timezone.
///
/// Notes: wall-clock based, so NTP steps can move it backwards; elapsed time is
/// saturated at zero by [`Timestamp::millis_since`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let micros = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_micros();
        Timestamp(u64::try_from(micros).unwrap_or(u64::MAX))
    }

    fn local_hour(&self) -> usize {
        chrono::Local::now().hour() as usize
    }
}

/// Manually advanced clock. Clones share the same time and hour.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_micros: Arc<AtomicU64>,
    hour: Arc<AtomicUsize>,
}

impl ManualClock {
    /// Clock at the epoch, hour 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock at the epoch, pinned to `hour` (taken modulo 24).
    pub fn at_hour(hour: usize) -> Self {
        let clock = Self::new();
        clock.set_hour(hour);
        clock
    }

    pub fn advance(&self, by: Duration) {
        let micros = u64::try_from(by.as_micros()).unwrap_or(u64::MAX);
        self.now_micros.fetch_add(micros, Ordering::SeqCst);
    }

    pub fn set_hour(&self, hour: usize) {
        self.hour.store(hour % 24, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.now_micros.load(Ordering::SeqCst))
    }

    fn local_hour(&self) -> usize {
        self.hour.load(Ordering::SeqCst)
    }
}
