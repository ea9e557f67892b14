use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A point on a monotonic millisecond timeline.
///
/// The origin is whatever the owning [`Clock`] decides (process start for
/// [`SystemClock`], zero for [`ManualClock`]). Only differences are meaningful.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(pub u64); // milliseconds

impl Time {
    pub const ZERO: Time = Time(0);

    pub fn from_millis(ms: u64) -> Self {
        Time(ms)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    pub fn saturating_add(self, d: Duration) -> Self {
        Time(self.0.saturating_add(duration_millis(d)))
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn saturating_duration_since(self, earlier: Time) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Source of "now" for TTL checks and retry windows.
pub trait Clock: Send + Sync {
    fn now(&self) -> Time;
}

/// Wall-clock backed monotonic clock.
#[derive(Debug, Clone, Copy)]
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
    fn now(&self) -> Time {
        Time(duration_millis(self.origin.elapsed()))
    }
}

/// Manually driven clock for deterministic tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(t: Time) -> Self {
        Self {
            now_ms: AtomicU64::new(t.0),
        }
    }

    pub fn set(&self, t: Time) {
        self.now_ms.store(t.0, Ordering::SeqCst);
    }

    pub fn advance(&self, d: Duration) {
        self.now_ms.fetch_add(duration_millis(d), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Time {
        Time(self.now_ms.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::{Clock, ManualClock, SystemClock, Time};
    use std::time::Duration;

    #[test]
    fn manual_clock_advances_only_when_told() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), Time::ZERO);
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now(), Time(1500));
        clock.set(Time(10));
        assert_eq!(clock.now(), Time(10));
    }

    #[test]
    fn duration_since_saturates() {
        let a = Time(100);
        let b = Time(250);
        assert_eq!(b.saturating_duration_since(a), Duration::from_millis(150));
        assert_eq!(a.saturating_duration_since(b), Duration::ZERO);
        assert_eq!(a.saturating_add(Duration::from_secs(1)), Time(1100));
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
