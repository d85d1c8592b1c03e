//! Time utilities.
//!
//! Lease expirations are absolute wall-clock timestamps derived from the
//! remaining TTL reported by the store at read time. The clock is injectable
//! so the in-memory store and the registry can share a manually advanced
//! time source in tests.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A point in time in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tick {
    /// Milliseconds since the Unix epoch.
    pub ms: u64,
}

impl Tick {
    /// Create a new tick with the given millisecond value.
    pub const fn new(ms: u64) -> Self {
        Self { ms }
    }

    /// Create a tick representing the epoch.
    pub const fn zero() -> Self {
        Self { ms: 0 }
    }

    /// Add milliseconds to this tick.
    pub const fn add_ms(self, ms: u64) -> Self {
        Self {
            ms: self.ms.saturating_add(ms),
        }
    }

    /// Add whole seconds to this tick.
    pub const fn add_secs(self, secs: u64) -> Self {
        self.add_ms(secs.saturating_mul(1000))
    }

    /// Check if this tick is at or after the given deadline.
    pub const fn is_at_or_after(self, deadline: Tick) -> bool {
        self.ms >= deadline.ms
    }

    /// Milliseconds until a deadline.
    ///
    /// Returns 0 if the deadline has already passed.
    pub fn ms_until(self, deadline: Tick) -> u64 {
        deadline.ms.saturating_sub(self.ms)
    }

    /// Convert to a UTC timestamp.
    pub fn to_datetime(self) -> DateTime<Utc> {
        i64::try_from(self.ms)
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl std::fmt::Display for Tick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tick({}ms)", self.ms)
    }
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> Tick;

    /// Current time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        self.now().to_datetime()
    }
}

/// Wall-clock time source.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Tick {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Tick::new(now)
    }
}

/// Manually advanced time source.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Tick>,
}

impl ManualClock {
    /// Create a clock frozen at the given tick.
    pub fn new(start: Tick) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Create a clock frozen at the current wall-clock time.
    pub fn starting_now() -> Self {
        Self::new(SystemClock.now())
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = now.add_ms(by.as_millis() as u64);
    }

    /// Jump to an absolute tick. Ticks never move backwards.
    pub fn set(&self, tick: Tick) {
        let mut now = self.now.lock();
        if tick > *now {
            *now = tick;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Tick {
        *self.now.lock()
    }
}

/// Absolute expiration for a lease with `ttl_seconds` remaining at `now`.
///
/// Negative TTLs are treated as already expired.
pub fn expiration_from_ttl(now: Tick, ttl_seconds: i64) -> DateTime<Utc> {
    now.add_secs(ttl_seconds.max(0) as u64).to_datetime()
}

/// Whole seconds remaining until `deadline`, rounded up.
///
/// A lease with any time left reports at least one second, matching the
/// store's lease introspection.
pub fn remaining_seconds(now: Tick, deadline: Tick) -> i64 {
    let ms = now.ms_until(deadline);
    ms.div_ceil(1000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_arithmetic() {
        let t = Tick::new(1_000);
        assert_eq!(t.add_secs(2), Tick::new(3_000));
        assert_eq!(t.ms_until(Tick::new(500)), 0);
        assert!(Tick::new(3_000).is_at_or_after(t.add_secs(2)));
    }

    #[test]
    fn test_manual_clock_never_goes_back() {
        let clock = ManualClock::new(Tick::new(10_000));
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), Tick::new(15_000));
        clock.set(Tick::new(1_000));
        assert_eq!(clock.now(), Tick::new(15_000));
    }

    #[test]
    fn test_expiration_from_ttl() {
        let now = Tick::new(1_700_000_000_000);
        let exp = expiration_from_ttl(now, 100);
        assert_eq!(exp.timestamp_millis(), 1_700_000_100_000);

        let expired = expiration_from_ttl(now, -1);
        assert_eq!(expired, now.to_datetime());
    }

    #[test]
    fn test_huge_ttl_saturates_to_far_future() {
        let now = Tick::new(1_700_000_000_000);
        let exp = expiration_from_ttl(now, i64::MAX);
        assert_eq!(exp, DateTime::<Utc>::MAX_UTC);
        assert_eq!(Tick::new(u64::MAX).to_datetime(), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_remaining_seconds_rounds_up() {
        let now = Tick::new(0);
        assert_eq!(remaining_seconds(now, Tick::new(100_000)), 100);
        assert_eq!(remaining_seconds(now, Tick::new(1)), 1);
        assert_eq!(remaining_seconds(Tick::new(5), Tick::new(1)), 0);
    }
}
