//! Clock abstraction for testability.
//!
//! Production code reads wall-clock timestamps and monotonic instants through
//! a `Clock` trait so that tests can substitute a controllable implementation
//! and drive retention/debounce logic deterministically.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Abstraction over time-related reads.
///
/// `now_utc` feeds wire-visible timestamps (job records, change events);
/// `instant` feeds duration and retention arithmetic. The instant side is
/// tokio's clock, so tests running under a paused runtime control it with
/// `tokio::time::advance`.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current wall-clock time.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Current monotonic instant.
    fn instant(&self) -> Instant;
}

/// Type alias for shared clock.
pub type SharedClock = Arc<dyn Clock>;

/// Production implementation using the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new SystemClock.
    pub fn new() -> Self {
        Self
    }

    /// Create a shared SystemClock.
    pub fn shared() -> SharedClock {
        Arc::new(Self)
    }
}

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

/// Test implementation with controllable wall-clock time.
///
/// Wall time starts at a fixed epoch and only moves when `advance` is called,
/// so timestamp assertions are exact. Instants still come from tokio's clock,
/// which a paused test runtime advances in lockstep with `tokio::time::advance`.
#[derive(Debug)]
pub struct TestClock {
    /// Base wall-clock time.
    base: DateTime<Utc>,
    /// Logical milliseconds advanced past the base.
    offset_ms: AtomicU64,
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TestClock {
    /// Create a new TestClock pinned to a fixed base time.
    pub fn new() -> Self {
        Self {
            base: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            offset_ms: AtomicU64::new(0),
        }
    }

    /// Create a shared TestClock.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Advance logical wall time by the given duration.
    pub fn advance(&self, duration: Duration) {
        self.offset_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    /// Logical time elapsed since the base.
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }
}

impl Clock for TestClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.base + chrono::Duration::milliseconds(self.offset_ms.load(Ordering::SeqCst) as i64)
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_starts_at_base() {
        let clock = TestClock::new();
        assert_eq!(clock.elapsed(), Duration::ZERO);
        assert_eq!(clock.now_utc(), clock.base);
    }

    #[test]
    fn test_clock_advance_moves_wall_time() {
        let clock = TestClock::new();
        let before = clock.now_utc();

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.elapsed(), Duration::from_secs(90));
        assert_eq!(clock.now_utc() - before, chrono::Duration::seconds(90));
    }

    #[test]
    fn test_clock_thread_safe() {
        use std::thread;

        let clock = Arc::new(TestClock::new());
        let clock_clone = clock.clone();

        let handle = thread::spawn(move || {
            for _ in 0..100 {
                clock_clone.advance(Duration::from_millis(1));
            }
        });

        for _ in 0..100 {
            clock.advance(Duration::from_millis(1));
        }

        handle.join().unwrap();

        assert_eq!(clock.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn system_clock_instant_advances() {
        let clock = SystemClock::new();
        let t1 = clock.instant();
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(clock.instant() > t1);
    }

    #[test]
    fn shared_clock_works() {
        let system: SharedClock = SystemClock::shared();
        let test: SharedClock = TestClock::shared();

        let _ = system.now_utc();
        let _ = test.now_utc();
    }
}
