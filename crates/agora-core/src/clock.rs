//! Time sources.
//!
//! Every component reads "now" through a [`Clock`] instead of calling the wall
//! clock directly. Expiry timestamps on gossip messages, requests and jobs are
//! epoch based, while debounce windows and heartbeats run on tokio timers;
//! [`MonotonicClock`] keeps the two in lockstep, including under
//! `tokio::time::pause`.

use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// A source of epoch time.
pub trait Clock: Debug + Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;

    /// Whole seconds since the Unix epoch.
    fn now_secs(&self) -> i64 {
        self.now_millis().div_euclid(1000)
    }
}

/// Clock shared between components.
pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Returns the wall clock as a [`SharedClock`].
    #[must_use]
    pub fn shared() -> SharedClock {
        Arc::new(Self)
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Epoch time derived from tokio's monotonic clock.
///
/// The wall clock is sampled once at construction; afterwards time advances with
/// [`tokio::time::Instant`]. When the runtime clock is paused this clock stands
/// still too, and `tokio::time::advance` moves it forward by the same amount.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    anchor_millis: i64,
    anchor: tokio::time::Instant,
}

impl MonotonicClock {
    /// Anchors a new clock at the current wall time.
    #[must_use]
    pub fn new() -> Self {
        Self::anchored_at(chrono::Utc::now().timestamp_millis())
    }

    /// Anchors a new clock at an explicit epoch time.
    #[must_use]
    pub fn anchored_at(epoch_millis: i64) -> Self {
        Self {
            anchor_millis: epoch_millis,
            anchor: tokio::time::Instant::now(),
        }
    }

    /// Returns this clock as a [`SharedClock`].
    #[must_use]
    pub fn shared(self) -> SharedClock {
        Arc::new(self)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> i64 {
        let elapsed = tokio::time::Instant::now().duration_since(self.anchor);
        self.anchor_millis + elapsed.as_millis() as i64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicI64>,
}

impl ManualClock {
    /// Creates a clock reading `epoch_millis`.
    #[must_use]
    pub fn new(epoch_millis: i64) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(epoch_millis)),
        }
    }

    /// Sets the current time.
    pub fn set_millis(&self, epoch_millis: i64) {
        self.millis.store(epoch_millis, Ordering::SeqCst);
    }

    /// Moves the clock forward.
    pub fn advance_millis(&self, delta: i64) {
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }

    /// Moves the clock forward by whole seconds.
    pub fn advance_secs(&self, delta: i64) {
        self.advance_millis(delta * 1000);
    }

    /// Returns a handle sharing this clock's time.
    #[must_use]
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now_secs() > 1_577_836_800);
    }

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(10_500);
        assert_eq!(clock.now_millis(), 10_500);
        assert_eq!(clock.now_secs(), 10);

        clock.advance_secs(2);
        assert_eq!(clock.now_millis(), 12_500);

        clock.set_millis(1_000);
        assert_eq!(clock.now_secs(), 1);
    }

    #[test]
    fn manual_clock_shared_handle_sees_updates() {
        let clock = ManualClock::new(0);
        let shared = clock.shared();
        clock.advance_millis(250);
        assert_eq!(shared.now_millis(), 250);
    }

    #[tokio::test(start_paused = true)]
    async fn monotonic_clock_follows_paused_tokio_time() {
        let clock = MonotonicClock::anchored_at(1_000_000);
        assert_eq!(clock.now_millis(), 1_000_000);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(clock.now_millis(), 1_003_000);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(clock.now_millis(), 1_003_500);
    }
}
