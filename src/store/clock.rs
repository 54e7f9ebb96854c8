//! Clock sources for window arithmetic.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Wall-clock time in whole seconds since the Unix epoch.
pub type Timestamp = u64;

/// Port for obtaining the current time.
///
/// Window starts are stored inside records shared by every worker, so the
/// clock reports wall time rather than a per-process monotonic instant.
pub trait Clock: Send + Sync + Debug {
    /// Get the current time.
    fn now(&self) -> Timestamp;
}

/// System clock backed by `chrono::Utc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        // Pre-epoch clocks clamp to zero.
        u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
    }
}

/// Controllable clock for tests.
///
/// Clones share the same underlying time, so advancing one clone is
/// observed by every limiter holding another.
#[derive(Debug, Clone)]
pub struct MockClock {
    current: Arc<Mutex<Timestamp>>,
}

impl MockClock {
    /// Create a mock clock starting at `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Advance the clock by a duration (whole seconds).
    pub fn advance(&self, duration: Duration) {
        let mut now = self.current.lock();
        *now = now.saturating_add(duration.as_secs());
    }

    /// Set the clock to a specific timestamp.
    pub fn set(&self, timestamp: Timestamp) {
        *self.current.lock() = timestamp;
    }
}

impl Clock for MockClock {
    fn now(&self) -> Timestamp {
        *self.current.lock()
    }
}
