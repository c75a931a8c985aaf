//! Time source abstraction.
//!
//! Debouncing is purely a function of "when did the raw value last change",
//! so every component that compares instants reads them through [`Clock`].
//! Production code uses [`SystemClock`]; tests and the replay tool drive a
//! [`MockClock`] by hand.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Trait for time operations, allowing mock time in tests.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Instant;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// Real system clock using `std::time::Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock.
///
/// Clones share the same underlying instant, so a test can hand one clone to
/// a store and keep another to move time forward.
#[derive(Debug, Clone)]
pub struct MockClock {
    start: Instant,
    current: Arc<Mutex<Instant>>,
}

impl MockClock {
    /// Creates a new mock clock starting at the current instant.
    pub fn new() -> Self {
        let start = Instant::now();
        Self {
            start,
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Advances the mock clock by the given duration.
    pub fn advance(&self, duration: Duration) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(target) = current.checked_add(duration) {
            *current = target;
        }
    }

    /// Moves the clock to `offset` after its starting instant.
    ///
    /// Offsets earlier than the current position are ignored; time never
    /// runs backwards. So are offsets the platform's `Instant` cannot hold.
    pub fn advance_to(&self, offset: Duration) {
        let Some(target) = self.start.checked_add(offset) else {
            tracing::debug!(?offset, "mock clock offset out of range");
            return;
        };
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if target > *current {
            *current = target;
        }
    }

    /// Time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        self.now().saturating_duration_since(self.start)
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
