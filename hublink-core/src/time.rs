//! Time provider abstraction.
//!
//! The messaging core stamps queue entries and link state observations
//! with a monotonic clock and compares ages against configured
//! timeouts. Abstracting the clock lets tests advance time manually
//! instead of sleeping.

use std::time::{Duration, Instant};

/// Provider trait for monotonic time.
///
/// `now()` returns the elapsed time since an arbitrary fixed origin; it
/// never goes backwards. Implementations are cheap cloneable handles.
pub trait TimeProvider: Clone {
    /// Current monotonic time.
    fn now(&self) -> Duration;
}

/// Production time provider backed by [`Instant`].
#[derive(Debug, Clone)]
pub struct SystemTimeProvider {
    /// Origin for elapsed-time calculation.
    start: Instant,
}

impl SystemTimeProvider {
    /// Create a new provider anchored at the current instant.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_time_is_monotonic() {
        let time = SystemTimeProvider::new();
        let first = time.now();
        let second = time.now();
        assert!(second >= first);
    }

    #[test]
    fn test_clones_share_origin() {
        let time = SystemTimeProvider::new();
        let clone = time.clone();
        let first = time.now();
        let second = clone.now();
        assert!(second >= first);
    }
}
