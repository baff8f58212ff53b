//! Adaptive timer interval for the catch-up loop: backs off exponentially
//! while the chain is fully indexed, snaps back to the floor as soon as
//! gaps reappear.

use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug)]
pub struct BoundedInterval {
    lo: Duration,
    hi: Duration,
    current: Mutex<Duration>,
}

impl BoundedInterval {
    /// Panics if `lo > hi` or `lo` is zero.
    pub fn new(lo: Duration, hi: Duration) -> Self {
        assert!(!lo.is_zero(), "interval floor must be nonzero");
        assert!(lo <= hi, "interval floor must not exceed the ceiling");
        Self { lo, hi, current: Mutex::new(lo) }
    }

    pub fn current(&self) -> Duration {
        *self.current.lock().expect("interval lock poisoned")
    }

    /// Doubles the delay, capped at the ceiling.
    pub fn increase(&self) -> Duration {
        let mut current = self.current.lock().expect("interval lock poisoned");
        *current = current.saturating_mul(2).min(self.hi);
        *current
    }

    /// Resets the delay to the floor.
    pub fn decrease(&self) -> Duration {
        let mut current = self.current.lock().expect("interval lock poisoned");
        *current = self.lo;
        *current
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn doubles_until_capped() {
        let interval = BoundedInterval::new(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(interval.increase(), Duration::from_secs(2));
        assert_eq!(interval.increase(), Duration::from_secs(4));
        assert_eq!(interval.increase(), Duration::from_secs(5));
        assert_eq!(interval.increase(), Duration::from_secs(5));
    }

    #[test]
    fn decrease_resets_to_floor() {
        let interval = BoundedInterval::new(Duration::from_secs(1), Duration::from_secs(60));
        interval.increase();
        interval.increase();
        assert_eq!(interval.decrease(), Duration::from_secs(1));
        assert_eq!(interval.current(), Duration::from_secs(1));
    }
}
