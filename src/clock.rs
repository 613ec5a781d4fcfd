use std::sync::atomic::{AtomicU64, Ordering};

/// Wall-clock source in Unix milliseconds.
///
/// Every staleness decision (grace window, slop tolerance, rate limits,
/// backup ids) reads time through this trait so tests can drive it.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Hand-driven clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Hands out strictly increasing millisecond stamps, even when the wall clock
/// stalls or two writes land in the same millisecond.
#[derive(Debug, Default)]
pub struct MonotonicStamp {
    last: AtomicU64,
}

impl MonotonicStamp {
    pub fn next(&self, now: u64) -> u64 {
        let mut prev = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(prev + 1);
            match self
                .last
                .compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_stamp_never_repeats() {
        let stamp = MonotonicStamp::default();
        assert_eq!(stamp.next(1000), 1000);
        assert_eq!(stamp.next(1000), 1001);
        assert_eq!(stamp.next(900), 1002);
        assert_eq!(stamp.next(5000), 5000);
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(10);
        clock.advance(5);
        assert_eq!(clock.now_millis(), 15);
        clock.set(3);
        assert_eq!(clock.now_millis(), 3);
    }
}
