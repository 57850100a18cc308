//! Strictly increasing event timestamps.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

/// Hands out microsecond timestamps that never repeat or go backwards,
/// even if the wall clock does.
#[derive(Debug, Default)]
pub struct Timestamper {
    last: AtomicU64,
}

impl Timestamper {
    /// Creates a timestamper whose first value is greater than `floor`.
    pub fn starting_after(floor: u64) -> Self {
        Self { last: AtomicU64::new(floor) }
    }

    /// Returns the next timestamp: the wall clock in microseconds since the
    /// Unix epoch, or one more than the previous value if that is larger.
    pub fn now(&self) -> u64 {
        let wall = wall_clock_micros();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev.saturating_add(1));
            match self.last.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Last value handed out.
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }
}

fn wall_clock_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn test_strictly_increasing() {
        let clock = Timestamper::default();
        let mut prev = clock.now();
        for _ in 0..10_000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_starting_after_future_floor() {
        let floor = wall_clock_micros() + 60_000_000;
        let clock = Timestamper::starting_after(floor);
        assert_eq!(clock.now(), floor + 1);
        assert_eq!(clock.last(), floor + 1);
    }

    #[test]
    fn test_unique_across_threads() {
        let clock = Arc::new(Timestamper::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let clock = Arc::clone(&clock);
                thread::spawn(move || (0..1000).map(|_| clock.now()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
