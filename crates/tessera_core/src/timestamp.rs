//! Monotonic timestamp issue.

use crate::types::Timestamp;
use parking_lot::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Issues strictly increasing timestamps.
pub trait TimestampSource: Send + Sync {
    /// Returns a timestamp greater than every one issued before.
    fn next_timestamp(&self) -> Timestamp;

    /// The most recently issued timestamp.
    fn last_timestamp(&self) -> Timestamp;
}

/// Wall-clock based timestamp service.
///
/// Each timestamp is `max(last + 1, now_millis)`, so values track the clock
/// when commits are sparse and stay unique when they are dense.
#[derive(Debug, Default)]
pub struct TimestampService {
    last: Mutex<u64>,
}

impl TimestampService {
    /// Creates a service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a service that never issues a value at or below `floor`.
    ///
    /// Used on reopen so new commit times follow the recovered ones.
    #[must_use]
    pub fn starting_after(floor: Timestamp) -> Self {
        Self {
            last: Mutex::new(floor.as_u64()),
        }
    }
}

impl TimestampSource for TimestampService {
    fn next_timestamp(&self) -> Timestamp {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut last = self.last.lock();
        *last = now.max(*last + 1);
        Timestamp::new(*last)
    }

    fn last_timestamp(&self) -> Timestamp {
        Timestamp::new(*self.last.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn timestamps_strictly_increase() {
        let service = TimestampService::new();
        let mut last = Timestamp::UNISOLATED;
        for _ in 0..1_000 {
            let ts = service.next_timestamp();
            assert!(ts > last);
            last = ts;
        }
        assert_eq!(service.last_timestamp(), last);
    }

    #[test]
    fn starting_after_respects_floor() {
        let floor = Timestamp::new(u64::MAX / 2);
        let service = TimestampService::starting_after(floor);
        assert_eq!(service.next_timestamp(), Timestamp::new(floor.as_u64() + 1));
    }

    #[test]
    fn concurrent_timestamps_are_unique() {
        let service = Arc::new(TimestampService::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let service = Arc::clone(&service);
                thread::spawn(move || {
                    (0..250).map(|_| service.next_timestamp()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for ts in handle.join().unwrap() {
                assert!(seen.insert(ts));
            }
        }
        assert_eq!(seen.len(), 1_000);
    }
}
