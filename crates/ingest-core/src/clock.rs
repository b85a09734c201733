use std::sync::atomic::{AtomicI64, Ordering};
use time::OffsetDateTime;

/// Wall-clock milliseconds since the unix epoch.
pub fn unix_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Process clock used to stamp frames. Never goes backwards, even if the
/// system clock is stepped.
#[derive(Debug, Default)]
pub struct ProcessClock {
    last: AtomicI64,
}

impl ProcessClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_ms(&self) -> i64 {
        let wall = unix_millis();
        let prev = self.last.fetch_max(wall, Ordering::AcqRel);
        prev.max(wall)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_decreases() {
        let clock = ProcessClock::new();
        clock.last.store(i64::MAX - 10, Ordering::Relaxed);
        assert_eq!(clock.now_ms(), i64::MAX - 10);

        let fresh = ProcessClock::new();
        let a = fresh.now_ms();
        let b = fresh.now_ms();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000);
    }
}
