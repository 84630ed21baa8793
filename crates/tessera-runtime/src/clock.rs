//! Time sources.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::warn;

use tessera_core::traits::{TimeSource, Timestamp};

/// Wall-clock time that never runs backwards.
///
/// If the system clock steps back, the previous timestamp is repeated and
/// reported as unsynchronized until the clock catches up.
pub struct SystemClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(None),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemClock {
    fn now(&self) -> Timestamp {
        let now = Utc::now();
        let mut last = self.last.lock();
        match *last {
            Some(previous) if previous > now => {
                warn!(%previous, %now, "system clock stepped backwards");
                Timestamp {
                    at: previous,
                    synchronized: false,
                }
            }
            _ => {
                *last = Some(now);
                Timestamp {
                    at: now,
                    synchronized: true,
                }
            }
        }
    }
}

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp {
            at: *self.now.lock(),
            synchronized: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let mut previous = clock.now().at;
        for _ in 0..1000 {
            let next = clock.now().at;
            assert!(next >= previous);
            previous = next;
        }
    }

    /// A backwards step repeats the last timestamp, flagged unsynchronized.
    #[test]
    fn test_system_clock_holds_on_backward_step() {
        let clock = SystemClock::new();
        let future = Utc::now() + Duration::hours(1);
        *clock.last.lock() = Some(future);

        let stamp = clock.now();
        assert_eq!(stamp.at, future);
        assert!(!stamp.synchronized);
    }

    #[test]
    fn test_manual_clock() {
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now().at, start);

        clock.advance(Duration::milliseconds(8001));
        assert_eq!(clock.now().at, start + Duration::milliseconds(8001));

        clock.set(start);
        assert_eq!(clock.now().at, start);
    }
}
