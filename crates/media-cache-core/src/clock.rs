//! Access-time source for LRU bookkeeping.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Wall clock that never repeats or goes backwards.
///
/// Each call returns a stamp at least one microsecond after the previous one,
/// so every insertion and hit gets a distinct position in LRU order even when
/// the system clock is coarse or stepped back.
#[derive(Debug)]
pub struct AccessClock {
    last: Mutex<DateTime<Utc>>,
}

impl AccessClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let wall = micros_now();
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = if wall > *last {
            wall
        } else {
            *last + Duration::microseconds(1)
        };
        *last = next;
        next
    }
}

/// Current time truncated to whole microseconds, the precision the SQLite
/// backend stores.
fn micros_now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

impl Default for AccessClock {
    fn default() -> Self {
        Self::new()
    }
}
