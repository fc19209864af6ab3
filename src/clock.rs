// canopen-threads/src/clock.rs
//
// Monotonic time keeping for the mainline loop.
//
// This file is part of the Rust 'canopen-threads' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Monotonic microsecond clock.
//!
//! The mainline stack step is always handed the time that elapsed since the
//! previous step. That difference is taken from `CLOCK_MONOTONIC` (through
//! [`Instant`]) so it is never negative, even when the wall clock is set.

use std::time::{Duration, Instant};

/// Converts a duration to whole microseconds, saturating at `u32::MAX`.
#[inline]
pub fn duration_to_us(d: Duration) -> u32 {
    u32::try_from(d.as_micros()).unwrap_or(u32::MAX)
}

/// Tracks the last wake time of a loop and reports the elapsed time
/// between wakes.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    last: Instant,
}

impl MonotonicClock {
    /// Starts the clock at the current instant.
    pub fn start() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// The instant of the last recorded wake.
    pub fn last_wake(&self) -> Instant {
        self.last
    }

    /// Records a wake at the current instant, returning the microseconds
    /// since the previous one.
    pub fn lap_us(&mut self) -> u32 {
        self.lap_at(Instant::now())
    }

    /// Records a wake at `now`, returning the microseconds since the
    /// previous one.
    ///
    /// An instant earlier than the last wake counts as zero elapsed time and
    /// does not move the clock backwards.
    pub fn lap_at(&mut self, now: Instant) -> u32 {
        let diff = now.saturating_duration_since(self.last);
        if now > self.last {
            self.last = now;
        }
        duration_to_us(diff)
    }

    /// Microseconds elapsed since the last wake, without recording a new one.
    pub fn peek_us(&self) -> u32 {
        duration_to_us(self.last.elapsed())
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::start()
    }
}

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lap() {
        let t0 = Instant::now();
        let mut clock = MonotonicClock { last: t0 };

        assert_eq!(clock.lap_at(t0 + Duration::from_micros(1500)), 1500);
        assert_eq!(clock.lap_at(t0 + Duration::from_micros(4000)), 2500);
        assert_eq!(clock.last_wake(), t0 + Duration::from_micros(4000));
    }

    #[test]
    fn test_lap_never_negative() {
        let t0 = Instant::now() + Duration::from_secs(1);
        let mut clock = MonotonicClock { last: t0 };

        assert_eq!(clock.lap_at(t0 - Duration::from_micros(10)), 0);
        assert_eq!(clock.last_wake(), t0);
    }

    #[test]
    fn test_saturation() {
        assert_eq!(duration_to_us(Duration::from_micros(42)), 42);
        assert_eq!(duration_to_us(Duration::from_secs(1 << 20)), u32::MAX);
    }
}
