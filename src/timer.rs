// canopen-threads/src/timer.rs
//
// Periodic interval timer built on a Linux timerfd.
//
// This file is part of the Rust 'canopen-threads' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Interval timer.
//!
//! Both loops are paced by a `timerfd` on `CLOCK_MONOTONIC`. The descriptor
//! becomes readable once the timer expires and stays readable (level
//! triggered) until the expiry count is read, which also resets the count.
//! If the thread was preempted for several periods, the single read returns
//! all of them, so no tick is ever lost.

use crate::errors::{Error, Result, ShouldRetry};
use nix::{
    errno::Errno,
    sys::{
        time::TimeSpec,
        timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags},
    },
    unistd,
};
use std::{
    os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd},
    time::Duration,
};

/// Reads the 8-byte counter of a timerfd or eventfd.
///
/// Returns `Ok(0)` if the descriptor is non-blocking and has nothing to
/// read. Interrupted reads are retried.
pub(crate) fn read_counter(fd: RawFd) -> std::result::Result<u64, Errno> {
    let mut buf = [0u8; 8];
    loop {
        match unistd::read(fd, &mut buf) {
            Ok(8) => return Ok(u64::from_ne_bytes(buf)),
            // Counters are always read whole
            Ok(_) => return Err(Errno::EIO),
            Err(Errno::EINTR) => continue,
            Err(e) if e.should_retry() => return Ok(0),
            Err(e) => return Err(e),
        }
    }
}

/// A periodic timer whose expirations are read as a count.
#[derive(Debug)]
pub struct IntervalTimer {
    fd: TimerFd,
    interval: Duration,
}

impl IntervalTimer {
    /// Creates a timer and arms it to expire every `interval_us`
    /// microseconds, starting one interval from now.
    ///
    /// The descriptor is non-blocking so that it can be drained after the
    /// multiplexor reports it ready.
    pub fn new(interval_us: u32) -> Result<Self> {
        if interval_us == 0 {
            return Err(Error::setup("interval timer")(Errno::EINVAL));
        }
        let fd = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .map_err(Error::setup("interval timer"))?;

        let timer = Self {
            fd,
            interval: Duration::from_micros(u64::from(interval_us)),
        };
        timer.arm().map_err(Error::setup("interval timer"))?;
        Ok(timer)
    }

    /// The period of the timer.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The period of the timer, in microseconds.
    pub fn interval_us(&self) -> u32 {
        crate::clock::duration_to_us(self.interval)
    }

    /// (Re)arms the timer to the plain periodic schedule.
    pub fn arm(&self) -> std::result::Result<(), Errno> {
        self.fd.set(
            Expiration::Interval(TimeSpec::from(self.interval)),
            TimerSetTimeFlags::empty(),
        )
    }

    /// Moves the next expiry closer.
    ///
    /// The timer fires once after `next_us` microseconds and then continues
    /// with the regular interval. Values not shorter than the interval are
    /// ignored. Returns whether the timer was re-armed.
    pub fn shorten_next(&self, next_us: u32) -> Result<bool> {
        let next = Duration::from_micros(u64::from(next_us.max(1)));
        if next >= self.interval {
            return Ok(false);
        }
        self.fd
            .set(
                Expiration::IntervalDelayed(TimeSpec::from(next), TimeSpec::from(self.interval)),
                TimerSetTimeFlags::empty(),
            )
            .map_err(Error::Timer)?;
        Ok(true)
    }

    /// Reads and clears the number of expirations since the last read.
    ///
    /// Returns zero if the timer has not expired. Any other read failure is
    /// fatal.
    pub fn expirations(&self) -> Result<u64> {
        read_counter(self.as_raw_fd()).map_err(Error::Timer)
    }

    /// Stops the timer without closing it.
    pub fn disarm(&self) -> Result<()> {
        self.fd.unset().map_err(Error::Timer)
    }
}

impl AsFd for IntervalTimer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for IntervalTimer {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_fd().as_raw_fd()
    }
}

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_zero_interval() {
        let err = IntervalTimer::new(0).unwrap_err();
        assert!(err.is_setup());
    }

    #[test]
    fn test_no_expiry_yet() {
        let timer = IntervalTimer::new(1_000_000).unwrap();
        assert_eq!(timer.interval_us(), 1_000_000);
        assert_eq!(timer.expirations().unwrap(), 0);
    }

    #[test]
    fn test_backlog_is_counted() {
        let timer = IntervalTimer::new(1_000).unwrap();
        thread::sleep(Duration::from_millis(20));

        let n = timer.expirations().unwrap();
        assert!(n >= 10, "only {} expirations", n);

        // The read cleared the counter
        assert!(timer.expirations().unwrap() <= 1);
    }

    #[test]
    fn test_shorten_next() {
        let timer = IntervalTimer::new(1_000_000).unwrap();
        assert!(!timer.shorten_next(2_000_000).unwrap());
        assert!(timer.shorten_next(1_000).unwrap());

        thread::sleep(Duration::from_millis(20));
        assert_eq!(timer.expirations().unwrap(), 1);
    }

    #[test]
    fn test_read_counter() {
        use std::{fs::File, io::Write};

        let (r, w) = unistd::pipe().unwrap();
        let mut w = File::from(w);

        w.write_all(&7u64.to_ne_bytes()).unwrap();
        assert_eq!(read_counter(r.as_raw_fd()), Ok(7));

        // A counter is never split
        w.write_all(&[1, 2, 3]).unwrap();
        assert_eq!(read_counter(r.as_raw_fd()), Err(Errno::EIO));
    }

    #[test]
    fn test_disarm() {
        let timer = IntervalTimer::new(1_000).unwrap();
        timer.disarm().unwrap();
        thread::sleep(Duration::from_millis(5));
        assert_eq!(timer.expirations().unwrap(), 0);
    }
}
