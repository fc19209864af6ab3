// canopen-threads/src/mainline_wait.rs
//
// The blocking, self-timed mainline driver.
//
// This file is part of the Rust 'canopen-threads' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Blocking mainline driver.
//!
//! The driver owns an interval timer, a wakeup event and a multiplexor that
//! watches both. Each call to [`MainlineWait::process`] blocks until either
//! the interval elapses or the stack signals that it has work pending, then
//! runs the stack's mainline step once.
//!
//! The lifecycle follows the communication reset cycles of the node:
//!
//! ```text
//! init_once(interval)        once, at program start
//! loop {
//!     <stack communication init>
//!     init(stack)            installs the wakeup bridge
//!     while process()? == None {}
//!     close()                clears the bridge, releases the descriptors
//! }
//! ```
//!
//! `close` releases the timer and the multiplexor. The next `init` creates
//! them again with the interval fixed at `init_once`, so the number of open
//! descriptors is the same in every cycle. The wakeup event lives as long as
//! the driver: a wakeup that arrives while the driver is closed stays
//! pending and makes the first `process` after the next `init` return
//! right away.

use crate::{
    clock::MonotonicClock,
    errors::{Error, Result},
    mux::{Event, Poller, Token},
    notify::{Notifier, WakeupEvent},
    stack::{MainlineStack, ResetCommand},
    timer::IntervalTimer,
};
use std::sync::Arc;

/// The typical mainline interval, in microseconds.
pub const DEFAULT_INTERVAL_US: u32 = 50_000;

const TIMER: Token = Token(0);
const WAKEUP: Token = Token(1);

/// The result of one blocking mainline cycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MainlineWake {
    /// The reset command returned by the stack
    pub reset: ResetCommand,
    /// Microseconds since the previous wake, as handed to the stack
    pub elapsed_us: u32,
}

/// The descriptors that live from `init` to `close`.
#[derive(Debug)]
struct Resources {
    poller: Poller,
    timer: IntervalTimer,
}

impl Resources {
    fn create(interval_us: u32, wakeup: &WakeupEvent) -> Result<Self> {
        let timer = IntervalTimer::new(interval_us)?;
        let poller = Poller::new(2)?;

        poller.registry().register_with(&timer, TIMER)?;
        poller.registry().register_with(wakeup, WAKEUP)?;

        Ok(Self { poller, timer })
    }
}

/// The blocking mainline driver.
#[derive(Debug)]
pub struct MainlineWait<S: MainlineStack> {
    interval_us: u32,
    clock: MonotonicClock,
    res: Option<Resources>,
    stack: Option<Arc<S>>,
    wakeup: Arc<WakeupEvent>,
    ready: Vec<Event>,
}

impl<S: MainlineStack> MainlineWait<S> {
    /// Creates the driver. Call this exactly once for the lifetime of the
    /// program.
    ///
    /// Creates the interval timer (armed periodic), the wakeup event and
    /// the multiplexor, and records the starting time.
    pub fn init_once(interval_us: u32) -> Result<Self> {
        let wakeup = Arc::new(WakeupEvent::new()?);
        let res = Resources::create(interval_us, &wakeup)?;
        log::debug!("Blocking mainline created, interval {} us", interval_us);

        Ok(Self {
            interval_us,
            clock: MonotonicClock::start(),
            res: Some(res),
            stack: None,
            wakeup,
            ready: Vec::with_capacity(2),
        })
    }

    /// The interval fixed at `init_once`, in microseconds.
    pub fn interval_us(&self) -> u32 {
        self.interval_us
    }

    /// Installs the wakeup bridge into the stack.
    ///
    /// Call this in every communication reset cycle, after the stack has
    /// been initialized. If the previous cycle was closed, the timer and
    /// multiplexor are created again.
    pub fn init(&mut self, stack: Arc<S>) -> Result<()> {
        if self.res.is_none() {
            self.res = Some(Resources::create(self.interval_us, &self.wakeup)?);
        }
        if let Some(old) = self.stack.take() {
            if !Arc::ptr_eq(&old, &stack) {
                old.set_mainline_notifier(None);
            }
        }
        stack.set_mainline_notifier(Some(Notifier::Event(self.wakeup.clone())));
        self.stack = Some(stack);

        log::debug!("Blocking mainline initialized");
        Ok(())
    }

    /// Gets a handle that can wake a blocked `process` from another thread.
    ///
    /// The handle stays valid across `close`/`init` cycles. A wake given
    /// while the driver is closed is kept for the next `process`.
    pub fn waker(&self) -> MainlineWaker {
        MainlineWaker {
            wakeup: self.wakeup.clone(),
        }
    }

    /// Blocks until the interval elapses or a wakeup arrives, then runs the
    /// stack's mainline step once.
    ///
    /// The timer and the wakeup event are both drained, so a timer expiry
    /// and any number of wakeups that coincide result in a single step. A
    /// wake that turns out to have nothing behind it is not passed on to the
    /// stack; the wait is simply repeated.
    pub fn process(&mut self) -> Result<MainlineWake> {
        let (res, stack) = match (self.res.as_mut(), self.stack.as_ref()) {
            (Some(res), Some(stack)) => (res, stack),
            _ => return Err(Error::Closed),
        };

        loop {
            res.poller.wait(&mut self.ready)?;

            let mut woken = false;
            for ev in self.ready.iter() {
                match ev.token {
                    TIMER => woken |= res.timer.expirations()? > 0,
                    WAKEUP => woken |= self.wakeup.drain()? > 0,
                    _ => {}
                }
            }
            if woken {
                break;
            }
            log::trace!("Spurious mainline wake");
        }

        let elapsed_us = self.clock.lap_us();
        let step = stack.process(elapsed_us);

        if let Some(next_us) = step.timer_next_us {
            if res.timer.shorten_next(next_us)? {
                log::trace!("Next mainline wake in {} us", next_us);
            }
        }

        Ok(MainlineWake {
            reset: step.reset,
            elapsed_us,
        })
    }

    /// Clears the wakeup bridge and releases the multiplexor and the timer.
    ///
    /// The stack gets no notifier until the next `init`. Calling this on an
    /// already closed driver does nothing.
    pub fn close(&mut self) {
        if let Some(stack) = self.stack.take() {
            stack.set_mainline_notifier(None);
        }
        if self.res.take().is_some() {
            log::debug!("Blocking mainline closed");
        }
    }

    /// Whether `close` was called without a following `init`.
    pub fn is_closed(&self) -> bool {
        self.res.is_none()
    }
}

impl<S: MainlineStack> Drop for MainlineWait<S> {
    fn drop(&mut self) {
        self.close();
    }
}

// ===== MainlineWaker =====

/// Wakes the blocking mainline from another thread.
///
/// This is meant for the application, e.g. to get a quit request noticed
/// right away. The stack itself is woken through its notifier.
#[derive(Debug, Clone)]
pub struct MainlineWaker {
    wakeup: Arc<WakeupEvent>,
}

impl MainlineWaker {
    /// Wakes the mainline. If it is closed, the wake is delivered once it
    /// is initialized again.
    pub fn wake(&self) -> Result<()> {
        self.wakeup.signal()
    }
}

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::MainlineStep;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        thread,
        time::{Duration, Instant},
    };

    #[derive(Default)]
    struct Stack {
        notifier: Mutex<Option<Notifier>>,
        calls: AtomicUsize,
    }

    impl Stack {
        fn work_pending(&self) {
            if let Some(n) = self.notifier.lock().unwrap().as_ref() {
                n.notify();
            }
        }
    }

    impl MainlineStack for Stack {
        fn process(&self, _elapsed_us: u32) -> MainlineStep {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ResetCommand::None.into()
        }

        fn set_mainline_notifier(&self, notifier: Option<Notifier>) {
            *self.notifier.lock().unwrap() = notifier;
        }
    }

    #[test]
    fn test_process_before_init() {
        let mut mw = MainlineWait::<Stack>::init_once(10_000).unwrap();
        assert!(matches!(mw.process(), Err(Error::Closed)));
    }

    #[test]
    fn test_zero_interval() {
        let res = MainlineWait::<Stack>::init_once(0);
        assert!(matches!(res, Err(ref e) if e.is_setup()));
    }

    #[test]
    fn test_wakeup_before_interval() {
        let stack = Arc::new(Stack::default());
        let mut mw = MainlineWait::init_once(10_000_000).unwrap();
        mw.init(stack.clone()).unwrap();

        // Several pending notifications collapse into one wake
        stack.work_pending();
        stack.work_pending();
        stack.work_pending();

        let t = Instant::now();
        let wake = mw.process().unwrap();
        assert!(t.elapsed() < Duration::from_secs(1));
        assert_eq!(wake.reset, ResetCommand::None);
        assert_eq!(stack.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_waker() {
        let stack = Arc::new(Stack::default());
        let mut mw = MainlineWait::init_once(10_000_000).unwrap();
        mw.init(stack).unwrap();

        let waker = mw.waker();
        let th = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            waker.wake().unwrap();
        });

        let wake = mw.process().unwrap();
        assert!(wake.elapsed_us >= 4_000);
        assert!(wake.elapsed_us < 1_000_000);
        th.join().unwrap();
    }

    #[test]
    fn test_close_clears_bridge() {
        let stack = Arc::new(Stack::default());
        let mut mw = MainlineWait::init_once(10_000).unwrap();
        mw.init(stack.clone()).unwrap();
        assert!(stack.notifier.lock().unwrap().is_some());

        mw.close();
        assert!(mw.is_closed());
        assert!(stack.notifier.lock().unwrap().is_none());
        assert!(matches!(mw.process(), Err(Error::Closed)));

        mw.close();

        mw.init(stack.clone()).unwrap();
        assert!(!mw.is_closed());
        mw.process().unwrap();
        assert_eq!(stack.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_notify_while_closed() {
        let stack = Arc::new(Stack::default());
        let mut mw = MainlineWait::init_once(10_000_000).unwrap();
        mw.init(stack.clone()).unwrap();

        // A notifier the stack still held on to when the cycle ended
        let notifier = stack.notifier.lock().unwrap().clone().unwrap();
        mw.close();
        notifier.notify();

        mw.init(stack.clone()).unwrap();
        let t = Instant::now();
        mw.process().unwrap();
        assert!(t.elapsed() < Duration::from_millis(500));
        assert_eq!(stack.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_waker_while_closed() {
        let stack = Arc::new(Stack::default());
        let mut mw = MainlineWait::init_once(10_000_000).unwrap();
        let waker = mw.waker();

        mw.init(stack.clone()).unwrap();
        mw.close();
        waker.wake().unwrap();

        mw.init(stack).unwrap();
        let t = Instant::now();
        mw.process().unwrap();
        assert!(t.elapsed() < Duration::from_millis(500));
    }
}
