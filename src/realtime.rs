// canopen-threads/src/realtime.rs
//
// The timer-driven realtime driver.
//
// This file is part of the Rust 'canopen-threads' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Realtime driver.
//!
//! The realtime thread services CAN reception and the time critical SYNC
//! and PDO objects. It blocks in a single multiplexor that watches:
//!
//! - the interval timer (typically 1 ms),
//! - the receive socket of every CAN interface, added by the CAN driver,
//! - a shutdown channel.
//!
//! On every wake, all ready sockets are handed to the CAN driver, which
//! dispatches the frames into the stack. Then, if at least one timer
//! interval expired, the stack's SYNC, RPDO and TPDO steps run once each,
//! in that order. A SYNC frame received in a cycle therefore takes effect
//! in the same cycle, and a TPDO always sees the freshest RPDO data.
//!
//! The harness does not change the scheduling class of the thread. If
//! realtime response is needed, the application should give the thread a
//! realtime priority before calling [`Realtime::run`].

use crate::{
    driver::CanRxDriver,
    errors::Result,
    mux::{Event, Poller, Token},
    notify::WakeupEvent,
    stack::{RealtimeStack, Tick},
    timer::IntervalTimer,
};
use std::sync::Arc;

/// The recommended realtime interval, in microseconds.
pub const DEFAULT_INTERVAL_US: u32 = 1_000;

const TIMER: Token = Token(0);
const SHUTDOWN: Token = Token(1);

// Ready events reported per wait
const EVENT_CAPACITY: usize = 16;

/// The outcome of one realtime cycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Cycle {
    /// The cycle ran. `ticks` timer intervals were handed to the SYNC/PDO
    /// steps (zero if the timer didn't expire) and `frames` CAN frames were
    /// dispatched.
    Running {
        /// Timer intervals consumed in this cycle
        ticks: u32,
        /// Frames dispatched in this cycle
        frames: usize,
    },
    /// Shutdown was requested. The caller's loop should exit.
    Shutdown,
}

/// The realtime driver.
pub struct Realtime<S: RealtimeStack, D: CanRxDriver> {
    interval_us: u32,
    stack: Arc<S>,
    driver: D,
    poller: Poller,
    timer: IntervalTimer,
    shutdown: Arc<WakeupEvent>,
    ticks: u32,
    ticks_total: u64,
    ready: Vec<Event>,
}

impl<S: RealtimeStack, D: CanRxDriver> Realtime<S, D> {
    /// Creates the interval timer, the shutdown channel and the
    /// multiplexor, and lets the CAN driver register its receive sockets.
    ///
    /// An error here means no realtime thread should be started.
    pub fn init(interval_us: u32, stack: Arc<S>, mut driver: D) -> Result<Self> {
        let timer = IntervalTimer::new(interval_us)?;
        let shutdown = Arc::new(WakeupEvent::new()?);
        let poller = Poller::new(EVENT_CAPACITY)?;

        poller.registry().register_with(&timer, TIMER)?;
        poller.registry().register_with(&*shutdown, SHUTDOWN)?;
        driver.register(poller.registry())?;

        log::debug!("Realtime driver initialized, interval {} us", interval_us);
        Ok(Self {
            interval_us,
            stack,
            driver,
            poller,
            timer,
            shutdown,
            ticks: 0,
            ticks_total: 0,
            ready: Vec::with_capacity(EVENT_CAPACITY),
        })
    }

    /// The timer interval, in microseconds.
    pub fn interval_us(&self) -> u32 {
        self.interval_us
    }

    /// The total number of timer intervals consumed so far.
    pub fn ticks_total(&self) -> u64 {
        self.ticks_total
    }

    /// The CAN driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Gets a handle that can stop the realtime loop from another thread.
    pub fn shutdown_handle(&self) -> RealtimeShutdown {
        RealtimeShutdown(self.shutdown.clone())
    }

    /// Runs one realtime cycle.
    ///
    /// Blocks until a timer tick, a CAN frame or a shutdown request
    /// arrives. Once shutdown was requested, this returns
    /// [`Cycle::Shutdown`] right away on every call.
    pub fn process(&mut self) -> Result<Cycle> {
        self.poller.wait(&mut self.ready)?;

        if self.ready.iter().any(|ev| ev.token == SHUTDOWN) {
            // The event is left signalled, so the request sticks
            return Ok(Cycle::Shutdown);
        }

        let mut frames = 0;
        for ev in self.ready.iter() {
            match ev.token {
                TIMER => {
                    let n = self.timer.expirations()?;
                    self.ticks = self
                        .ticks
                        .saturating_add(u32::try_from(n).unwrap_or(u32::MAX));
                }
                token if self.driver.owns(token) => {
                    frames += self.driver.dispatch(token, ev.ready)?;
                }
                token => log::debug!("Realtime wake for unknown token {}", token),
            }
        }

        let ticks = self.ticks;
        if ticks > 0 {
            self.ticks = 0;
            self.ticks_total += u64::from(ticks);

            if self.stack.can_normal() {
                let tick = Tick::new(ticks, self.interval_us);
                let sync_was = self.stack.process_sync(tick);
                self.stack.process_rpdo(sync_was, tick);
                self.stack.process_tpdo(sync_was, tick);
            }
        }

        Ok(Cycle::Running { ticks, frames })
    }

    /// Runs cycles until shutdown is requested or a fatal error occurs.
    pub fn run(&mut self) -> Result<()> {
        loop {
            if self.process()? == Cycle::Shutdown {
                log::debug!("Realtime loop stopped");
                return Ok(());
            }
        }
    }

    /// Signals shutdown, detaches the CAN driver and releases the timer and
    /// the multiplexor.
    ///
    /// Returns the CAN driver, so that it can be reused.
    pub fn close(mut self) -> Result<D> {
        self.shutdown.signal()?;
        self.timer.disarm()?;
        self.driver.deregister(self.poller.registry())?;
        log::debug!("Realtime driver closed");
        Ok(self.driver)
    }
}

impl<S: RealtimeStack, D: CanRxDriver + std::fmt::Debug> std::fmt::Debug for Realtime<S, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Realtime")
            .field("interval_us", &self.interval_us)
            .field("driver", &self.driver)
            .field("poller", &self.poller)
            .field("ticks_total", &self.ticks_total)
            .finish()
    }
}

// ===== RealtimeShutdown =====

/// Stops a running realtime loop.
///
/// Requesting shutdown makes a blocked [`Realtime::process`] return
/// [`Cycle::Shutdown`] within one scheduling quantum. The request cannot be
/// taken back.
#[derive(Debug, Clone)]
pub struct RealtimeShutdown(Arc<WakeupEvent>);

impl RealtimeShutdown {
    /// Requests shutdown.
    pub fn shutdown(&self) -> Result<()> {
        self.0.signal()
    }
}

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::{Ready, Registry};
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        thread,
        time::{Duration, Instant},
    };

    #[derive(Debug)]
    struct NoCan;

    impl CanRxDriver for NoCan {
        fn register(&mut self, _registry: &Registry) -> Result<()> {
            Ok(())
        }

        fn deregister(&mut self, _registry: &Registry) -> Result<()> {
            Ok(())
        }

        fn owns(&self, _token: Token) -> bool {
            false
        }

        fn dispatch(&mut self, _token: Token, _ready: Ready) -> Result<usize> {
            Ok(0)
        }
    }

    #[derive(Default)]
    struct Stack {
        normal: bool,
        syncs: AtomicU32,
        ticks: AtomicU32,
    }

    impl RealtimeStack for Stack {
        fn can_normal(&self) -> bool {
            self.normal
        }

        fn process_sync(&self, tick: Tick) -> bool {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            self.ticks.fetch_add(tick.count, Ordering::SeqCst);
            false
        }

        fn process_rpdo(&self, _sync_was: bool, _tick: Tick) {}

        fn process_tpdo(&self, _sync_was: bool, _tick: Tick) {}
    }

    #[test]
    fn test_ticks_reach_stack() {
        let stack = Arc::new(Stack {
            normal: true,
            ..Default::default()
        });
        let mut rt = Realtime::init(1_000, stack.clone(), NoCan).unwrap();

        let mut consumed = 0;
        while consumed < 10 {
            match rt.process().unwrap() {
                Cycle::Running { ticks, frames } => {
                    assert_eq!(frames, 0);
                    consumed += ticks;
                }
                Cycle::Shutdown => panic!("unexpected shutdown"),
            }
        }
        assert_eq!(u64::from(consumed), rt.ticks_total());
        assert_eq!(stack.ticks.load(Ordering::SeqCst), consumed);
        assert!(stack.syncs.load(Ordering::SeqCst) <= consumed);
    }

    #[test]
    fn test_not_can_normal() {
        let stack = Arc::new(Stack::default());
        let mut rt = Realtime::init(1_000, stack.clone(), NoCan).unwrap();

        thread::sleep(Duration::from_millis(3));
        rt.process().unwrap();
        assert!(rt.ticks_total() > 0);
        assert_eq!(stack.syncs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shutdown_sticks() {
        let stack = Arc::new(Stack::default());
        let mut rt = Realtime::init(1_000_000, stack, NoCan).unwrap();

        let handle = rt.shutdown_handle();
        let th = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            handle.shutdown().unwrap();
        });

        let t = Instant::now();
        assert_eq!(rt.process().unwrap(), Cycle::Shutdown);
        assert!(t.elapsed() < Duration::from_millis(500));
        assert_eq!(rt.process().unwrap(), Cycle::Shutdown);
        rt.run().unwrap();
        th.join().unwrap();

        rt.close().unwrap();
    }
}
