// canopen-threads/src/mainline.rs
//
// The basic (non-blocking) mainline driver.
//
// This file is part of the Rust 'canopen-threads' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Basic mainline driver.
//!
//! This is a pure processing pump for applications that already have an
//! event loop of their own. It owns no timer and no multiplexor. The
//! application must call [`Mainline::process`]:
//!
//! - cyclically, at an interval of its choosing (50 ms is typical), and
//! - promptly after the callback given to [`Mainline::init`] fired.
//!
//! The callback is fired by the stack, usually from the realtime thread,
//! so it must be wait-free. It should only nudge the application's loop.
//!
//! The callback is never invoked by `process` itself; the harness treats it
//! as non-re-entrant. A stack that raises "work pending" from inside its
//! own mainline step must not expect a nested `process` call.

use crate::{
    clock::MonotonicClock,
    notify::Notifier,
    stack::{MainlineStack, ResetCommand},
};
use std::sync::Arc;

/// The basic mainline driver.
#[derive(Debug)]
pub struct Mainline<S: MainlineStack> {
    stack: Arc<S>,
    clock: MonotonicClock,
    timer_next_us: Option<u32>,
    open: bool,
}

impl<S: MainlineStack> Mainline<S> {
    /// Registers the wakeup callback with the stack's notification hook.
    ///
    /// This must happen before anything that could fire the hook, in
    /// particular before the CAN receive sockets are armed.
    pub fn init<F>(stack: Arc<S>, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        stack.set_mainline_notifier(Some(Notifier::Callback(Arc::new(callback))));
        log::debug!("Basic mainline initialized");
        Self {
            stack,
            clock: MonotonicClock::start(),
            timer_next_us: None,
            open: true,
        }
    }

    /// Runs the stack's mainline step once.
    ///
    /// The stack is handed the time since the previous call. This does not
    /// block and does not sleep, although the stack may transmit frames.
    pub fn process(&mut self) -> ResetCommand {
        let elapsed_us = self.clock.lap_us();
        let step = self.stack.process(elapsed_us);
        self.timer_next_us = step.timer_next_us;
        step.reset
    }

    /// The earlier wake the stack asked for in the last step, if any.
    ///
    /// An application with its own timing can use this to shorten its next
    /// cycle.
    pub fn timer_next_us(&self) -> Option<u32> {
        self.timer_next_us
    }

    /// Clears the callback registration.
    ///
    /// Call this after the stack has been stopped, so that no further
    /// upcalls can happen.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.open {
            self.stack.set_mainline_notifier(None);
            self.open = false;
            log::debug!("Basic mainline closed");
        }
    }
}

impl<S: MainlineStack> Drop for Mainline<S> {
    fn drop(&mut self) {
        self.release();
    }
}

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::MainlineStep;
    use std::{
        sync::{
            atomic::{AtomicU32, AtomicUsize, Ordering},
            Mutex,
        },
        thread,
        time::Duration,
    };

    #[derive(Default)]
    struct Stack {
        notifier: Mutex<Option<Notifier>>,
        calls: AtomicUsize,
        last_elapsed: AtomicU32,
    }

    impl Stack {
        fn work_pending(&self) {
            if let Some(n) = self.notifier.lock().unwrap().as_ref() {
                n.notify();
            }
        }
    }

    impl MainlineStack for Stack {
        fn process(&self, elapsed_us: u32) -> MainlineStep {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_elapsed.store(elapsed_us, Ordering::SeqCst);
            if n == 2 {
                MainlineStep::with_timer_next(ResetCommand::Communication, 500)
            } else {
                ResetCommand::None.into()
            }
        }

        fn set_mainline_notifier(&self, notifier: Option<Notifier>) {
            *self.notifier.lock().unwrap() = notifier;
        }
    }

    #[test]
    fn test_callback_registration() {
        let stack = Arc::new(Stack::default());
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();

        let mainline = Mainline::init(stack.clone(), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        stack.work_pending();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        mainline.close();
        assert!(stack.notifier.lock().unwrap().is_none());
        stack.work_pending();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_process() {
        let stack = Arc::new(Stack::default());
        let mut mainline = Mainline::init(stack.clone(), || {});

        assert_eq!(mainline.process(), ResetCommand::None);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(mainline.process(), ResetCommand::None);
        assert!(stack.last_elapsed.load(Ordering::SeqCst) >= 10_000);
        assert_eq!(mainline.timer_next_us(), None);

        assert_eq!(mainline.process(), ResetCommand::Communication);
        assert_eq!(mainline.timer_next_us(), Some(500));
        assert_eq!(stack.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_drop_clears_callback() {
        let stack = Arc::new(Stack::default());
        {
            let _mainline = Mainline::init(stack.clone(), || {});
            assert!(stack.notifier.lock().unwrap().is_some());
        }
        assert!(stack.notifier.lock().unwrap().is_none());
    }
}
