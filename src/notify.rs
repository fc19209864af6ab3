// canopen-threads/src/notify.rs
//
// The notification bridge from the realtime side to the mainline.
//
// This file is part of the Rust 'canopen-threads' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Notification bridge.
//!
//! When the stack's internals find that the mainline has work pending
//! (an SDO request was received, an emergency must be sent, ...), they call
//! [`Notifier::notify`]. Depending on how the mainline is driven, that
//! either calls back into the application, or writes a token to the
//! mainline's [`WakeupEvent`].
//!
//! The bridge is strictly one way. It is fired from the realtime thread
//! (or whatever thread runs the stack's receive path) and only ever wakes
//! the mainline.

use crate::{
    errors::{Error, Result},
    timer::read_counter,
};
use nix::{
    errno::Errno,
    sys::eventfd::{EfdFlags, EventFd},
};
use std::{
    fmt,
    os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd},
    sync::Arc,
};

/// An application callback fired when the mainline has work to do.
///
/// It runs on the notifying thread, which is typically the realtime thread,
/// so it must not block.
pub type WakeupCallback = Arc<dyn Fn() + Send + Sync>;

// ===== WakeupEvent =====

/// A user-space event channel whose only purpose is to wake a blocked
/// multiplexor wait.
///
/// This is a non-blocking `eventfd`. Writes add to a counter and reads
/// return and clear it, so any number of notifications that arrive before
/// the reader gets to it collapse into a single wake.
#[derive(Debug)]
pub struct WakeupEvent(EventFd);

impl WakeupEvent {
    /// Creates a new, unsignalled event.
    pub fn new() -> Result<Self> {
        EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
            .map(Self)
            .map_err(Error::setup("wakeup event"))
    }

    /// Signals the event.
    ///
    /// This never blocks. If the counter is somehow saturated, the event is
    /// already signalled and the write is dropped.
    pub fn signal(&self) -> Result<()> {
        match self.0.write(1) {
            Ok(_) | Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(Error::Notify(e)),
        }
    }

    /// Reads and clears the event, returning the number of signals that
    /// were collapsed into it. Zero means it was not signalled.
    pub fn drain(&self) -> Result<u64> {
        read_counter(self.as_raw_fd()).map_err(Error::Notify)
    }
}

impl AsFd for WakeupEvent {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl AsRawFd for WakeupEvent {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_fd().as_raw_fd()
    }
}

// ===== Notifier =====

/// The "mainline has work pending" upcall, as installed into the stack.
#[derive(Clone)]
pub enum Notifier {
    /// Call the application's callback (basic mainline).
    Callback(WakeupCallback),
    /// Write a token to the mainline's wakeup event (blocking mainline).
    Event(Arc<WakeupEvent>),
}

impl Notifier {
    /// Tells the mainline that it has work to do.
    ///
    /// This is wait-free apart from the callback the application supplied.
    pub fn notify(&self) {
        match self {
            Notifier::Callback(cb) => cb(),
            Notifier::Event(ev) => {
                if let Err(err) = ev.signal() {
                    // Nothing sensible to do on the notifying thread. The
                    // mainline still wakes on its next interval.
                    log::debug!("Unable to signal mainline wakeup: {}", err);
                }
            }
        }
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Notifier::Callback(_) => f.write_str("Notifier::Callback"),
            Notifier::Event(ev) => write!(f, "Notifier::Event(fd {})", ev.as_raw_fd()),
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
