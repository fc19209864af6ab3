// canopen-threads/src/errors.rs
//
// Errors for the CANopen thread harness.
//
// This file is part of the Rust 'canopen-threads' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Harness errors.
//!
//! The errors fall into the categories that the supervising loop needs to
//! tell apart:
//!
//! ```text
//! Setup          => init failed, no thread should be started
//! Wait/Timer/Rx  => fatal at runtime, `process` returns and the loop exits
//! Closed         => the context was already torn down
//! ```
//!
//! Transient conditions (an interrupted wait, a drained non-blocking
//! descriptor) never surface as an `Error`. They are recognized with
//! [`ShouldRetry`] and swallowed where they occur.

use nix::errno::Errno;
use std::io;
use thiserror::Error;

/// The result type used throughout the harness.
pub type Result<T> = std::result::Result<T, Error>;

/// A harness error.
#[derive(Error, Debug)]
pub enum Error {
    /// Creating or registering a timer, event channel or multiplexor failed.
    #[error("setup of {what} failed: {source}")]
    Setup {
        /// The resource that could not be set up
        what: &'static str,
        /// The underlying OS error
        source: Errno,
    },
    /// The event multiplexor returned an unrecoverable error.
    #[error("event multiplexor wait failed: {0}")]
    Wait(#[source] Errno),
    /// Reading the expiry count of an interval timer failed.
    #[error("interval timer read failed: {0}")]
    Timer(#[source] Errno),
    /// Reading or writing a wakeup/shutdown event channel failed.
    #[error("event channel failed: {0}")]
    Notify(#[source] Errno),
    /// A CAN interface could not be opened.
    #[error("unable to open CAN interface '{iface}': {source}")]
    Open {
        /// The interface name, like "can0"
        iface: String,
        /// The underlying I/O error
        source: io::Error,
    },
    /// A CAN receive socket failed or was closed.
    #[error("CAN receive on '{iface}' failed: {source}")]
    Rx {
        /// The interface name, like "can0"
        iface: String,
        /// The underlying I/O error
        source: io::Error,
    },
    /// The realtime thread could not be started, or it panicked.
    #[error("realtime thread failed: {0}")]
    Thread(#[source] io::Error),
    /// The context has already been closed.
    #[error("context is closed")]
    Closed,
    /// The stack failed to initialize for a communication reset.
    #[error("CANopen stack init failed: {0}")]
    Stack(String),
}

impl Error {
    /// Creates a setup error for the named resource.
    pub(crate) fn setup(what: &'static str) -> impl FnOnce(Errno) -> Self {
        move |source| Error::Setup { what, source }
    }

    /// Whether the error came from a failed init.
    pub fn is_setup(&self) -> bool {
        matches!(self, Error::Setup { .. })
    }
}

/// Check an OS error for a transient condition.
///
/// A wait that was interrupted by a signal, or a read from a non-blocking
/// descriptor that has nothing left, is not a failure. This trait adds a
/// `should_retry` method to the error types the harness deals with.
pub trait ShouldRetry {
    /// If `true`, the operation can simply be retried (or, for a drain
    /// loop, stopped).
    fn should_retry(&self) -> bool;
}

impl ShouldRetry for Errno {
    fn should_retry(&self) -> bool {
        // EAGAIN and EWOULDBLOCK are the same value on Linux
        matches!(*self, Errno::EINTR | Errno::EAGAIN)
    }
}

impl ShouldRetry for io::Error {
    fn should_retry(&self) -> bool {
        matches!(
            self.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
        )
    }
}

impl<T, E: ShouldRetry> ShouldRetry for std::result::Result<T, E> {
    fn should_retry(&self) -> bool {
        match *self {
            Err(ref e) => e.should_retry(),
            _ => false,
        }
    }
}

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_retry() {
        assert!(Errno::EINTR.should_retry());
        assert!(Errno::EAGAIN.should_retry());
        assert!(Errno::EWOULDBLOCK.should_retry());
        assert!(!Errno::EBADF.should_retry());
        assert!(!Errno::EINVAL.should_retry());
    }

    #[test]
    fn test_io_retry() {
        let e = io::Error::from(io::ErrorKind::WouldBlock);
        assert!(e.should_retry());

        let e = io::Error::from_raw_os_error(libc::EINTR);
        assert!(e.should_retry());

        let e = io::Error::from_raw_os_error(libc::ENETDOWN);
        assert!(!e.should_retry());

        let res: std::result::Result<(), io::Error> = Ok(());
        assert!(!res.should_retry());
    }

    #[test]
    fn test_setup_display() {
        let err = Error::setup("interval timer")(Errno::EMFILE);
        assert!(err.is_setup());
        assert!(err.to_string().starts_with("setup of interval timer failed"));
        assert!(!Error::Closed.is_setup());
    }
}
