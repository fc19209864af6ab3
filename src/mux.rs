// canopen-threads/src/mux.rs
//
// Level-triggered event multiplexor built on Linux epoll.
//
// This file is part of the Rust 'canopen-threads' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Event multiplexor.
//!
//! Each loop blocks in exactly one place: [`Poller::wait`]. The poller is
//! level triggered, so a descriptor that was not fully drained in one cycle
//! is reported again in the next one.
//!
//! Descriptors are added through a [`Registry`], which hands out a
//! [`Token`] for each one. The realtime driver registers its own timer and
//! shutdown channel, then passes the registry to the CAN driver so it can
//! attach its receive sockets. The driver never sees the poller itself.

use crate::errors::{Error, Result};
use bitflags::bitflags;
use nix::{
    errno::Errno,
    sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout},
};
use std::{
    fmt,
    os::unix::io::{AsFd, AsRawFd, RawFd},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Identifies a registered descriptor in the readiness events.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub u64);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    /// Readiness reported for a descriptor.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Ready: u32 {
        /// Data can be read
        const READABLE = 0x01;
        /// The peer hung up or the descriptor was shut down
        const HANGUP = 0x02;
        /// An error condition is pending on the descriptor
        const ERROR = 0x04;
    }
}

impl Ready {
    fn from_epoll(flags: EpollFlags) -> Self {
        let mut ready = Ready::empty();
        if flags.contains(EpollFlags::EPOLLIN) {
            ready |= Ready::READABLE;
        }
        if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP) {
            ready |= Ready::HANGUP;
        }
        if flags.contains(EpollFlags::EPOLLERR) {
            ready |= Ready::ERROR;
        }
        ready
    }

    /// Whether the descriptor is closed or failed, rather than just readable.
    pub fn is_fatal(&self) -> bool {
        self.intersects(Ready::HANGUP | Ready::ERROR)
    }
}

/// A readiness event: which descriptor, and what it is ready for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Event {
    /// The token the descriptor was registered with
    pub token: Token,
    /// What the descriptor is ready for
    pub ready: Ready,
}

// ===== Registry =====

/// The capability to add and remove descriptors from a poller.
///
/// This is cheap to clone and may be used from any thread; the kernel
/// serializes changes to the interest list.
#[derive(Debug, Clone)]
pub struct Registry {
    epoll: Arc<Epoll>,
    next_token: Arc<AtomicU64>,
}

impl Registry {
    /// Registers a descriptor for read readiness, returning a new token
    /// for it.
    pub fn register<F: AsFd>(&self, fd: F) -> Result<Token> {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.register_with(fd, token)?;
        Ok(token)
    }

    /// Registers a descriptor for read readiness under a caller-chosen
    /// token.
    pub fn register_with<F: AsFd>(&self, fd: F, token: Token) -> Result<()> {
        let raw = fd.as_fd().as_raw_fd();
        let ev = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP, token.0);
        self.epoll
            .add(fd, ev)
            .map_err(Error::setup("multiplexor registration"))?;
        log::trace!("Registered fd {} as {}", raw, token);
        Ok(())
    }

    /// Removes a descriptor from the poller.
    ///
    /// Descriptors are also removed implicitly by the kernel when they are
    /// closed, so this is only needed for descriptors that outlive their
    /// registration.
    pub fn deregister<F: AsFd>(&self, fd: F) -> Result<()> {
        match self.epoll.delete(fd) {
            // Already gone
            Ok(()) | Err(Errno::ENOENT) | Err(Errno::EBADF) => Ok(()),
            Err(e) => Err(Error::setup("multiplexor deregistration")(e)),
        }
    }
}

// ===== Poller =====

/// The blocking half of the multiplexor.
pub struct Poller {
    registry: Registry,
    events: Vec<EpollEvent>,
}

impl Poller {
    /// Tokens below this value are reserved for the harness itself.
    pub const FIRST_DYNAMIC_TOKEN: u64 = 16;

    /// Creates a poller that can report up to `capacity` ready descriptors
    /// per wait.
    pub fn new(capacity: usize) -> Result<Self> {
        let epoll =
            Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(Error::setup("multiplexor"))?;
        Ok(Self {
            registry: Registry {
                epoll: Arc::new(epoll),
                next_token: Arc::new(AtomicU64::new(Self::FIRST_DYNAMIC_TOKEN)),
            },
            events: vec![EpollEvent::empty(); capacity.max(1)],
        })
    }

    /// The registration capability for this poller.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Blocks until at least one registered descriptor is ready.
    ///
    /// An interrupted wait is retried transparently; any other failure is
    /// fatal. The ready events are pushed onto `ready`, which is cleared
    /// first.
    pub fn wait(&mut self, ready: &mut Vec<Event>) -> Result<usize> {
        ready.clear();
        let n = loop {
            match self.registry.epoll.wait(&mut self.events, EpollTimeout::NONE) {
                Ok(0) => continue,
                Ok(n) => break n,
                Err(Errno::EINTR) => {
                    log::trace!("Multiplexor wait interrupted, retrying");
                    continue;
                }
                Err(e) => {
                    log::error!("Multiplexor wait failed: {}", e);
                    return Err(Error::Wait(e));
                }
            }
        };

        ready.extend(self.events[..n].iter().map(|ev| Event {
            token: Token(ev.data()),
            ready: Ready::from_epoll(ev.events()),
        }));
        Ok(n)
    }
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Poller")
            .field("fd", &self.as_raw_fd())
            .field("capacity", &self.events.len())
            .finish()
    }
}

impl AsRawFd for Poller {
    fn as_raw_fd(&self) -> RawFd {
        self.registry.epoll.0.as_raw_fd()
    }
}

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::eventfd::{EfdFlags, EventFd};

    fn event_fd() -> EventFd {
        EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK).unwrap()
    }

    #[test]
    fn test_tokens_are_unique() {
        let poller = Poller::new(4).unwrap();
        let a = event_fd();
        let b = event_fd();

        let ta = poller.registry().register(&a).unwrap();
        let tb = poller.registry().clone().register(&b).unwrap();
        assert_ne!(ta, tb);
        assert!(ta.0 >= Poller::FIRST_DYNAMIC_TOKEN);
    }

    #[test]
    fn test_level_triggered() {
        let mut poller = Poller::new(4).unwrap();
        let efd = event_fd();
        poller.registry().register_with(&efd, Token(3)).unwrap();

        efd.write(1).unwrap();

        let mut ready = Vec::new();
        // Not drained, so it must be reported again
        for _ in 0..2 {
            assert_eq!(poller.wait(&mut ready).unwrap(), 1);
            assert_eq!(ready[0].token, Token(3));
            assert!(ready[0].ready.contains(Ready::READABLE));
            assert!(!ready[0].ready.is_fatal());
        }
    }

    #[test]
    fn test_deregister() {
        let poller = Poller::new(1).unwrap();
        let efd = event_fd();
        poller.registry().register(&efd).unwrap();
        poller.registry().deregister(&efd).unwrap();
        // A second removal is not an error
        poller.registry().deregister(&efd).unwrap();
    }

    #[test]
    fn test_ready_flags() {
        let r = Ready::from_epoll(EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP);
        assert!(r.contains(Ready::READABLE));
        assert!(r.is_fatal());
        assert!(!Ready::from_epoll(EpollFlags::EPOLLIN).is_fatal());
    }
}
