// canopen-threads/src/driver.rs
//
// The CAN receive driver interface and its SocketCAN implementation.
//
// This file is part of the Rust 'canopen-threads' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! CAN receive drivers.
//!
//! The realtime thread waits on a single multiplexor. The CAN driver adds
//! its receive sockets to it through the [`Registry`] it is handed at
//! init, and later gets called back with the token of each socket that
//! became readable. It then reads the frames and pushes them into the
//! stack's receive path.
//!
//! [`SocketCanDriver`] is the driver for Linux SocketCAN raw sockets, for
//! any number of interfaces.

use crate::{
    errors::{Error, Result, ShouldRetry},
    mux::{Ready, Registry, Token},
    stack::CanRxSink,
};
use itertools::Itertools;
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Frame, Socket, SocketOptions};
use std::{
    io,
    os::unix::io::{AsFd, AsRawFd},
    sync::Arc,
};

/// Upper bound on the frames read from one socket per realtime cycle.
///
/// The multiplexor is level triggered, so anything left over is picked up
/// on the next cycle, after the SYNC/PDO steps had their turn.
pub const MAX_FRAMES_PER_WAKE: usize = 32;

/// The receive half of a CAN driver, as seen by the realtime thread.
pub trait CanRxDriver: Send {
    /// Attaches all receive sockets to the realtime multiplexor.
    fn register(&mut self, registry: &Registry) -> Result<()>;

    /// Detaches the receive sockets again.
    fn deregister(&mut self, registry: &Registry) -> Result<()>;

    /// Whether the token belongs to one of this driver's sockets.
    fn owns(&self, token: Token) -> bool;

    /// Receives the pending frames on the socket behind `token` and
    /// dispatches them into the stack.
    ///
    /// Returns the number of frames dispatched. Transient conditions must
    /// be absorbed here; an `Err` is fatal for the realtime loop.
    fn dispatch(&mut self, token: Token, ready: Ready) -> Result<usize>;
}

/// Formats a frame the way `candump` does, for trace logging.
fn frame_to_string(frame: &CanFrame) -> String {
    let data = frame
        .data()
        .iter()
        .map(|b| format!("{:02X}", b))
        .join(" ");
    format!("{:03X} [{}] {}", frame.raw_id(), frame.dlc(), data)
}

// ===== SocketCanDriver =====

#[derive(Debug)]
struct Interface {
    name: String,
    socket: Arc<CanSocket>,
    token: Option<Token>,
}

/// A CAN driver over one or more SocketCAN interfaces.
///
/// Frames from every interface are pushed into the same receive sink,
/// tagged with the index of the interface they arrived on (the position in
/// the list given to [`SocketCanDriver::open`]).
#[derive(Debug)]
pub struct SocketCanDriver<R> {
    ifaces: Vec<Interface>,
    sink: Arc<R>,
}

impl<R: CanRxSink> SocketCanDriver<R> {
    /// Opens the named interfaces, like `["can0", "vcan0"]`.
    ///
    /// The sockets are non-blocking and receive bus error frames in
    /// addition to the normal traffic.
    pub fn open<S: AsRef<str>>(ifnames: &[S], sink: Arc<R>) -> Result<Self> {
        let ifaces = ifnames
            .iter()
            .map(|name| {
                let name = name.as_ref();
                Self::open_socket(name).map(|socket| Interface {
                    name: name.to_string(),
                    socket: Arc::new(socket),
                    token: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { ifaces, sink })
    }

    fn open_socket(name: &str) -> Result<CanSocket> {
        let err = |source| Error::Open {
            iface: name.to_string(),
            source,
        };
        let sock = CanSocket::open(name).map_err(err)?;
        sock.set_nonblocking(true).map_err(err)?;
        sock.set_error_filter_accept_all().map_err(err)?;
        log::debug!("Opened CAN interface '{}' (fd {})", name, sock.as_raw_fd());
        Ok(sock)
    }

    /// The number of interfaces.
    pub fn len(&self) -> usize {
        self.ifaces.len()
    }

    /// Whether the driver has no interfaces at all.
    pub fn is_empty(&self) -> bool {
        self.ifaces.is_empty()
    }

    /// Gets a transmit handle for interface number `iface`.
    pub fn sender(&self, iface: usize) -> Option<CanSender> {
        self.ifaces.get(iface).map(|i| CanSender {
            iface: i.name.clone(),
            socket: i.socket.clone(),
        })
    }

    fn read_pending(&self, idx: usize) -> Result<usize> {
        let iface = &self.ifaces[idx];
        let mut n = 0;

        while n < MAX_FRAMES_PER_WAKE {
            match iface.socket.read_frame() {
                Ok(CanFrame::Error(frame)) => {
                    self.sink.rx_error(idx, frame.into_error());
                }
                Ok(frame) => {
                    if log::log_enabled!(log::Level::Trace) {
                        log::trace!("{}  {}", iface.name, frame_to_string(&frame));
                    }
                    self.sink.rx(idx, &frame);
                    n += 1;
                }
                Err(e) if e.should_retry() => break,
                Err(e) if e.raw_os_error() == Some(libc::ENETDOWN) => {
                    // The interface went down. Report once and keep the
                    // socket, it resumes when the interface comes back up.
                    log::warn!("CAN interface '{}' is down", iface.name);
                    break;
                }
                Err(e) => {
                    log::error!("CAN receive on '{}' failed: {}", iface.name, e);
                    return Err(Error::Rx {
                        iface: iface.name.clone(),
                        source: e,
                    });
                }
            }
        }
        Ok(n)
    }
}

impl<R: CanRxSink> CanRxDriver for SocketCanDriver<R> {
    fn register(&mut self, registry: &Registry) -> Result<()> {
        for iface in self.ifaces.iter_mut() {
            iface.token = Some(registry.register(iface.socket.as_fd())?);
        }
        Ok(())
    }

    fn deregister(&mut self, registry: &Registry) -> Result<()> {
        for iface in self.ifaces.iter_mut() {
            if iface.token.take().is_some() {
                registry.deregister(iface.socket.as_fd())?;
            }
        }
        Ok(())
    }

    fn owns(&self, token: Token) -> bool {
        self.ifaces.iter().any(|i| i.token == Some(token))
    }

    fn dispatch(&mut self, token: Token, ready: Ready) -> Result<usize> {
        let idx = match self.ifaces.iter().position(|i| i.token == Some(token)) {
            Some(idx) => idx,
            None => return Ok(0),
        };

        if ready.contains(Ready::HANGUP) && !ready.contains(Ready::READABLE) {
            let iface = &self.ifaces[idx];
            log::error!("CAN socket for '{}' was closed", iface.name);
            return Err(Error::Rx {
                iface: iface.name.clone(),
                source: io::ErrorKind::BrokenPipe.into(),
            });
        }
        self.read_pending(idx)
    }
}

// ===== CanSender =====

/// A transmit handle on one interface of a [`SocketCanDriver`].
///
/// The socket is shared with the receive side. It is non-blocking, so a
/// full transmit queue shows up as a `WouldBlock` error; the retry policy
/// belongs to the stack.
#[derive(Debug, Clone)]
pub struct CanSender {
    iface: String,
    socket: Arc<CanSocket>,
}

impl CanSender {
    /// The name of the interface the sender writes to.
    pub fn iface(&self) -> &str {
        &self.iface
    }

    /// Writes a frame to the bus.
    pub fn send(&self, frame: &CanFrame) -> io::Result<()> {
        self.socket.write_frame(frame)
    }
}

/////////////////////////////////////////////////////////////////////////////
