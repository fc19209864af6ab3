// canopen-threads/src/lib.rs
//
// The top-level library for the CANopen thread harness.
//
// This file is part of the Rust 'canopen-threads' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Two-thread execution harness for a CANopen stack on Linux SocketCAN.
//!
//! A CANopen node has two very different kinds of work. The time critical
//! part (receiving CAN frames, SYNC, and the receive and transmit PDOs)
//! has to run on a tight, regular schedule. Everything else (SDO
//! transfers, NMT, heartbeat and emergency handling, storage) only needs
//! to run "soon enough", but it must run promptly when the stack has
//! something pending.
//!
//! This crate drives a CANopen stack with two threads:
//!
//! - A **realtime** thread, run by [`Realtime`]. It blocks on an interval
//!   timer (typically 1 ms) and on the CAN receive sockets. It dispatches
//!   received frames into the stack, then runs the stack's SYNC, RPDO and
//!   TPDO steps once per expired interval.
//!
//! - A **mainline** thread, run either by [`MainlineWait`], which blocks on
//!   an interval timer (typically 50 ms) and a wakeup event, or by
//!   [`Mainline`], a non-blocking pump for applications that have their
//!   own event loop.
//!
//! The two are tied together by the notification bridge: when the stack
//! has mainline work pending, usually because a frame arrived on the
//! realtime thread, it calls the [`Notifier`] the mainline driver installed
//! in it, which wakes the mainline right away.
//!
//! The [`Supervisor`] runs both threads and the communication reset cycles
//! of the node.
//!
//! # The stack
//!
//! The CANopen stack itself is not part of this crate. It plugs in through
//! the traits in the [`stack`] module. The stack must serialize access to
//! its own object dictionary; the harness adds no locking around it.
//!
//! # Contexts
//!
//! All the driver contexts are plain values owned by the application, so
//! more than one node can run in a process.

pub use embedded_can;
pub use socketcan;

mod errors;
pub use errors::{Error, Result, ShouldRetry};

pub mod clock;
pub use clock::MonotonicClock;

pub mod timer;
pub use timer::IntervalTimer;

pub mod mux;
pub use mux::{Event, Poller, Ready, Registry, Token};

pub mod notify;
pub use notify::{Notifier, WakeupCallback, WakeupEvent};

pub mod stack;
pub use stack::{
    CanOpenNode, CanRxSink, MainlineStack, MainlineStep, RealtimeStack, ResetCommand, Tick,
};

pub mod driver;
pub use driver::{CanRxDriver, CanSender, SocketCanDriver};

pub mod mainline;
pub use mainline::Mainline;

pub mod mainline_wait;
pub use mainline_wait::{MainlineWait, MainlineWake, MainlineWaker};

pub mod realtime;
pub use realtime::{Cycle, Realtime, RealtimeShutdown};

pub mod supervisor;
pub use supervisor::{Exit, Supervisor, SupervisorHandle};
