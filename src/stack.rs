// canopen-threads/src/stack.rs
//
// The interface to the CANopen stack driven by the harness.
//
// This file is part of the Rust 'canopen-threads' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! CANopen stack interface.
//!
//! The harness does not know anything about object dictionaries, SDO, PDO
//! or NMT. It only calls into the stack through the traits here:
//!
//! - [`MainlineStack`] is the slow, non-realtime processing step
//!   (heartbeat, emergency, SDO server, NMT state).
//! - [`RealtimeStack`] holds the per-tick SYNC, RPDO and TPDO steps.
//! - [`CanRxSink`] is the stack's receive path, fed by the CAN driver.
//!
//! All methods take `&self`. Both threads call into the same stack object,
//! and the stack is expected to protect its shared state (the object
//! dictionary in particular) with its own short critical sections. The
//! harness adds no locking of its own.

use crate::notify::Notifier;
use socketcan::{CanError, CanFrame};
use std::fmt;

/// The reset command returned from a mainline processing step.
///
/// This is a control-flow signal for the supervisor, not an error.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ResetCommand {
    /// Keep running
    #[default]
    None,
    /// Reset communication: re-init the stack and the mainline, keep the
    /// realtime thread running
    Communication,
    /// Reset the application: stop everything and restart
    Application,
    /// Stop everything and exit
    Quit,
}

impl ResetCommand {
    /// Whether the realtime thread has to be stopped for this command.
    pub fn stops_realtime(&self) -> bool {
        matches!(self, ResetCommand::Application | ResetCommand::Quit)
    }
}

impl fmt::Display for ResetCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ResetCommand::*;
        let s = match *self {
            None => "none",
            Communication => "reset communication",
            Application => "reset application",
            Quit => "quit",
        };
        f.write_str(s)
    }
}

/// The outcome of one mainline processing step.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct MainlineStep {
    /// What the supervisor has to do next
    pub reset: ResetCommand,
    /// The stack would like to run again within this many microseconds.
    /// The blocking mainline shortens its next wake accordingly.
    pub timer_next_us: Option<u32>,
}

impl MainlineStep {
    /// A step that requests an earlier wake.
    pub fn with_timer_next(reset: ResetCommand, timer_next_us: u32) -> Self {
        Self {
            reset,
            timer_next_us: Some(timer_next_us),
        }
    }
}

impl From<ResetCommand> for MainlineStep {
    fn from(reset: ResetCommand) -> Self {
        Self {
            reset,
            timer_next_us: None,
        }
    }
}

/// The elapsed realtime intervals handed to the SYNC/PDO steps.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Tick {
    /// Number of timer intervals that elapsed since the previous steps
    pub count: u32,
    /// The same span in microseconds (`count * interval`)
    pub elapsed_us: u32,
}

impl Tick {
    /// Creates a tick for `count` intervals of `interval_us` each.
    pub fn new(count: u32, interval_us: u32) -> Self {
        Self {
            count,
            elapsed_us: count.saturating_mul(interval_us),
        }
    }
}

/// The non-realtime part of the stack.
pub trait MainlineStack: Send + Sync {
    /// Runs the one-shot mainline processing.
    ///
    /// `elapsed_us` is the time since the previous call. This must not
    /// block or sleep, but it may transmit CAN frames.
    fn process(&self, elapsed_us: u32) -> MainlineStep;

    /// Installs, or with `None` clears, the "mainline has work pending"
    /// upcall.
    fn set_mainline_notifier(&self, notifier: Option<Notifier>);
}

/// The realtime part of the stack, run once per timer cycle.
pub trait RealtimeStack: Send + Sync {
    /// Whether the CAN module is in normal mode. While it isn't, the timer
    /// ticks are consumed but the SYNC/PDO steps are skipped.
    fn can_normal(&self) -> bool {
        true
    }

    /// SYNC processing. Returns whether a SYNC was received or transmitted.
    fn process_sync(&self, tick: Tick) -> bool;

    /// Received PDO processing.
    fn process_rpdo(&self, sync_was: bool, tick: Tick);

    /// Transmitted PDO processing.
    fn process_tpdo(&self, sync_was: bool, tick: Tick);
}

/// The receive path of the stack.
///
/// Called from the realtime thread for every frame the CAN driver reads.
pub trait CanRxSink: Send + Sync {
    /// A data or remote frame was received on interface number `iface`.
    fn rx(&self, iface: usize, frame: &CanFrame);

    /// An error frame was received on interface number `iface`.
    fn rx_error(&self, iface: usize, err: CanError) {
        log::debug!("CAN error on interface {}: {}", iface, err);
    }
}

/// A complete CANopen node, as needed by the
/// [`Supervisor`](crate::supervisor::Supervisor).
pub trait CanOpenNode: MainlineStack + RealtimeStack {
    /// (Re)initializes the stack's communication objects at the start of
    /// every communication reset cycle.
    fn communication_reset(&self) -> crate::Result<()>;

    /// Puts the stack into a quiescent state at the end of the program.
    /// After this returns the stack must not fire its notifier.
    fn shutdown(&self) {}
}

/////////////////////////////////////////////////////////////////////////////
