// canopen-threads/src/supervisor.rs
//
// Lifecycle coordination of the realtime and mainline threads.
//
// This file is part of the Rust 'canopen-threads' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Lifecycle supervisor.
//!
//! The supervisor runs the blocking mainline on the calling thread and the
//! realtime loop on a thread of its own:
//!
//! ```text
//! node.communication_reset()
//! mainline.init(node)
//! start realtime thread
//! loop {
//!     process() until the node asks for a reset
//!     mainline.close()
//!     communication reset => reset node, mainline.init(node), loop again
//!     application reset or quit => break
//! }
//! stop and join realtime thread
//! node.shutdown()
//! ```
//!
//! The realtime thread is only started once the stack has its mainline
//! notifier, so no frame is received without a way to wake the mainline.
//!
//! The realtime thread keeps running across communication resets. The
//! mainline context is created once, in [`Supervisor::new`], and lives
//! for as long as the supervisor does, so [`Supervisor::run`] can be called
//! again after an application reset.

use crate::{
    driver::CanRxDriver,
    errors::{Error, Result},
    mainline_wait::{MainlineWait, MainlineWaker},
    realtime::{Realtime, RealtimeShutdown},
    stack::{CanOpenNode, ResetCommand},
};
use nix::errno::Errno;
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

/// Why [`Supervisor::run`] returned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Exit {
    /// The node asked for an application reset. The application may
    /// re-initialize its node and call `run` again.
    Application,
    /// The node, or a [`SupervisorHandle`], asked to quit.
    Quit,
}

/// Runs a CANopen node on the two harness threads.
#[derive(Debug)]
pub struct Supervisor<N: CanOpenNode> {
    node: Arc<N>,
    mainline: MainlineWait<N>,
    realtime_interval_us: u32,
    quit: Arc<AtomicBool>,
}

impl<N: CanOpenNode + 'static> Supervisor<N> {
    /// Creates the supervisor and its blocking mainline context.
    ///
    /// Nothing runs yet; both intervals are checked here, so a bad
    /// configuration fails before any thread is started.
    pub fn new(
        node: Arc<N>,
        realtime_interval_us: u32,
        mainline_interval_us: u32,
    ) -> Result<Self> {
        if realtime_interval_us == 0 {
            return Err(Error::setup("realtime interval")(Errno::EINVAL));
        }
        let mainline = MainlineWait::init_once(mainline_interval_us)?;
        Ok(Self {
            node,
            mainline,
            realtime_interval_us,
            quit: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The node being run.
    pub fn node(&self) -> &Arc<N> {
        &self.node
    }

    /// Gets a handle that can ask a running supervisor to quit.
    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            quit: self.quit.clone(),
            waker: self.mainline.waker(),
        }
    }

    /// Runs the node until it asks for an application reset or to quit.
    ///
    /// The first communication reset and the wakeup bridge are in place
    /// before the realtime thread arms the CAN receive sockets. The CAN
    /// driver is moved to the realtime thread and handed back with the exit
    /// reason, so it can be used for the next run.
    ///
    /// A quit requested before or between runs is not lost: `run` then
    /// returns [`Exit::Quit`] without starting anything.
    pub fn run<D>(&mut self, driver: D) -> Result<(Exit, D)>
    where
        D: CanRxDriver + 'static,
    {
        if self.quit.swap(false, Ordering::SeqCst) {
            log::debug!("Supervisor exit: quit requested before start");
            return Ok((Exit::Quit, driver));
        }

        let started = self
            .start_cycle()
            .and_then(|_| Realtime::init(self.realtime_interval_us, self.node.clone(), driver))
            .and_then(|rt| {
                let shutdown = rt.shutdown_handle();
                spawn_realtime(rt, self.mainline.waker()).map(|th| (shutdown, th))
            });
        let (shutdown, rt_thread) = match started {
            Ok(started) => started,
            Err(err) => {
                self.mainline.close();
                return Err(err);
            }
        };

        let res = self.run_cycles(&rt_thread);
        self.mainline.close();

        let stopped = stop_realtime(&shutdown, rt_thread);
        self.node.shutdown();

        // A failed realtime thread is the cause of a mainline error, if any
        let driver = stopped?;
        let exit = res?;
        log::debug!("Supervisor exit: {:?}", exit);
        Ok((exit, driver))
    }

    // Communication reset of the node, then the bridge into it
    fn start_cycle(&mut self) -> Result<()> {
        self.node.communication_reset()?;
        self.mainline.init(self.node.clone())
    }

    // Runs the mainline cycles. The first cycle has already been started.
    fn run_cycles<T>(&mut self, rt_thread: &JoinHandle<T>) -> Result<Exit> {
        loop {
            let reset = loop {
                let wake = self.mainline.process()?;
                if self.quit.swap(false, Ordering::SeqCst) {
                    break ResetCommand::Quit;
                }
                if rt_thread.is_finished() {
                    log::error!("Realtime thread stopped");
                    return Err(Error::Closed);
                }
                if wake.reset != ResetCommand::None {
                    break wake.reset;
                }
            };
            self.mainline.close();
            log::debug!("Reset: {}", reset);

            match reset {
                ResetCommand::Communication => self.start_cycle()?,
                ResetCommand::Application => return Ok(Exit::Application),
                ResetCommand::Quit | ResetCommand::None => return Ok(Exit::Quit),
            }
        }
    }
}

fn spawn_realtime<N, D>(
    mut rt: Realtime<N, D>,
    waker: MainlineWaker,
) -> Result<JoinHandle<Result<D>>>
where
    N: CanOpenNode + 'static,
    D: CanRxDriver + 'static,
{
    thread::Builder::new()
        .name("co-realtime".into())
        .spawn(move || {
            if let Err(err) = rt.run() {
                log::error!("Realtime loop failed: {}", err);
                // Get the mainline to notice right away
                if let Err(err) = waker.wake() {
                    log::debug!("Unable to wake the mainline: {}", err);
                }
                return Err(err);
            }
            rt.close()
        })
        .map_err(Error::Thread)
}

fn stop_realtime<D>(shutdown: &RealtimeShutdown, rt_thread: JoinHandle<Result<D>>) -> Result<D> {
    shutdown.shutdown()?;
    rt_thread.join().map_err(|_| {
        Error::Thread(io::Error::new(
            io::ErrorKind::Other,
            "realtime thread panicked",
        ))
    })?
}

// ===== SupervisorHandle =====

/// Asks a running [`Supervisor`] to quit, from any thread.
///
/// Meant for signal handlers and the like. The request is seen at the next
/// mainline wake, which this triggers right away.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    quit: Arc<AtomicBool>,
    waker: MainlineWaker,
}

impl SupervisorHandle {
    /// Requests the supervisor to quit.
    pub fn quit(&self) -> Result<()> {
        self.quit.store(true, Ordering::SeqCst);
        self.waker.wake()
    }

    /// Whether a quit request is pending, i.e. not yet acted on by the
    /// supervisor.
    pub fn is_quit(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }
}

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mux::{Ready, Registry, Token},
        notify::Notifier,
        stack::{MainlineStack, MainlineStep, RealtimeStack, Tick},
    };
    use std::{
        sync::{atomic::AtomicU32, Mutex},
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

    // Returns the scripted resets, one per mainline step, then None
    #[derive(Default)]
    struct Node {
        script: Mutex<Vec<ResetCommand>>,
        resets: AtomicU32,
        shutdowns: AtomicU32,
        notifier: Mutex<Option<Notifier>>,
        synced: AtomicBool,
        bridge_at_first_sync: AtomicBool,
    }

    impl Node {
        fn scripted(mut resets: Vec<ResetCommand>) -> Self {
            resets.reverse();
            Self {
                script: Mutex::new(resets),
                ..Default::default()
            }
        }
    }

    impl MainlineStack for Node {
        fn process(&self, _elapsed_us: u32) -> MainlineStep {
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_default()
                .into()
        }

        fn set_mainline_notifier(&self, notifier: Option<Notifier>) {
            *self.notifier.lock().unwrap() = notifier;
        }
    }

    impl RealtimeStack for Node {
        fn process_sync(&self, _tick: Tick) -> bool {
            if !self.synced.swap(true, Ordering::SeqCst) {
                let bridge = self.notifier.lock().unwrap().is_some();
                self.bridge_at_first_sync.store(bridge, Ordering::SeqCst);
            }
            false
        }

        fn process_rpdo(&self, _sync_was: bool, _tick: Tick) {}

        fn process_tpdo(&self, _sync_was: bool, _tick: Tick) {}
    }

    impl CanOpenNode for Node {
        fn communication_reset(&self) -> Result<()> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_reset_cycles() {
        use ResetCommand::*;

        let node = Arc::new(Node::scripted(vec![
            None,
            Communication,
            None,
            Communication,
            Application,
        ]));
        let mut sup = Supervisor::new(node.clone(), 1_000, 1_000).unwrap();

        let (exit, _driver) = sup.run(NoCan).unwrap();
        assert_eq!(exit, Exit::Application);
        assert_eq!(node.resets.load(Ordering::SeqCst), 3);
        assert_eq!(node.shutdowns.load(Ordering::SeqCst), 1);
        assert!(node.notifier.lock().unwrap().is_none());

        // Restart after an application reset
        node.script.lock().unwrap().push(Quit);
        let (exit, _driver) = sup.run(NoCan).unwrap();
        assert_eq!(exit, Exit::Quit);
        assert_eq!(node.resets.load(Ordering::SeqCst), 4);
        assert_eq!(node.shutdowns.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_handle_quit() {
        let node = Arc::new(Node::default());
        let mut sup = Supervisor::new(node.clone(), 1_000, 10_000_000).unwrap();

        let handle = sup.handle();
        let th = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle.quit().unwrap();
        });

        let t = Instant::now();
        let (exit, _driver) = sup.run(NoCan).unwrap();
        assert_eq!(exit, Exit::Quit);
        assert!(t.elapsed() < Duration::from_secs(2));
        assert_eq!(node.resets.load(Ordering::SeqCst), 1);
        th.join().unwrap();
    }

    #[test]
    fn test_bridge_before_realtime() {
        let node = Arc::new(Node::default());
        let mut sup = Supervisor::new(node.clone(), 1_000, 10_000_000).unwrap();

        let handle = sup.handle();
        let th = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            handle.quit().unwrap();
        });

        sup.run(NoCan).unwrap();
        th.join().unwrap();
        assert!(node.synced.load(Ordering::SeqCst));
        assert!(node.bridge_at_first_sync.load(Ordering::SeqCst));
    }

    #[test]
    fn test_quit_before_run() {
        let node = Arc::new(Node::default());
        let mut sup = Supervisor::new(node.clone(), 1_000, 10_000_000).unwrap();

        let handle = sup.handle();
        handle.quit().unwrap();
        assert!(handle.is_quit());

        let t = Instant::now();
        let (exit, _driver) = sup.run(NoCan).unwrap();
        assert_eq!(exit, Exit::Quit);
        assert!(t.elapsed() < Duration::from_secs(1));
        assert_eq!(node.resets.load(Ordering::SeqCst), 0);
        assert!(!handle.is_quit());
    }

    #[test]
    fn test_quit_between_runs() {
        let node = Arc::new(Node::scripted(vec![ResetCommand::Application]));
        let mut sup = Supervisor::new(node.clone(), 1_000, 1_000).unwrap();
        let handle = sup.handle();

        let (exit, driver) = sup.run(NoCan).unwrap();
        assert_eq!(exit, Exit::Application);

        // Arrives while the application restarts its node
        handle.quit().unwrap();

        let (exit, _driver) = sup.run(driver).unwrap();
        assert_eq!(exit, Exit::Quit);
        assert_eq!(node.resets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_realtime_interval() {
        let node = Arc::new(Node::default());
        let res = Supervisor::new(node, 0, 1_000);
        assert!(matches!(res, Err(ref e) if e.is_setup()));
    }
}
