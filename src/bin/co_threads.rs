// canopen-threads/src/bin/co_threads.rs

//! A minimal CANopen node run on the two harness threads.
//!
//! The node only knows NMT, heartbeat and a SYNC-triggered TPDO, but that
//! is enough to see both threads at work on a live bus:
//!
//! ```text
//! $ co_threads vcan0 -n 5
//! $ candump vcan0
//!   vcan0  705   [1]  00            boot-up
//!   vcan0  705   [1]  7F            heartbeat, pre-operational
//!   ...
//! $ cansend vcan0 000#0105          NMT start node 5
//! $ cansend vcan0 080#              SYNC, node answers with TPDO1 on 185
//! $ cansend vcan0 000#8205          NMT reset communication
//! ```
//!
//! Use `RUST_LOG=debug` (or `trace` for every frame) to follow along.

use anyhow::{anyhow, Context, Result};
use canopen_threads::{
    mainline_wait, realtime, CanOpenNode, CanRxSink, CanSender, Exit, MainlineStack,
    MainlineStep, Notifier, RealtimeStack, ResetCommand, SocketCanDriver, Supervisor, Tick,
};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use embedded_can::{Frame as EmbeddedFrame, StandardId};
use socketcan::{CanError, CanFrame, Frame};
use std::{
    process,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering},
        Arc, Mutex, OnceLock,
    },
};

// Make the app version the same as the package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

const NMT_ID: u16 = 0x000;
const SYNC_ID: u16 = 0x080;
const TPDO1_BASE: u16 = 0x180;
const HEARTBEAT_BASE: u16 = 0x700;

// --------------------------------------------------------------------------

/// The NMT state of the node, as sent in the heartbeat.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum NmtState {
    Initializing = 0x00,
    Stopped = 0x04,
    Operational = 0x05,
    PreOperational = 0x7F,
}

#[derive(Debug)]
struct Mainline {
    nmt: NmtState,
    heartbeat_elapsed_us: u32,
    reset: ResetCommand,
}

/// The demo node.
///
/// The mainline state sits behind a mutex that only the mainline thread
/// takes. Received NMT and SYNC frames are handed over through atomics, and
/// the realtime thread only briefly locks the notifier to wake the mainline.
#[derive(Debug)]
struct DemoNode {
    node_id: u8,
    heartbeat_us: u32,
    tx: OnceLock<CanSender>,
    mainline: Mutex<Mainline>,
    notifier: Mutex<Option<Notifier>>,
    // Last NMT command byte for this node, zero if none
    nmt_pending: AtomicU8,
    operational: AtomicBool,
    sync_pending: AtomicBool,
    sync_count: AtomicU32,
}

impl DemoNode {
    fn new(node_id: u8, heartbeat_ms: u32) -> Self {
        Self {
            node_id,
            heartbeat_us: heartbeat_ms.saturating_mul(1000),
            tx: OnceLock::new(),
            mainline: Mutex::new(Mainline {
                nmt: NmtState::Initializing,
                heartbeat_elapsed_us: 0,
                reset: ResetCommand::None,
            }),
            notifier: Mutex::new(None),
            nmt_pending: AtomicU8::new(0),
            operational: AtomicBool::new(false),
            sync_pending: AtomicBool::new(false),
            sync_count: AtomicU32::new(0),
        }
    }

    fn set_sender(&self, tx: CanSender) {
        if self.tx.set(tx).is_err() {
            log::warn!("CAN sender already set");
        }
    }

    fn send(&self, base: u16, data: &[u8]) {
        let frame = StandardId::new(base + u16::from(self.node_id))
            .and_then(|id| CanFrame::new(id, data));

        if let (Some(tx), Some(frame)) = (self.tx.get(), frame) {
            if let Err(err) = tx.send(&frame) {
                log::warn!("Unable to send on {}: {}", tx.iface(), err);
            }
        }
    }

    fn wake_mainline(&self) {
        let notifier = self.notifier.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(n) = notifier.as_ref() {
            n.notify();
        }
    }

    fn set_nmt(&self, ml: &mut Mainline, nmt: NmtState) {
        if ml.nmt != nmt {
            log::info!("NMT state {:?} -> {:?}", ml.nmt, nmt);
            ml.nmt = nmt;
            self.operational
                .store(nmt == NmtState::Operational, Ordering::SeqCst);
        }
    }

    // Realtime side: only records the command for the mainline
    fn nmt_received(&self, data: &[u8]) {
        match data {
            [cmd, target, ..] if *cmd != 0 && (*target == 0 || *target == self.node_id) => {
                self.nmt_pending.store(*cmd, Ordering::SeqCst);
                self.wake_mainline();
            }
            _ => {}
        }
    }

    // Mainline side
    fn nmt_command(&self, ml: &mut Mainline, cmd: u8) {
        match cmd {
            0x01 => self.set_nmt(ml, NmtState::Operational),
            0x02 => self.set_nmt(ml, NmtState::Stopped),
            0x80 => self.set_nmt(ml, NmtState::PreOperational),
            0x81 => ml.reset = ResetCommand::Application,
            0x82 => ml.reset = ResetCommand::Communication,
            _ => log::debug!("Unknown NMT command {:02X}", cmd),
        }
    }
}

impl MainlineStack for DemoNode {
    fn process(&self, elapsed_us: u32) -> MainlineStep {
        let mut ml = self.mainline.lock().unwrap_or_else(|e| e.into_inner());

        let cmd = self.nmt_pending.swap(0, Ordering::SeqCst);
        if cmd != 0 {
            self.nmt_command(&mut ml, cmd);
        }

        let reset = std::mem::take(&mut ml.reset);
        if reset != ResetCommand::None {
            return reset.into();
        }

        if self.heartbeat_us == 0 {
            return ResetCommand::None.into();
        }

        ml.heartbeat_elapsed_us = ml.heartbeat_elapsed_us.saturating_add(elapsed_us);
        if ml.heartbeat_elapsed_us >= self.heartbeat_us {
            ml.heartbeat_elapsed_us = 0;
            self.send(HEARTBEAT_BASE, &[ml.nmt as u8]);
        }
        let next_us = self.heartbeat_us - ml.heartbeat_elapsed_us;
        MainlineStep::with_timer_next(ResetCommand::None, next_us)
    }

    fn set_mainline_notifier(&self, notifier: Option<Notifier>) {
        *self.notifier.lock().unwrap_or_else(|e| e.into_inner()) = notifier;
    }
}

impl RealtimeStack for DemoNode {
    fn process_sync(&self, _tick: Tick) -> bool {
        let sync_was = self.sync_pending.swap(false, Ordering::SeqCst);
        if sync_was {
            self.sync_count.fetch_add(1, Ordering::SeqCst);
        }
        sync_was
    }

    fn process_rpdo(&self, _sync_was: bool, _tick: Tick) {}

    fn process_tpdo(&self, sync_was: bool, _tick: Tick) {
        if sync_was && self.operational.load(Ordering::SeqCst) {
            let count = self.sync_count.load(Ordering::SeqCst);
            self.send(TPDO1_BASE, &count.to_le_bytes());
        }
    }
}

impl CanRxSink for DemoNode {
    fn rx(&self, _iface: usize, frame: &CanFrame) {
        if frame.is_extended() || frame.is_remote_frame() {
            return;
        }
        match frame.raw_id() as u16 {
            NMT_ID => self.nmt_received(frame.data()),
            SYNC_ID => self.sync_pending.store(true, Ordering::SeqCst),
            _ => {}
        }
    }

    fn rx_error(&self, iface: usize, err: CanError) {
        log::warn!("Bus error on interface #{}: {}", iface, err);
    }
}

impl CanOpenNode for DemoNode {
    fn communication_reset(&self) -> canopen_threads::Result<()> {
        let mut ml = self.mainline.lock().unwrap_or_else(|e| e.into_inner());
        ml.reset = ResetCommand::None;
        ml.heartbeat_elapsed_us = 0;
        ml.nmt = NmtState::Initializing;
        self.operational.store(false, Ordering::SeqCst);
        self.sync_pending.store(false, Ordering::SeqCst);
        self.nmt_pending.store(0, Ordering::SeqCst);

        // Boot-up message
        self.send(HEARTBEAT_BASE, &[NmtState::Initializing as u8]);
        self.set_nmt(&mut ml, NmtState::PreOperational);
        Ok(())
    }

    fn shutdown(&self) {
        log::info!("Node {} stopped", self.node_id);
    }
}

// --------------------------------------------------------------------------

fn run(opts: &ArgMatches) -> Result<()> {
    let ifaces: Vec<&String> = opts
        .get_many::<String>("iface")
        .ok_or_else(|| anyhow!("Need at least one CAN interface"))?
        .collect();

    let node_id = *opts.get_one::<u8>("node").unwrap_or(&10);
    if !(1..=127).contains(&node_id) {
        return Err(anyhow!("Node ID must be in the range 1-127"));
    }
    let heartbeat_ms = *opts.get_one::<u32>("heartbeat").unwrap_or(&1000);
    let rt_interval = *opts
        .get_one::<u32>("rt-interval")
        .unwrap_or(&realtime::DEFAULT_INTERVAL_US);
    let ml_interval = *opts
        .get_one::<u32>("ml-interval")
        .unwrap_or(&mainline_wait::DEFAULT_INTERVAL_US);

    let node = Arc::new(DemoNode::new(node_id, heartbeat_ms));
    let mut driver = SocketCanDriver::open(&ifaces, node.clone())
        .context("Unable to open the CAN interfaces")?;
    if let Some(tx) = driver.sender(0) {
        node.set_sender(tx);
    }

    let mut sup = Supervisor::new(node.clone(), rt_interval, ml_interval)?;

    let handle = sup.handle();
    ctrlc::set_handler(move || {
        if let Err(err) = handle.quit() {
            log::error!("Unable to stop the node: {}", err);
        }
    })?;

    log::info!(
        "Starting node {} on {:?}, realtime {} us, mainline {} us",
        node_id,
        ifaces,
        rt_interval,
        ml_interval
    );

    loop {
        let (exit, drv) = sup.run(driver)?;
        driver = drv;
        match exit {
            Exit::Application => log::info!("Application reset"),
            Exit::Quit => break,
        }
    }

    log::info!("Done");
    Ok(())
}

fn main() {
    env_logger::init();

    let opts = Command::new("co_threads")
        .version(VERSION)
        .about("Run a minimal CANopen node on the realtime/mainline thread harness")
        .arg(
            Arg::new("iface")
                .help("The CAN interface(s) to use, like 'can0', 'vcan0', etc")
                .required(true)
                .multiple_values(true)
                .index(1),
        )
        .arg(
            Arg::new("node")
                .help("The CANopen node ID (1-127)")
                .short('n')
                .long("node")
                .action(ArgAction::Set)
                .value_parser(value_parser!(u8))
                .default_value("10"),
        )
        .arg(
            Arg::new("heartbeat")
                .help("The heartbeat period in ms, 0 to disable")
                .long("heartbeat")
                .action(ArgAction::Set)
                .value_parser(value_parser!(u32))
                .default_value("1000"),
        )
        .arg(
            Arg::new("rt-interval")
                .help("The realtime interval in us")
                .long("rt-interval")
                .action(ArgAction::Set)
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("ml-interval")
                .help("The mainline interval in us")
                .long("ml-interval")
                .action(ArgAction::Set)
                .value_parser(value_parser!(u32)),
        )
        .get_matches();

    if let Err(err) = run(&opts) {
        eprintln!("{:#}", err);
        process::exit(1);
    }
}

/////////////////////////////////////////////////////////////////////////////
