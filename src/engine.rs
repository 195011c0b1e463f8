//! The acquisition engine.
//!
//! A readout thread runs the hardware driver and posts finished events into
//! a bounded queue; the application pops them with [`AcquisitionEngine::get_next_event`].
//! A full queue blocks the producer instead of growing without bound, and
//! hardware faults are reported through a sticky [`AcquisitionStatus`].

use crate::{DriverError, EngineError, RawEvent};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use log::{error, info, warn};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

pub const DEFAULT_QUEUE_CAPACITY: usize = 10;
/// Wait between producer retries on a full queue.
const POST_RETRY_WAIT: Duration = Duration::from_millis(10);
/// How often a consumer blocked without timeout rechecks the run state.
const IDLE_RECHECK: Duration = Duration::from_millis(50);

static ENGINE_SLOT: AtomicBool = AtomicBool::new(false);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AcquisitionStatus {
    Normal,
    InitFailure,
    BusError,
    CommError,
    GenericError,
}

/// Device-specific readout driven by the engine.
pub trait HardwareDriver: Send {
    /// Open, identify and calibrate the hardware.
    fn initialize(&mut self) -> Result<(), DriverError>;

    /// Apply configuration before a run. Called synchronously by `start_run`.
    fn prepare_run(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    /// The readout loop. Runs on the acquisition thread until
    /// `sink.should_stop()` or a fatal error.
    fn readout(&mut self, sink: &EventSink) -> Result<(), DriverError>;

    /// Release hardware handles.
    fn close(&mut self) {}
}

/// Claim on the single engine slot of this process.
///
/// Hardware handles are process-exclusive, so only one engine may exist at a
/// time. Dropping the lease frees the slot for a new engine.
#[derive(Debug)]
pub struct EngineLease(());

impl EngineLease {
    pub fn acquire() -> Result<Self, EngineError> {
        ENGINE_SLOT
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| Self(()))
            .map_err(|_| EngineError::DuplicateInstance)
    }

    pub fn is_held() -> bool {
        ENGINE_SLOT.load(Ordering::SeqCst)
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        ENGINE_SLOT.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct Shared {
    running: AtomicBool,
    cancelled: AtomicBool,
    queue_full_logged: AtomicBool,
    posted: AtomicU64,
    dropped: AtomicU64,
    status: Mutex<AcquisitionStatus>,
}

impl Shared {
    fn status(&self) -> AcquisitionStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a fault. The first fault sticks until `reset_status`.
    fn set_status(&self, status: AcquisitionStatus) {
        let mut current = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if *current == AcquisitionStatus::Normal {
            *current = status;
        }
    }
}

/// Counters of the current run.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct EngineStats {
    pub posted_events: u64,
    pub dropped_events: u64,
}

/// Producer side of the event queue, handed to the driver's readout loop.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: Sender<RawEvent>,
    shared: Arc<Shared>,
    capacity: usize,
}

impl EventSink {
    /// Queue a finished event, blocking while the queue is full.
    ///
    /// While blocked the running flag is rechecked between short waits. Once
    /// the run is cancelled the event is given up immediately; once it is
    /// merely stopped, one last non-blocking attempt is made. A given-up
    /// event is logged and counted. Returns whether the event was queued.
    pub fn post_event(&self, event: RawEvent) -> bool {
        let mut event = match self.tx.try_send(event) {
            Ok(()) => return self.accepted(),
            Err(TrySendError::Full(event)) => event,
            Err(TrySendError::Disconnected(event)) => return self.discard(event),
        };

        if !self.shared.queue_full_logged.swap(true, Ordering::SeqCst) {
            warn!(
                "Event queue full ({} events), readout is waiting on the consumer",
                self.capacity
            );
        }

        loop {
            if self.shared.cancelled.load(Ordering::SeqCst) {
                return self.discard(event);
            }
            if !self.shared.running.load(Ordering::SeqCst) {
                return match self.tx.try_send(event) {
                    Ok(()) => self.accepted(),
                    Err(e) => self.discard(e.into_inner()),
                };
            }
            match self.tx.send_timeout(event, POST_RETRY_WAIT) {
                Ok(()) => return self.accepted(),
                Err(SendTimeoutError::Timeout(e)) => event = e,
                Err(SendTimeoutError::Disconnected(e)) => return self.discard(e),
            }
        }
    }

    /// True once the run has been ended or cancelled.
    pub fn should_stop(&self) -> bool {
        !self.shared.running.load(Ordering::SeqCst) || self.is_cancelled()
    }

    /// True when the run was ended with `force`; partially read events
    /// should be abandoned.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    pub fn queue_depth(&self) -> usize {
        self.tx.len()
    }

    fn accepted(&self) -> bool {
        self.shared.posted.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn discard(&self, event: RawEvent) -> bool {
        self.shared.dropped.fetch_add(1, Ordering::SeqCst);
        warn!(
            "Run stopped with a full queue, event {} ({} bytes) not delivered",
            event.event_id(),
            event.data_size()
        );
        false
    }
}

pub struct AcquisitionEngine {
    shared: Arc<Shared>,
    tx: Sender<RawEvent>,
    rx: Receiver<RawEvent>,
    capacity: usize,
    driver: Option<Box<dyn HardwareDriver>>,
    worker: Option<JoinHandle<Box<dyn HardwareDriver>>>,
    _lease: EngineLease,
}

impl AcquisitionEngine {
    pub fn new(driver: Box<dyn HardwareDriver>) -> Result<Self, EngineError> {
        Self::with_capacity(driver, DEFAULT_QUEUE_CAPACITY)
    }

    /// Fails with `DuplicateInstance` while another engine is alive.
    pub fn with_capacity(
        driver: Box<dyn HardwareDriver>,
        capacity: usize,
    ) -> Result<Self, EngineError> {
        let lease = EngineLease::acquire()?;
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Ok(Self {
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                queue_full_logged: AtomicBool::new(false),
                posted: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                status: Mutex::new(AcquisitionStatus::Normal),
            }),
            tx,
            rx,
            capacity,
            driver: Some(driver),
            worker: None,
            _lease: lease,
        })
    }

    /// Bring up the hardware. A failure is also recorded in the status.
    pub fn initialize(&mut self) -> Result<(), EngineError> {
        if self.worker.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        let driver = self.driver.as_mut().ok_or(EngineError::DriverUnavailable)?;
        driver.initialize().map_err(|e| {
            error!("Hardware initialization failed: {}", e);
            self.shared.set_status(e.status());
            EngineError::from(e)
        })
    }

    /// Start the readout thread.
    ///
    /// The driver moves onto the new thread. If the thread cannot be spawned
    /// the driver is lost with it and later calls fail with
    /// `DriverUnavailable`.
    pub fn start_run(&mut self) -> Result<(), EngineError> {
        if self.shared.running.load(Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }
        // the previous run's thread may have stopped on its own
        if self.worker.is_some() {
            self.join_worker()?;
        }
        let mut driver = self.driver.take().ok_or(EngineError::DriverUnavailable)?;

        while self.rx.try_recv().is_ok() {}
        self.shared.posted.store(0, Ordering::SeqCst);
        self.shared.dropped.store(0, Ordering::SeqCst);
        self.shared.queue_full_logged.store(false, Ordering::SeqCst);
        self.shared.cancelled.store(false, Ordering::SeqCst);

        if let Err(e) = driver.prepare_run() {
            error!("Could not prepare run: {}", e);
            self.shared.set_status(e.status());
            self.driver = Some(driver);
            return Err(e.into());
        }

        self.shared.running.store(true, Ordering::SeqCst);
        let sink = self.sink();
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("readout".to_string())
            .spawn(move || {
                if let Err(e) = driver.readout(&sink) {
                    error!("Readout stopped: {}", e);
                    shared.set_status(e.status());
                }
                shared.running.store(false, Ordering::SeqCst);
                driver
            });
        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                info!("Run started");
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(EngineError::ThreadSpawn(e))
            }
        }
    }

    /// Stop the run and wait for the readout thread.
    ///
    /// With `force` the readout is cancelled and abandons any partially read
    /// event; otherwise it finishes its current iteration first.
    pub fn end_run(&mut self, force: bool) -> Result<(), EngineError> {
        if self.worker.is_none() {
            return Err(EngineError::NotRunning);
        }
        self.shared.running.store(false, Ordering::SeqCst);
        if force {
            self.shared.cancelled.store(true, Ordering::SeqCst);
        }
        self.join_worker()?;
        let stats = self.stats();
        info!(
            "Run ended: {} events queued, {} dropped",
            stats.posted_events, stats.dropped_events
        );
        Ok(())
    }

    /// Pop the oldest event, waiting up to `timeout` (forever for `None`).
    ///
    /// Returns `None` right away when the status is not `Normal`, so check
    /// `get_status` before treating `None` as "no data yet".
    pub fn get_next_event(&self, timeout: Option<Duration>) -> Option<RawEvent> {
        if self.get_status() != AcquisitionStatus::Normal {
            return None;
        }
        if !self.is_running() && self.rx.is_empty() {
            return None;
        }
        match timeout {
            Some(timeout) => self.rx.recv_timeout(timeout).ok(),
            None => loop {
                match self.rx.recv_timeout(IDLE_RECHECK) {
                    Ok(event) => return Some(event),
                    Err(RecvTimeoutError::Timeout) => {
                        if self.get_status() != AcquisitionStatus::Normal
                            || (!self.is_running() && self.rx.is_empty())
                        {
                            return None;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => return None,
                }
            },
        }
    }

    /// Take every event still queued without waiting, whatever the status.
    ///
    /// Events that were complete before a fault are still valid; this is how
    /// they are recovered once the run has ended.
    pub fn drain(&self) -> impl Iterator<Item = RawEvent> + '_ {
        self.rx.try_iter()
    }

    pub fn get_status(&self) -> AcquisitionStatus {
        self.shared.status()
    }

    pub fn reset_status(&self) {
        *self.shared.status.lock().unwrap_or_else(|e| e.into_inner()) =
            AcquisitionStatus::Normal;
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn queue_depth(&self) -> usize {
        self.rx.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            posted_events: self.shared.posted.load(Ordering::SeqCst),
            dropped_events: self.shared.dropped.load(Ordering::SeqCst),
        }
    }

    /// A producer handle on this engine's queue.
    pub fn sink(&self) -> EventSink {
        EventSink {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
            capacity: self.capacity,
        }
    }

    fn join_worker(&mut self) -> Result<(), EngineError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        match worker.join() {
            Ok(driver) => {
                self.driver = Some(driver);
                Ok(())
            }
            Err(_) => {
                self.shared.set_status(AcquisitionStatus::GenericError);
                Err(EngineError::ThreadPanicked)
            }
        }
    }
}

impl Drop for AcquisitionEngine {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.end_run(true);
        }
        if let Some(driver) = self.driver.as_mut() {
            driver.close();
        }
    }
}
