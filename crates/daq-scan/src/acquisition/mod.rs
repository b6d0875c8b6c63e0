//! Acquisition loop.
//!
//! A single worker thread owns every channel group of a run. Callers never
//! touch its state; they enqueue commands:
//!
//! ```text
//!   add_detector()    ──► Acquire         ┐
//!   remove_detector() ──► Stop / Update   ├─► worker ─► STOPPED
//!   update_settings() ──► UpdateSettings  │              │ Acquire
//!   terminate()       ──► Terminate       ┘              ▼
//!                                                ACQUIRE_PENDING
//!                                               (status lines up)
//!                                                 │            │
//!                                                 ▼            ▼
//!                                         CONTINUOUS_RUN  SYNCHRONIZED_RUN
//! ```
//!
//! The strategy for each run is picked by [`AcquisitionMode::select`]. A
//! continuous run the hardware refuses falls back to synchronized frames; a
//! synchronized run that fails stops the loop and records the error.

mod assembler;
mod continuous;
mod synchronized;
mod tasks;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::active_state::ActiveStateManager;
use crate::detector::{Detector, DetectorKind};
use crate::error::{Result, ScanError};
use crate::hal::{Range, ScanHardware};
use crate::pool::{PoolStats, ReadBufferPool};
use crate::settings::{AcquisitionSettings, RunTuning, ScanState};

pub use assembler::ChannelReducer;

/// Loop tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Chunk length and negotiation search
    #[serde(flatten)]
    pub tuning: RunTuning,
    /// How often the queue is polled while waiting for software triggers
    #[serde(with = "humantime_serde")]
    pub barrier_poll: Duration,
    /// Extra time a chunk read may take beyond its nominal duration
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,
    /// Time budget for releasing idle read buffers
    #[serde(with = "humantime_serde")]
    pub reclaim_budget: Duration,
    /// Idle read buffers kept per sample type
    pub retained_buffers: usize,
    /// Sample-clock ticks between the master start and the followers
    pub trigger_delay_ticks: u32,
    /// Position output channels `[x, y]`
    pub position_channels: [u32; 2],
    /// Digital port carrying the clocked status lines
    pub fast_line_port: u32,
    /// Where the beam rests while idle (raw codes)
    pub park_position: Option<[u16; 2]>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            tuning: RunTuning::default(),
            barrier_poll: Duration::from_millis(100),
            io_timeout: Duration::from_secs(2),
            reclaim_budget: Duration::from_millis(2),
            retained_buffers: 4,
            trigger_delay_ticks: 2,
            position_channels: [0, 1],
            fast_line_port: 0,
            park_position: Some([u16::MAX / 2 + 1, u16::MAX / 2 + 1]),
        }
    }
}

/// Acquisition strategy of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionMode {
    /// Free-running, re-arms until told otherwise
    Continuous,
    /// One finite frame after every participating trigger fired
    Synchronized,
}

impl AcquisitionMode {
    /// Pick the strategy for the next run.
    pub fn select(detectors: &[Detector], continuous_rejected: bool) -> Self {
        if continuous_rejected || detectors.iter().any(|d| d.trigger().is_some()) {
            Self::Synchronized
        } else {
            Self::Continuous
        }
    }
}

/// Observable state of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Idle
    Stopped,
    /// Waiting for the status lines
    AcquirePending,
    /// Streaming continuously
    ContinuousRun,
    /// Acquiring a single triggered frame
    SynchronizedRun,
}

/// Loop counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquisitionStats {
    /// Frames delivered to detectors (one per frame, not per detector)
    pub frames_delivered: u64,
    /// Frames acquired by continuous runs
    pub continuous_frames: u64,
    /// Frames acquired by synchronized runs
    pub synchronized_frames: u64,
    /// Continuous runs refused or failed and retried synchronized
    pub continuous_rejections: u64,
    /// Output refills that failed inside the hardware callback
    pub callback_failures: u64,
    /// Runs started
    pub runs: u64,
    /// Read buffer pool
    pub pool: PoolStats,
}

#[derive(Debug, Default)]
pub(crate) struct EngineCounters {
    pub frames_delivered: AtomicU64,
    pub continuous_frames: AtomicU64,
    pub synchronized_frames: AtomicU64,
    pub continuous_rejections: AtomicU64,
    pub callback_failures: AtomicU64,
    pub runs: AtomicU64,
}

#[derive(Debug)]
pub(crate) struct ReadPools {
    pub analog: ReadBufferPool<i16>,
    pub counts: ReadBufferPool<u32>,
}

impl ReadPools {
    fn reclaim(&self, budget: Duration) {
        let half = budget / 2;
        self.analog.reclaim(half);
        self.counts.reclaim(half);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Acquire,
    Stop,
    UpdateSettings,
    Terminate,
}

/// Result of polling the queue during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Continue,
    Update,
    Stop,
    Terminate,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    /// Rebuild the settings and run again
    Restart,
    /// No detector left
    Stop,
    /// Worker shutting down
    Terminate,
}

/// The loop's receiving end plus what it needs to interpret commands.
pub(crate) struct Inbox {
    rx: mpsc::Receiver<Command>,
    detectors: Arc<RwLock<Vec<Detector>>>,
    settings_changed: bool,
}

impl Inbox {
    /// Drain pending commands without blocking.
    pub fn poll(&mut self) -> Control {
        let mut stop = false;
        let mut update = false;
        loop {
            match self.rx.try_recv() {
                Ok(Command::Terminate) | Err(TryRecvError::Disconnected) => {
                    return Control::Terminate
                }
                Ok(Command::Stop) => stop = true,
                Ok(Command::Acquire) | Ok(Command::UpdateSettings) => update = true,
                Err(TryRecvError::Empty) => break,
            }
        }
        if stop && self.detectors.read().is_empty() {
            Control::Stop
        } else if stop || update {
            self.settings_changed = true;
            Control::Update
        } else {
            Control::Continue
        }
    }

    fn take_settings_changed(&mut self) -> bool {
        std::mem::take(&mut self.settings_changed)
    }
}

/// Everything a run strategy borrows from the worker.
pub(crate) struct RunContext<'a> {
    pub hardware: &'a dyn ScanHardware,
    pub config: &'a AcquisitionConfig,
    pub counters: &'a Arc<EngineCounters>,
    pub pools: &'a ReadPools,
    pub inbox: &'a mut Inbox,
    pub sequence: &'a mut u64,
    pub output_range: Range,
}

/// Handle to the acquisition worker.
pub struct AcquisitionEngine {
    sender: Mutex<Option<mpsc::Sender<Command>>>,
    detectors: Arc<RwLock<Vec<Detector>>>,
    counters: Arc<EngineCounters>,
    pools: Arc<ReadPools>,
    state: Arc<RwLock<LoopState>>,
    last_error: Arc<Mutex<Option<ScanError>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AcquisitionEngine {
    /// Spawn the worker.
    pub fn start(
        hardware: Arc<dyn ScanHardware>,
        scan: Arc<ScanState>,
        active: Arc<ActiveStateManager>,
        config: AcquisitionConfig,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let detectors = Arc::new(RwLock::new(Vec::new()));
        let counters = Arc::new(EngineCounters::default());
        let pools = Arc::new(ReadPools {
            analog: ReadBufferPool::new(config.retained_buffers),
            counts: ReadBufferPool::new(config.retained_buffers),
        });
        let state = Arc::new(RwLock::new(LoopState::Stopped));
        let last_error = Arc::new(Mutex::new(None));

        let worker = Worker {
            hardware,
            scan,
            active,
            config,
            inbox: Inbox {
                rx,
                detectors: Arc::clone(&detectors),
                settings_changed: false,
            },
            counters: Arc::clone(&counters),
            pools: Arc::clone(&pools),
            state: Arc::clone(&state),
            last_error: Arc::clone(&last_error),
            continuous_rejected: false,
            sequence: 0,
        };
        let handle = thread::Builder::new()
            .name("scan-acquisition".into())
            .spawn(move || worker.run())
            .map_err(|e| {
                ScanError::hardware(format!("failed to spawn acquisition worker: {}", e))
            })?;

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            detectors,
            counters,
            pools,
            state,
            last_error,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn send(&self, command: Command) -> Result<()> {
        match self.sender.lock().as_ref() {
            Some(tx) => tx.send(command).map_err(|_| ScanError::WorkerGone {
                name: "acquisition".into(),
            }),
            None => Err(ScanError::WorkerGone {
                name: "acquisition".into(),
            }),
        }
    }

    /// Register a detector and start acquiring for it.
    pub fn add_detector(&self, detector: Detector) -> Result<()> {
        {
            let mut detectors = self.detectors.write();
            if detectors.contains(&detector) {
                return Ok(());
            }
            info!(detector = detector.name(), kind = ?detector.kind(), "Detector registered");
            detectors.push(detector);
        }
        self.send(Command::Acquire)
    }

    /// Deregister a detector. Removing an unknown detector does nothing.
    pub fn remove_detector(&self, detector: &Detector) -> Result<()> {
        let now_empty = {
            let mut detectors = self.detectors.write();
            let before = detectors.len();
            detectors.retain(|d| d != detector);
            if detectors.len() == before {
                return Ok(());
            }
            info!(detector = detector.name(), remaining = detectors.len(), "Detector deregistered");
            detectors.is_empty()
        };
        if now_empty {
            self.send(Command::Stop)
        } else {
            self.send(Command::UpdateSettings)
        }
    }

    /// Restart a running acquisition with fresh settings after the current frame.
    pub fn update_settings_on_next_frame(&self) -> Result<()> {
        self.send(Command::UpdateSettings)
    }

    /// Registered detectors.
    pub fn detectors(&self) -> Vec<Detector> {
        self.detectors.read().clone()
    }

    /// Current loop state.
    pub fn state(&self) -> LoopState {
        *self.state.read()
    }

    /// Snapshot of the loop counters.
    pub fn stats(&self) -> AcquisitionStats {
        let c = &self.counters;
        let analog = self.pools.analog.stats();
        let counts = self.pools.counts.stats();
        AcquisitionStats {
            frames_delivered: c.frames_delivered.load(Ordering::Relaxed),
            continuous_frames: c.continuous_frames.load(Ordering::Relaxed),
            synchronized_frames: c.synchronized_frames.load(Ordering::Relaxed),
            continuous_rejections: c.continuous_rejections.load(Ordering::Relaxed),
            callback_failures: c.callback_failures.load(Ordering::Relaxed),
            runs: c.runs.load(Ordering::Relaxed),
            pool: PoolStats {
                takes: analog.takes + counts.takes,
                reuses: analog.reuses + counts.reuses,
                reclaimed: analog.reclaimed + counts.reclaimed,
                idle: analog.idle + counts.idle,
            },
        }
    }

    /// Error that stopped the last acquisition, if any.
    pub fn last_error(&self) -> Option<ScanError> {
        self.last_error.lock().clone()
    }

    /// Stop any run and join the worker. Safe to call more than once.
    pub fn terminate(&self) {
        if let Some(tx) = self.sender.lock().take() {
            let _ = tx.send(Command::Terminate);
        }
        if let Some(handle) = self.handle.lock().take() {
            if let Err(e) = handle.join() {
                error!("Acquisition worker panicked: {:?}", e);
            }
        }
    }
}

impl Drop for AcquisitionEngine {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Idle,
    Failed,
    Terminate,
}

struct Worker {
    hardware: Arc<dyn ScanHardware>,
    scan: Arc<ScanState>,
    active: Arc<ActiveStateManager>,
    config: AcquisitionConfig,
    inbox: Inbox,
    counters: Arc<EngineCounters>,
    pools: Arc<ReadPools>,
    state: Arc<RwLock<LoopState>>,
    last_error: Arc<Mutex<Option<ScanError>>>,
    continuous_rejected: bool,
    sequence: u64,
}

impl Worker {
    fn run(mut self) {
        info!("Acquisition loop started");
        self.park_beam();
        loop {
            let command = match self.inbox.rx.recv() {
                Ok(command) => command,
                Err(_) => break,
            };
            match command {
                Command::Acquire => {
                    if self.acquire() == Exit::Terminate {
                        break;
                    }
                }
                Command::Stop | Command::UpdateSettings => {}
                Command::Terminate => break,
            }
        }
        self.park_beam();
        self.set_state(LoopState::Stopped);
        info!(frames = self.sequence, "Acquisition loop exiting");
    }

    fn set_state(&self, state: LoopState) {
        *self.state.write() = state;
    }

    fn acquire(&mut self) -> Exit {
        if self.inbox.detectors.read().is_empty() {
            return Exit::Idle;
        }
        self.set_state(LoopState::AcquirePending);
        self.continuous_rejected = false;
        *self.last_error.lock() = None;

        if let Err(e) = self.active.request_active() {
            warn!(error = %e, "Could not raise status lines");
        }
        // Idle until the lines settle anyway
        self.pools.reclaim(self.config.reclaim_budget);

        let exit = match self.active.wait_active() {
            Ok(()) => self.cycle(),
            Err(e) => {
                self.fail(e);
                Exit::Failed
            }
        };

        // Always runs, whatever ended the cycle
        if let Err(e) = self.active.request_inactive() {
            warn!(error = %e, "Could not lower status lines");
        }
        self.reset_fast_lines();
        self.park_beam();
        self.set_state(LoopState::Stopped);
        exit
    }

    fn cycle(&mut self) -> Exit {
        loop {
            let detectors = self.inbox.detectors.read().clone();
            if detectors.is_empty() {
                return Exit::Idle;
            }
            if self.inbox.take_settings_changed() {
                self.continuous_rejected = false;
            }

            let mode = AcquisitionMode::select(&detectors, self.continuous_rejected);
            let (analog, counting): (Vec<_>, Vec<_>) = detectors
                .into_iter()
                .partition(|d| d.kind() == DetectorKind::Analog);
            let settings = match self.scan.build(
                self.hardware.as_ref(),
                analog,
                counting,
                mode == AcquisitionMode::Continuous,
                &self.config.tuning,
            ) {
                Ok(settings) => settings,
                Err(e) => {
                    self.fail(e);
                    return Exit::Failed;
                }
            };

            self.counters.runs.fetch_add(1, Ordering::Relaxed);
            let result = self.run_once(mode, &settings);
            match result {
                Ok(RunOutcome::Restart) => {}
                Ok(RunOutcome::Stop) => return Exit::Idle,
                Ok(RunOutcome::Terminate) => return Exit::Terminate,
                Err(e) if e.is_already_stopped() => {
                    debug!(error = %e, "I/O raced with task teardown");
                }
                Err(e) if mode == AcquisitionMode::Continuous => {
                    warn!(
                        error = %e,
                        "Continuous acquisition failed, falling back to synchronized frames"
                    );
                    self.continuous_rejected = true;
                    self.counters
                        .continuous_rejections
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.fail(e);
                    return Exit::Failed;
                }
            }
        }
    }

    fn run_once(
        &mut self,
        mode: AcquisitionMode,
        settings: &AcquisitionSettings,
    ) -> Result<RunOutcome> {
        let output_range = self.scan.geometry().output_range;
        let mut ctx = RunContext {
            hardware: self.hardware.as_ref(),
            config: &self.config,
            counters: &self.counters,
            pools: &self.pools,
            inbox: &mut self.inbox,
            sequence: &mut self.sequence,
            output_range,
        };
        match mode {
            AcquisitionMode::Continuous => {
                *self.state.write() = LoopState::ContinuousRun;
                continuous::run(&mut ctx, settings)
            }
            AcquisitionMode::Synchronized => {
                *self.state.write() = LoopState::SynchronizedRun;
                synchronized::run(&mut ctx, settings)
            }
        }
    }

    fn fail(&mut self, err: ScanError) {
        error!(error = %err, "Acquisition stopped");
        *self.last_error.lock() = Some(err);
    }

    fn reset_fast_lines(&self) {
        let fast_lines = self.scan.settings().fast_lines;
        let used = fast_lines.used_mask();
        if used == 0 {
            return;
        }
        let rest = fast_lines.rest_pattern();
        let levels: Vec<(u32, bool)> = (0..32)
            .filter(|bit| used & (1 << bit) != 0)
            .map(|bit| (bit, rest & (1 << bit) != 0))
            .collect();
        if let Err(e) = self.hardware.write_static_lines(&levels) {
            warn!(error = %e, "Could not reset clocked status lines");
        }
    }

    fn park_beam(&self) {
        if let Some([x, y]) = self.config.park_position {
            if let Err(e) = self.hardware.write_static_position(x, y) {
                warn!(error = %e, "Could not park the beam");
            }
        }
    }
}
