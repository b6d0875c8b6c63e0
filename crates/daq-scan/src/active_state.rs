//! "Scanning active" status lines.
//!
//! External equipment (blanking, shutters, other instruments) is told when
//! the beam is scanning through un-clocked digital lines. Their timing is
//! decoupled from the acquisition loop by a dedicated worker:
//!
//! ```text
//!   request_active()   ──► GoActive        ─┐
//!   request_inactive() ──► GoInactive{at}  ─┼─► worker ──► write_static_lines()
//!   set_override()     ──► Refresh         ─┘      │
//!   wait_active()  ◄──── ready (Condvar) ◄──────────┘ after activation delay
//! ```
//!
//! A deactivation is only executed once its time has passed; a `GoActive`
//! received before then cancels it. When several deactivations are pending
//! the earliest one wins.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{Result, ScanError};
use crate::hal::ScanHardware;

/// Manual setting for one status line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineOverride {
    /// Follow the scanning state
    #[default]
    Auto,
    /// Always high
    ForcedHigh,
    /// Always low
    ForcedLow,
}

/// One managed status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveLine {
    /// Digital line number
    pub line: u32,
    /// Level meaning "active"
    #[serde(default = "default_active_high")]
    pub active_high: bool,
    /// Manual override
    #[serde(default, rename = "override")]
    pub line_override: LineOverride,
}

fn default_active_high() -> bool {
    true
}

impl ActiveLine {
    /// Active-high line following the scanning state.
    pub fn new(line: u32) -> Self {
        Self {
            line,
            active_high: true,
            line_override: LineOverride::Auto,
        }
    }

    fn level(&self, line_override: LineOverride, active: bool) -> bool {
        match line_override {
            LineOverride::ForcedHigh => true,
            LineOverride::ForcedLow => false,
            LineOverride::Auto => active == self.active_high,
        }
    }
}

/// Configuration of the status-line worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActiveStateConfig {
    /// Lines to drive
    pub lines: Vec<ActiveLine>,
    /// Settle time after raising the lines before acquisition may start
    #[serde(with = "humantime_serde")]
    pub activation_delay: Duration,
    /// Time to keep the lines up after the last frame
    #[serde(with = "humantime_serde")]
    pub deactivation_delay: Duration,
    /// Extra time `wait_active` allows on top of the activation delay
    #[serde(with = "humantime_serde")]
    pub wait_grace: Duration,
}

impl Default for ActiveStateConfig {
    fn default() -> Self {
        Self {
            lines: Vec::new(),
            activation_delay: Duration::ZERO,
            deactivation_delay: Duration::from_millis(100),
            wait_grace: Duration::from_secs(1),
        }
    }
}

/// Observable state of the status lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveState {
    /// Lines are low
    Inactive,
    /// Lines are high, activation delay still running
    Activating,
    /// Lines are high and settled
    Active,
    /// Lines are high until the given time
    DeactivationPending(Instant),
}

enum Command {
    GoActive,
    GoInactive { at: Instant },
    Refresh,
    Terminate,
}

struct Shared {
    state: Mutex<Status>,
    changed: Condvar,
    overrides: RwLock<Vec<LineOverride>>,
}

struct Status {
    state: ActiveState,
    requested: u64,
    acknowledged: u64,
}

/// Worker driving the "scanning active" lines.
pub struct ActiveStateManager {
    sender: Mutex<Option<mpsc::Sender<Command>>>,
    shared: Arc<Shared>,
    config: ActiveStateConfig,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ActiveStateManager {
    /// Start the worker.
    pub fn start(hardware: Arc<dyn ScanHardware>, config: ActiveStateConfig) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(Status {
                state: ActiveState::Inactive,
                requested: 0,
                acknowledged: 0,
            }),
            changed: Condvar::new(),
            overrides: RwLock::new(config.lines.iter().map(|l| l.line_override).collect()),
        });
        let (tx, rx) = mpsc::channel();

        let worker = Worker {
            hardware,
            lines: config.lines.clone(),
            activation_delay: config.activation_delay,
            shared: Arc::clone(&shared),
            active: false,
        };
        let handle = thread::Builder::new()
            .name("scan-active-state".into())
            .spawn(move || worker.run(rx))
            .map_err(|e| {
                ScanError::hardware(format!("failed to spawn active-state worker: {}", e))
            })?;

        info!(lines = config.lines.len(), "Started active-state worker");
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            shared,
            config,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn send(&self, command: Command) -> Result<()> {
        match self.sender.lock().as_ref() {
            Some(tx) => tx.send(command).map_err(|_| ScanError::WorkerGone {
                name: "active-state".into(),
            }),
            None => Err(ScanError::WorkerGone {
                name: "active-state".into(),
            }),
        }
    }

    /// Raise the lines now. Cancels any pending deactivation.
    pub fn request_active(&self) -> Result<()> {
        self.shared.state.lock().requested += 1;
        self.send(Command::GoActive)
    }

    /// Lower the lines after the configured deactivation delay.
    pub fn request_inactive(&self) -> Result<()> {
        self.request_inactive_at(Instant::now() + self.config.deactivation_delay)
    }

    /// Lower the lines no earlier than `at`.
    pub fn request_inactive_at(&self, at: Instant) -> Result<()> {
        self.send(Command::GoInactive { at })
    }

    /// Block until the lines are active and settled.
    ///
    /// Fails with [`ScanError::ActiveStateTimeout`] after the grace period
    /// plus the activation delay.
    pub fn wait_active(&self) -> Result<()> {
        let timeout = self.config.wait_grace + self.config.activation_delay;
        let deadline = Instant::now() + timeout;
        let mut status = self.shared.state.lock();
        let target = status.requested;
        while status.acknowledged < target {
            if self
                .shared
                .changed
                .wait_until(&mut status, deadline)
                .timed_out()
                && status.acknowledged < target
            {
                return Err(ScanError::ActiveStateTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
        Ok(())
    }

    /// Current state.
    pub fn state(&self) -> ActiveState {
        self.shared.state.lock().state
    }

    /// Whether the lines are up and settled (possibly pending deactivation).
    pub fn is_active(&self) -> bool {
        matches!(
            self.state(),
            ActiveState::Active | ActiveState::DeactivationPending(_)
        )
    }

    /// Pin a line to a level or return it to automatic control.
    pub fn set_override(&self, line: u32, line_override: LineOverride) -> Result<()> {
        let index = self
            .config
            .lines
            .iter()
            .position(|l| l.line == line)
            .ok_or_else(|| {
                ScanError::config(format!("line {} is not a managed status line", line))
            })?;
        self.shared.overrides.write()[index] = line_override;
        debug!(line, ?line_override, "Status line override changed");
        self.send(Command::Refresh)
    }

    /// Current override of a line.
    pub fn line_override(&self, line: u32) -> Option<LineOverride> {
        let index = self.config.lines.iter().position(|l| l.line == line)?;
        self.shared.overrides.read().get(index).copied()
    }

    /// Lower the lines immediately and stop the worker. Safe to call twice.
    pub fn shutdown(&self) {
        if let Some(tx) = self.sender.lock().take() {
            let _ = tx.send(Command::Terminate);
        }
        if let Some(handle) = self.handle.lock().take() {
            if let Err(e) = handle.join() {
                error!("Active-state worker panicked: {:?}", e);
            }
        }
    }
}

impl Drop for ActiveStateManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    hardware: Arc<dyn ScanHardware>,
    lines: Vec<ActiveLine>,
    activation_delay: Duration,
    shared: Arc<Shared>,
    active: bool,
}

impl Worker {
    fn run(mut self, rx: mpsc::Receiver<Command>) {
        let mut pending_off: Option<Instant> = None;

        loop {
            let received = match pending_off {
                Some(at) => rx.recv_timeout(at.saturating_duration_since(Instant::now())),
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match received {
                Ok(Command::GoActive) => {
                    pending_off = None;
                    self.go_active();
                }
                Ok(Command::GoInactive { at }) => {
                    let at = pending_off.map_or(at, |current| current.min(at));
                    pending_off = Some(at);
                    if self.active {
                        self.set_state(ActiveState::DeactivationPending(at));
                    }
                }
                Ok(Command::Refresh) => self.drive(self.active),
                Err(RecvTimeoutError::Timeout) => {
                    pending_off = None;
                    self.go_inactive();
                }
                Ok(Command::Terminate) | Err(RecvTimeoutError::Disconnected) => {
                    self.go_inactive();
                    break;
                }
            }
        }
        debug!("Active-state worker exiting");
    }

    fn go_active(&mut self) {
        if !self.active {
            self.drive(true);
            self.active = true;
            if !self.activation_delay.is_zero() {
                self.set_state(ActiveState::Activating);
                thread::sleep(self.activation_delay);
            }
            debug!(delay_ms = self.activation_delay.as_millis() as u64, "Status lines active");
        }
        let mut status = self.shared.state.lock();
        status.state = ActiveState::Active;
        status.acknowledged = status.requested;
        drop(status);
        self.shared.changed.notify_all();
    }

    fn go_inactive(&mut self) {
        if self.active {
            self.drive(false);
            self.active = false;
            debug!("Status lines inactive");
        }
        self.set_state(ActiveState::Inactive);
    }

    fn set_state(&self, state: ActiveState) {
        self.shared.state.lock().state = state;
        self.shared.changed.notify_all();
    }

    fn drive(&self, active: bool) {
        if self.lines.is_empty() {
            return;
        }
        let overrides = self.shared.overrides.read().clone();
        let levels: Vec<(u32, bool)> = self
            .lines
            .iter()
            .zip(overrides)
            .map(|(line, o)| (line.line, line.level(o, active)))
            .collect();
        if let Err(e) = self.hardware.write_static_lines(&levels) {
            warn!(error = %e, active, "Failed to drive status lines");
        }
    }
}
