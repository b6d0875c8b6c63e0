//! Simulated scan hardware.
//!
//! `SimHardware` implements the capability contract without a device. It keeps
//! a shared clock in integer timebase ticks:
//!
//! - Reading `n` samples from an input task advances the clock to the end of
//!   those samples (optionally pacing reads to wall-clock time)
//! - Running output tasks consume their queued samples up to the clock,
//!   invoking refill callbacks every N samples
//! - An output that runs out of queued samples without regeneration faults
//!   with a buffer underrun
//!
//! Continuous input above a configurable aggregate rate is rejected at
//! `start()`, which is how the engine's fallback to synchronized acquisition
//! is exercised.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::{
    ChannelKind, ChannelSpec, HardwareTask, OutputChunk, RefillCallback, SampleTiming,
    ScanHardware, TimingMode,
};
use crate::error::{Result, ScanError};
use crate::timing::TimingCapabilities;

/// Analog input signal: `(physical channel, sample index) -> raw code`.
pub type AnalogSignal = Arc<dyn Fn(u32, u64) -> i16 + Send + Sync>;

/// Counter signal: `(counter index, sample index) -> edges in that sample`.
pub type CounterSignal = Arc<dyn Fn(u32, u64) -> u32 + Send + Sync>;

/// Configuration of the simulated device.
#[derive(Clone)]
pub struct SimConfig {
    /// Clock and buffer limits
    pub capabilities: TimingCapabilities,
    /// Highest aggregate continuous input rate (samples/s over all channels)
    pub max_continuous_input_rate: Option<f64>,
    /// Pace input reads to wall-clock time
    pub pace: bool,
    analog_signal: AnalogSignal,
    counter_signal: CounterSignal,
}

impl fmt::Debug for SimConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimConfig")
            .field("capabilities", &self.capabilities)
            .field("max_continuous_input_rate", &self.max_continuous_input_rate)
            .field("pace", &self.pace)
            .finish_non_exhaustive()
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            capabilities: TimingCapabilities::default(),
            max_continuous_input_rate: None,
            pace: false,
            analog_signal: Arc::new(|channel, index| {
                // Slow triangle per channel, offset so channels differ
                let phase = ((index / 16) % 512) as i32;
                let tri = if phase < 256 { phase } else { 511 - phase };
                ((tri - 128) * 64 + channel as i32) as i16
            }),
            counter_signal: Arc::new(|channel, index| ((index + channel as u64) % 3) as u32),
        }
    }
}

impl SimConfig {
    /// Set the timing capabilities.
    pub fn with_capabilities(mut self, capabilities: TimingCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Reject continuous input above this aggregate rate.
    pub fn with_max_continuous_input_rate(mut self, rate: f64) -> Self {
        self.max_continuous_input_rate = Some(rate);
        self
    }

    /// Enable or disable real-time pacing.
    pub fn with_pacing(mut self, pace: bool) -> Self {
        self.pace = pace;
        self
    }

    /// Replace the analog input signal generator.
    pub fn with_analog_signal(
        mut self,
        signal: impl Fn(u32, u64) -> i16 + Send + Sync + 'static,
    ) -> Self {
        self.analog_signal = Arc::new(signal);
        self
    }

    /// Replace the counter signal generator.
    pub fn with_counter_signal(
        mut self,
        signal: impl Fn(u32, u64) -> u32 + Send + Sync + 'static,
    ) -> Self {
        self.counter_signal = Arc::new(signal);
        self
    }
}

/// One change of a static digital line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEvent {
    /// Line number
    pub line: u32,
    /// New level
    pub high: bool,
    /// When it was written
    pub at: Instant,
}

/// Counters describing what the simulated device did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Tasks created
    pub tasks_created: u64,
    /// Successful task starts
    pub tasks_started: u64,
    /// Refill callbacks that returned data
    pub refills: u64,
    /// Output underruns
    pub underruns: u64,
    /// Input samples delivered (per channel)
    pub samples_read: u64,
}

#[derive(Default)]
struct SimCounters {
    tasks_created: AtomicU64,
    tasks_started: AtomicU64,
    refills: AtomicU64,
    underruns: AtomicU64,
    samples_read: AtomicU64,
}

// ===== Shared clock =====

struct Refill {
    every_n: u64,
    next_at: u64,
    callback: RefillCallback,
}

/// Queue state of a running output task.
struct OutputState {
    name: String,
    kind: ChannelKind,
    n_channels: u64,
    period_ticks: u64,
    origin: u64,
    finite_total: Option<u64>,
    consumed: u64,
    written: u64,
    regenerate: bool,
    refill: Option<Refill>,
    fault: Option<ScanError>,
}

impl OutputState {
    fn new(name: &str, kind: ChannelKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            n_channels: 1,
            period_ticks: 0,
            origin: 0,
            finite_total: None,
            consumed: 0,
            written: 0,
            regenerate: false,
            refill: None,
            fault: None,
        }
    }

    fn queue(&mut self, chunk: OutputChunk) {
        let matches_kind = matches!(
            (&chunk, self.kind),
            (OutputChunk::Analog(_), ChannelKind::AnalogOutput)
                | (OutputChunk::Digital(_), ChannelKind::DigitalOutput)
        );
        if !matches_kind || chunk.len() as u64 % self.n_channels != 0 {
            warn!(task = %self.name, len = chunk.len(), "Discarding malformed refill chunk");
            return;
        }
        self.written += chunk.len() as u64 / self.n_channels;
    }

    /// Consume queued samples up to clock time `now`.
    fn advance(&mut self, now: u64, counters: &SimCounters) -> Result<()> {
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }
        if self.period_ticks == 0 {
            return Ok(());
        }

        let mut target = now.saturating_sub(self.origin) / self.period_ticks;
        if let Some(total) = self.finite_total {
            target = target.min(total);
        }

        while self.consumed < target {
            let step_end = match &self.refill {
                Some(refill) if !self.regenerate => target.min(refill.next_at),
                _ => target,
            };
            if !self.regenerate && step_end > self.written {
                counters.underruns.fetch_add(1, Ordering::Relaxed);
                let err = ScanError::BufferUnderrun {
                    task: self.name.clone(),
                };
                warn!(
                    task = %self.name,
                    consumed = self.consumed,
                    written = self.written,
                    "Output buffer underrun"
                );
                self.fault = Some(err.clone());
                return Err(err);
            }
            self.consumed = step_end;

            if self.regenerate {
                continue;
            }
            let refilled = match self.refill.as_mut() {
                Some(refill) if self.consumed == refill.next_at => {
                    refill.next_at += refill.every_n;
                    (refill.callback)()
                }
                _ => None,
            };
            if let Some(chunk) = refilled {
                counters.refills.fetch_add(1, Ordering::Relaxed);
                self.queue(chunk);
            }
        }
        Ok(())
    }

    fn is_done(&self) -> bool {
        match self.finite_total {
            Some(total) => self.consumed >= total,
            None => false,
        }
    }
}

#[derive(Default)]
struct Bus {
    now: u64,
    running: usize,
    outputs: Vec<Arc<Mutex<OutputState>>>,
}

impl Bus {
    fn attach(&mut self) -> u64 {
        if self.running == 0 {
            self.now = 0;
        }
        self.running += 1;
        self.now
    }

    fn detach(&mut self, output: Option<&Arc<Mutex<OutputState>>>) {
        self.running = self.running.saturating_sub(1);
        if let Some(output) = output {
            self.outputs.retain(|o| !Arc::ptr_eq(o, output));
        }
    }

    fn advance_to(&mut self, time: u64, counters: &SimCounters) -> Result<()> {
        self.now = self.now.max(time);
        for output in &self.outputs {
            output.lock().advance(self.now, counters)?;
        }
        Ok(())
    }
}

struct SimShared {
    bus: Mutex<Bus>,
    static_lines: Mutex<BTreeMap<u32, bool>>,
    line_history: Mutex<Vec<LineEvent>>,
    park: Mutex<Option<(u16, u16)>>,
    read_faults: AtomicU32,
    stopped_reads: AtomicU32,
    counters: SimCounters,
}

// ===== Device =====

/// Simulated multi-function DAQ device.
pub struct SimHardware {
    config: SimConfig,
    shared: Arc<SimShared>,
}

impl Default for SimHardware {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SimHardware {
    /// Create a simulated device.
    pub fn new(config: SimConfig) -> Self {
        info!(
            base_clock_hz = config.capabilities.base_clock_hz,
            max_continuous_input_rate = ?config.max_continuous_input_rate,
            pace = config.pace,
            "Created simulated scan hardware"
        );
        Self {
            config,
            shared: Arc::new(SimShared {
                bus: Mutex::new(Bus::default()),
                static_lines: Mutex::new(BTreeMap::new()),
                line_history: Mutex::new(Vec::new()),
                park: Mutex::new(None),
                read_faults: AtomicU32::new(0),
                stopped_reads: AtomicU32::new(0),
                counters: SimCounters::default(),
            }),
        }
    }

    /// Current level of a static line, if it was ever written.
    pub fn static_line(&self, line: u32) -> Option<bool> {
        self.shared.static_lines.lock().get(&line).copied()
    }

    /// Every static line change in order.
    pub fn line_history(&self) -> Vec<LineEvent> {
        self.shared.line_history.lock().clone()
    }

    /// Last parked beam position.
    pub fn park_position(&self) -> Option<(u16, u16)> {
        *self.shared.park.lock()
    }

    /// Make the next `count` input reads fail with a hardware error.
    pub fn inject_read_faults(&self, count: u32) {
        self.shared.read_faults.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` input reads fail as if the task had just been
    /// stopped by another thread.
    pub fn inject_stopped_reads(&self, count: u32) {
        self.shared.stopped_reads.store(count, Ordering::SeqCst);
    }

    /// Snapshot of the device counters.
    pub fn stats(&self) -> SimStats {
        let c = &self.shared.counters;
        SimStats {
            tasks_created: c.tasks_created.load(Ordering::Relaxed),
            tasks_started: c.tasks_started.load(Ordering::Relaxed),
            refills: c.refills.load(Ordering::Relaxed),
            underruns: c.underruns.load(Ordering::Relaxed),
            samples_read: c.samples_read.load(Ordering::Relaxed),
        }
    }
}

impl ScanHardware for SimHardware {
    fn capabilities(&self) -> &TimingCapabilities {
        &self.config.capabilities
    }

    fn create_task(&self, kind: ChannelKind, name: &str) -> Result<Box<dyn HardwareTask>> {
        self.shared
            .counters
            .tasks_created
            .fetch_add(1, Ordering::Relaxed);
        debug!(task = name, %kind, "Created simulated task");
        Ok(Box::new(SimTask {
            name: name.to_string(),
            kind,
            channels: Vec::new(),
            timing: None,
            state: RunState::Idle,
            master: None,
            output: Arc::new(Mutex::new(OutputState::new(name, kind))),
            input_position: 0,
            input_origin: 0,
            started_at: None,
            config: self.config.clone(),
            shared: Arc::clone(&self.shared),
        }))
    }

    fn closest_period(&self, kind: ChannelKind, n_channels: usize, period: f64) -> Result<f64> {
        self.config
            .capabilities
            .closest_period(kind, n_channels, period)
    }

    fn write_static_lines(&self, levels: &[(u32, bool)]) -> Result<()> {
        let now = Instant::now();
        let mut lines = self.shared.static_lines.lock();
        let mut history = self.shared.line_history.lock();
        for &(line, high) in levels {
            lines.insert(line, high);
            history.push(LineEvent { line, high, at: now });
            trace!(line, high, "Static line written");
        }
        Ok(())
    }

    fn write_static_position(&self, x: u16, y: u16) -> Result<()> {
        *self.shared.park.lock() = Some((x, y));
        debug!(x, y, "Beam parked");
        Ok(())
    }
}

// ===== Tasks =====

/// Consume one injected fault, if any.
fn take_one(faults: &AtomicU32) -> bool {
    faults
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
struct TaskTiming {
    period_ticks: u64,
    mode: TimingMode,
    samples_per_channel: usize,
}

struct SimTask {
    name: String,
    kind: ChannelKind,
    channels: Vec<ChannelSpec>,
    timing: Option<TaskTiming>,
    state: RunState,
    master: Option<(String, u32)>,
    output: Arc<Mutex<OutputState>>,
    input_position: u64,
    input_origin: u64,
    started_at: Option<Instant>,
    config: SimConfig,
    shared: Arc<SimShared>,
}

impl SimTask {
    fn caps(&self) -> &TimingCapabilities {
        &self.config.capabilities
    }

    fn check_running(&self) -> Result<TaskTiming> {
        match (self.state, self.timing) {
            (RunState::Running, Some(timing)) => Ok(timing),
            (RunState::Stopped, _) => Err(ScanError::TaskStopped {
                task: self.name.clone(),
            }),
            _ => Err(ScanError::hardware(format!(
                "task '{}' is not running",
                self.name
            ))),
        }
    }

    fn check_kind(&self, expected: ChannelKind) -> Result<()> {
        if self.kind != expected {
            return Err(ScanError::hardware(format!(
                "task '{}' is {}, not {}",
                self.name, self.kind, expected
            )));
        }
        Ok(())
    }

    fn write_output(&mut self, chunk: OutputChunk) -> Result<usize> {
        if self.state == RunState::Stopped {
            return Err(ScanError::TaskStopped {
                task: self.name.clone(),
            });
        }
        let n_channels = self.channels.len().max(1);
        if chunk.len() % n_channels != 0 {
            return Err(ScanError::hardware(format!(
                "{} values do not divide into {} channel(s)",
                chunk.len(),
                n_channels
            )));
        }
        let samples = chunk.len() / n_channels;
        let mut output = self.output.lock();
        if let Some(fault) = &output.fault {
            return Err(fault.clone());
        }
        output.n_channels = n_channels as u64;
        output.queue(chunk);
        Ok(samples)
    }

    /// Advance the input cursor by up to `requested` samples and return the
    /// index of the first one together with the count actually read.
    fn advance_input(&mut self, requested: usize, timeout: Duration) -> Result<(u64, usize)> {
        let timing = self.check_running()?;

        if take_one(&self.shared.stopped_reads) {
            return Err(ScanError::TaskStopped {
                task: self.name.clone(),
            });
        }
        if take_one(&self.shared.read_faults) {
            return Err(ScanError::hardware(format!(
                "simulated read fault on '{}'",
                self.name
            )));
        }

        let mut n = requested as u64;
        if timing.mode == TimingMode::Finite {
            n = n.min((timing.samples_per_channel as u64).saturating_sub(self.input_position));
        }
        let end = self.input_position + n;
        let elapsed_ticks = end * timing.period_ticks;

        if self.config.pace {
            if let Some(started) = self.started_at {
                let due =
                    started + Duration::from_secs_f64(self.caps().ticks_to_period(elapsed_ticks));
                let now = Instant::now();
                if due > now {
                    let wait = due - now;
                    if wait > timeout {
                        thread::sleep(timeout);
                        return Err(ScanError::IoTimeout {
                            task: self.name.clone(),
                            timeout_ms: timeout.as_millis() as u64,
                        });
                    }
                    thread::sleep(wait);
                }
            }
        }

        self.shared
            .bus
            .lock()
            .advance_to(self.input_origin + elapsed_ticks, &self.shared.counters)?;

        let start = self.input_position;
        self.input_position = end;
        self.shared
            .counters
            .samples_read
            .fetch_add(n, Ordering::Relaxed);
        Ok((start, n as usize))
    }

    fn per_channel(&self, buf_len: usize) -> Result<usize> {
        let n_channels = self.channels.len();
        if n_channels == 0 || buf_len % n_channels != 0 {
            return Err(ScanError::hardware(format!(
                "buffer of {} values does not fit {} channel(s) on '{}'",
                buf_len, n_channels, self.name
            )));
        }
        Ok(buf_len / n_channels)
    }
}

impl HardwareTask for SimTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn add_channel(&mut self, spec: ChannelSpec) -> Result<()> {
        if self.state != RunState::Idle {
            return Err(ScanError::hardware(format!(
                "cannot add channels to '{}' after start",
                self.name
            )));
        }
        if spec.range.span() <= 0.0 {
            return Err(ScanError::config(format!(
                "channel {} has an empty voltage range",
                spec.channel
            )));
        }
        self.channels.push(spec);
        Ok(())
    }

    fn n_channels(&self) -> usize {
        self.channels.len()
    }

    fn configure_timing(&mut self, timing: SampleTiming) -> Result<f64> {
        if !(timing.rate > 0.0) {
            return Err(ScanError::config(format!(
                "sample rate {} Hz must be positive",
                timing.rate
            )));
        }
        let caps = self.caps();
        let period = caps.closest_period(self.kind, self.channels.len(), 1.0 / timing.rate)?;
        let period_ticks = caps.period_to_ticks(period);

        if self.kind.is_output() {
            if timing.samples_per_channel < caps.min_buffer_len {
                return Err(ScanError::config(format!(
                    "output buffer of {} sample(s) is below the minimum of {}",
                    timing.samples_per_channel, caps.min_buffer_len
                )));
            }
            if timing.mode == TimingMode::Continuous
                && timing.samples_per_channel > caps.max_buffer_len
            {
                return Err(ScanError::config(format!(
                    "output buffer of {} samples exceeds the maximum of {}",
                    timing.samples_per_channel, caps.max_buffer_len
                )));
            }
        }

        let accepted = 1.0 / period;
        self.timing = Some(TaskTiming {
            period_ticks,
            mode: timing.mode,
            samples_per_channel: timing.samples_per_channel,
        });
        debug!(
            task = %self.name,
            requested = timing.rate,
            accepted,
            mode = ?timing.mode,
            samples = timing.samples_per_channel,
            "Configured sample clock"
        );
        Ok(accepted)
    }

    fn follow_start_of(&mut self, master: &str, delay_ticks: u32) -> Result<()> {
        self.master = Some((master.to_string(), delay_ticks));
        Ok(())
    }

    fn set_regeneration(&mut self, enabled: bool) -> Result<()> {
        if !self.kind.is_output() {
            return Err(ScanError::hardware(format!(
                "regeneration is only valid on output tasks, not '{}'",
                self.name
            )));
        }
        self.output.lock().regenerate = enabled;
        Ok(())
    }

    fn register_refill(&mut self, every_n: usize, callback: RefillCallback) -> Result<()> {
        if !self.kind.is_output() || every_n == 0 {
            return Err(ScanError::hardware(format!(
                "invalid refill registration on '{}'",
                self.name
            )));
        }
        self.output.lock().refill = Some(Refill {
            every_n: every_n as u64,
            next_at: every_n as u64,
            callback,
        });
        Ok(())
    }

    fn write_analog(&mut self, data: &[u16], _timeout: Duration) -> Result<usize> {
        self.check_kind(ChannelKind::AnalogOutput)?;
        self.write_output(OutputChunk::Analog(data.to_vec()))
    }

    fn write_digital(&mut self, data: &[u32], _timeout: Duration) -> Result<usize> {
        self.check_kind(ChannelKind::DigitalOutput)?;
        self.write_output(OutputChunk::Digital(data.to_vec()))
    }

    fn read_analog(&mut self, buf: &mut [i16], timeout: Duration) -> Result<usize> {
        self.check_kind(ChannelKind::AnalogInput)?;
        let requested = self.per_channel(buf.len())?;
        let (first, n) = self.advance_input(requested, timeout)?;
        let signal = &self.config.analog_signal;
        let n_channels = self.channels.len();
        for s in 0..n {
            for (c, spec) in self.channels.iter().enumerate() {
                buf[s * n_channels + c] = signal(spec.channel, first + s as u64);
            }
        }
        Ok(n)
    }

    fn read_counter(&mut self, buf: &mut [u32], timeout: Duration) -> Result<usize> {
        self.check_kind(ChannelKind::Counter)?;
        let requested = self.per_channel(buf.len())?;
        let (first, n) = self.advance_input(requested, timeout)?;
        let signal = &self.config.counter_signal;
        let n_channels = self.channels.len();
        for s in 0..n {
            for (c, spec) in self.channels.iter().enumerate() {
                buf[s * n_channels + c] = signal(spec.channel, first + s as u64);
            }
        }
        Ok(n)
    }

    fn start(&mut self) -> Result<()> {
        if self.state == RunState::Running {
            return Ok(());
        }
        let timing = self.timing.ok_or_else(|| {
            ScanError::hardware(format!("task '{}' has no sample clock configured", self.name))
        })?;
        if self.channels.is_empty() {
            return Err(ScanError::hardware(format!(
                "task '{}' has no channels",
                self.name
            )));
        }

        if !self.kind.is_output() && timing.mode == TimingMode::Continuous {
            if let Some(limit) = self.config.max_continuous_input_rate {
                let rate = self.caps().base_clock_hz / timing.period_ticks as f64
                    * self.channels.len() as f64;
                if rate > limit {
                    return Err(ScanError::ContinuousRejected {
                        rate,
                        message: format!(
                            "'{}' exceeds the {:.0} S/s continuous transfer limit",
                            self.name, limit
                        ),
                    });
                }
            }
        }

        let mut bus = self.shared.bus.lock();
        if self.kind.is_output() {
            let min_len = self.caps().min_buffer_len as u64;
            let mut output = self.output.lock();
            if output.written < min_len {
                return Err(ScanError::hardware(format!(
                    "task '{}' started with {} queued sample(s), minimum is {}",
                    self.name, output.written, min_len
                )));
            }
            output.n_channels = self.channels.len() as u64;
            output.period_ticks = timing.period_ticks;
            output.finite_total = match timing.mode {
                TimingMode::Finite => Some(timing.samples_per_channel as u64),
                TimingMode::Continuous => None,
            };
            output.consumed = 0;
            output.fault = None;
            drop(output);
            output_origin(&mut bus, &self.output);
        } else {
            self.input_origin = bus.attach();
            self.input_position = 0;
        }
        drop(bus);

        self.state = RunState::Running;
        self.started_at = Some(Instant::now());
        self.shared
            .counters
            .tasks_started
            .fetch_add(1, Ordering::Relaxed);
        debug!(
            task = %self.name,
            master = ?self.master.as_ref().map(|(m, _)| m.as_str()),
            "Started simulated task"
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.state != RunState::Running {
            self.state = RunState::Stopped;
            return Ok(());
        }
        let output = self.kind.is_output().then_some(&self.output);
        self.shared.bus.lock().detach(output);
        self.state = RunState::Stopped;
        debug!(task = %self.name, "Stopped simulated task");
        Ok(())
    }

    fn is_done(&self) -> Result<bool> {
        let timing = match (self.state, self.timing) {
            (RunState::Idle, _) | (_, None) => return Ok(false),
            (_, Some(timing)) => timing,
        };
        if timing.mode == TimingMode::Continuous {
            return Ok(false);
        }
        if self.kind.is_output() {
            let output = self.output.lock();
            if let Some(fault) = &output.fault {
                return Err(fault.clone());
            }
            Ok(output.is_done())
        } else {
            Ok(self.input_position >= timing.samples_per_channel as u64)
        }
    }
}

fn output_origin(bus: &mut Bus, output: &Arc<Mutex<OutputState>>) {
    let origin = bus.attach();
    output.lock().origin = origin;
    bus.outputs.push(Arc::clone(output));
}

impl Drop for SimTask {
    fn drop(&mut self) {
        if self.state == RunState::Running {
            if let Err(e) = self.stop() {
                warn!(task = %self.name, error = %e, "Error stopping task on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn analog_task(
        hw: &SimHardware,
        kind: ChannelKind,
        name: &str,
        channels: u32,
    ) -> Box<dyn HardwareTask> {
        let mut task = hw.create_task(kind, name).unwrap();
        for ch in 0..channels {
            task.add_channel(ChannelSpec::new(ch)).unwrap();
        }
        task
    }

    #[test]
    fn test_finite_output_follows_input_clock() {
        let hw = SimHardware::default();
        let mut ao = analog_task(&hw, ChannelKind::AnalogOutput, "ao", 2);
        ao.configure_timing(SampleTiming {
            rate: 1e6,
            mode: TimingMode::Finite,
            samples_per_channel: 8,
        })
        .unwrap();
        ao.write_analog(&[0; 16], TIMEOUT).unwrap();

        let mut ai = analog_task(&hw, ChannelKind::AnalogInput, "ai", 1);
        ai.configure_timing(SampleTiming {
            rate: 2e6,
            mode: TimingMode::Finite,
            samples_per_channel: 16,
        })
        .unwrap();

        ao.start().unwrap();
        ai.start().unwrap();
        let mut buf = [0i16; 8];
        assert_eq!(ai.read_analog(&mut buf, TIMEOUT).unwrap(), 8);
        assert!(!ao.is_done().unwrap());
        assert_eq!(ai.read_analog(&mut buf, TIMEOUT).unwrap(), 8);
        assert!(ao.is_done().unwrap());
        assert!(ai.is_done().unwrap());
        // Finite input is exhausted
        assert_eq!(ai.read_analog(&mut buf, TIMEOUT).unwrap(), 0);
    }

    #[test]
    fn test_underrun_without_refill() {
        let hw = SimHardware::default();
        let mut ao = analog_task(&hw, ChannelKind::AnalogOutput, "ao", 1);
        ao.configure_timing(SampleTiming {
            rate: 1e6,
            mode: TimingMode::Continuous,
            samples_per_channel: 4,
        })
        .unwrap();
        ao.write_analog(&[0; 4], TIMEOUT).unwrap();

        let mut ai = analog_task(&hw, ChannelKind::AnalogInput, "ai", 1);
        ai.configure_timing(SampleTiming {
            rate: 1e6,
            mode: TimingMode::Continuous,
            samples_per_channel: 64,
        })
        .unwrap();
        ao.start().unwrap();
        ai.start().unwrap();

        let mut buf = [0i16; 8];
        let err = ai.read_analog(&mut buf, TIMEOUT).unwrap_err();
        assert!(matches!(err, ScanError::BufferUnderrun { .. }));
        assert_eq!(hw.stats().underruns, 1);
    }

    #[test]
    fn test_refill_keeps_output_fed() {
        let hw = SimHardware::default();
        let mut ao = analog_task(&hw, ChannelKind::AnalogOutput, "ao", 1);
        ao.configure_timing(SampleTiming {
            rate: 1e6,
            mode: TimingMode::Continuous,
            samples_per_channel: 8,
        })
        .unwrap();
        ao.write_analog(&[0; 8], TIMEOUT).unwrap();
        ao.register_refill(4, Box::new(|| Some(OutputChunk::Analog(vec![1; 4]))))
            .unwrap();

        let mut ai = analog_task(&hw, ChannelKind::AnalogInput, "ai", 1);
        ai.configure_timing(SampleTiming {
            rate: 1e6,
            mode: TimingMode::Continuous,
            samples_per_channel: 64,
        })
        .unwrap();
        ao.start().unwrap();
        ai.start().unwrap();

        let mut buf = [0i16; 10];
        for _ in 0..10 {
            ai.read_analog(&mut buf, TIMEOUT).unwrap();
        }
        assert_eq!(hw.stats().refills, 25);
    }

    #[test]
    fn test_continuous_rate_limit() {
        let hw = SimHardware::new(SimConfig::default().with_max_continuous_input_rate(1e6));
        let mut ai = analog_task(&hw, ChannelKind::AnalogInput, "ai", 2);
        ai.configure_timing(SampleTiming {
            rate: 1e6,
            mode: TimingMode::Continuous,
            samples_per_channel: 64,
        })
        .unwrap();
        let err = ai.start().unwrap_err();
        assert!(matches!(err, ScanError::ContinuousRejected { .. }));

        // Finite timing at the same rate is fine
        ai.configure_timing(SampleTiming {
            rate: 1e6,
            mode: TimingMode::Finite,
            samples_per_channel: 64,
        })
        .unwrap();
        ai.start().unwrap();
    }

    #[test]
    fn test_io_after_stop_reports_already_stopped() {
        let hw = SimHardware::default();
        let mut ai = analog_task(&hw, ChannelKind::AnalogInput, "ai", 1);
        ai.configure_timing(SampleTiming {
            rate: 1e6,
            mode: TimingMode::Continuous,
            samples_per_channel: 64,
        })
        .unwrap();
        ai.start().unwrap();
        ai.stop().unwrap();
        ai.stop().unwrap();
        let mut buf = [0i16; 4];
        let err = ai.read_analog(&mut buf, TIMEOUT).unwrap_err();
        assert!(err.is_already_stopped());
    }

    #[test]
    fn test_output_below_minimum_buffer_rejected() {
        let hw = SimHardware::default();
        let mut ao = analog_task(&hw, ChannelKind::AnalogOutput, "ao", 2);
        let err = ao
            .configure_timing(SampleTiming {
                rate: 1e6,
                mode: TimingMode::Finite,
                samples_per_channel: 1,
            })
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidConfig { .. }));
    }

    #[test]
    fn test_signal_generators_and_faults() {
        let hw = SimHardware::new(SimConfig::default().with_analog_signal(|channel, index| {
            (channel * 100) as i16 + index as i16
        }));
        let mut ai = analog_task(&hw, ChannelKind::AnalogInput, "ai", 2);
        ai.configure_timing(SampleTiming {
            rate: 1e5,
            mode: TimingMode::Continuous,
            samples_per_channel: 64,
        })
        .unwrap();
        ai.start().unwrap();
        let mut buf = [0i16; 6];
        ai.read_analog(&mut buf, TIMEOUT).unwrap();
        assert_eq!(buf, [0, 100, 1, 101, 2, 102]);

        hw.inject_read_faults(1);
        assert!(matches!(
            ai.read_analog(&mut buf, TIMEOUT),
            Err(ScanError::Hardware { .. })
        ));
        ai.read_analog(&mut buf, TIMEOUT).unwrap();
        assert_eq!(buf[0], 3);

        hw.inject_stopped_reads(1);
        let err = ai.read_analog(&mut buf, TIMEOUT).unwrap_err();
        assert!(err.is_already_stopped());
        ai.read_analog(&mut buf, TIMEOUT).unwrap();
        assert_eq!(buf[0], 6);
    }

    #[test]
    fn test_static_lines_and_park() {
        let hw = SimHardware::default();
        hw.write_static_lines(&[(3, true), (4, false)]).unwrap();
        hw.write_static_lines(&[(3, false)]).unwrap();
        assert_eq!(hw.static_line(3), Some(false));
        assert_eq!(hw.static_line(4), Some(false));
        assert_eq!(hw.static_line(5), None);
        assert_eq!(hw.line_history().len(), 3);

        hw.write_static_position(10, 20).unwrap();
        assert_eq!(hw.park_position(), Some((10, 20)));
    }
}
