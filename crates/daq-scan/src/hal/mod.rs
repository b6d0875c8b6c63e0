//! Hardware capability contract consumed by the scan engine.
//!
//! The engine never talks to a vendor library directly. Anything that can
//! open a channel group ("task"), clock it, start it from another task's start
//! event and move sample buffers in and out can drive it.
//!
//! # Model
//!
//! ```text
//!   ScanHardware ──create_task()──► HardwareTask (AO | DO | AI | CI)
//!        │                              │ add_channel / configure_timing
//!        │ closest_period()             │ follow_start_of / register_refill
//!        │ write_static_lines()         │ write_* / read_* / start / stop
//!        ▼ write_static_position()      ▼
//! ```
//!
//! Output tasks may be refilled from the hardware's callback context through a
//! [`RefillCallback`]; input tasks are always read from the owning thread.

pub mod sim;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::timing::TimingCapabilities;

pub use sim::{SimConfig, SimHardware};

/// Purpose of a channel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Beam position outputs
    AnalogOutput,
    /// Clocked status lines
    DigitalOutput,
    /// Detector voltages
    AnalogInput,
    /// Edge-counting detectors
    Counter,
}

impl ChannelKind {
    /// Whether samples flow from the host to the device.
    pub fn is_output(self) -> bool {
        matches!(self, Self::AnalogOutput | Self::DigitalOutput)
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AnalogOutput => write!(f, "Analog Output"),
            Self::DigitalOutput => write!(f, "Digital Output"),
            Self::AnalogInput => write!(f, "Analog Input"),
            Self::Counter => write!(f, "Counter"),
        }
    }
}

/// Voltage range of an analog channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    /// Minimum voltage
    pub min: f64,
    /// Maximum voltage
    pub max: f64,
}

impl Default for Range {
    fn default() -> Self {
        Self {
            min: -10.0,
            max: 10.0,
        }
    }
}

impl Range {
    /// Create a new range.
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Get the span (max - min) of this range.
    pub fn span(&self) -> f64 {
        self.max - self.min
    }

    /// Convert a voltage into an offset-binary 16-bit output code.
    pub fn voltage_to_code(&self, voltage: f64) -> u16 {
        let fraction = ((voltage - self.min) / self.span()).clamp(0.0, 1.0);
        (fraction * u16::MAX as f64).round() as u16
    }

    /// Convert a signed 16-bit input code into a voltage.
    pub fn code_to_voltage(&self, code: i16) -> f64 {
        let fraction = (code as f64 - i16::MIN as f64) / u16::MAX as f64;
        self.min + fraction * self.span()
    }
}

/// One physical channel inside a task.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    /// Physical channel number (AO/AI channel, counter index or DO line)
    pub channel: u32,
    /// Voltage range (ignored for digital and counter channels)
    pub range: Range,
}

impl ChannelSpec {
    /// Create a new channel specification with the default range.
    pub fn new(channel: u32) -> Self {
        Self {
            channel,
            range: Range::default(),
        }
    }

    /// Set the voltage range.
    pub fn with_range(mut self, range: Range) -> Self {
        self.range = range;
        self
    }
}

/// Whether a task stops by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingMode {
    /// Generate/acquire exactly `samples_per_channel` then stop
    Finite,
    /// Run until stopped; `samples_per_channel` sizes the buffer
    Continuous,
}

/// Sample-clock configuration for a task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleTiming {
    /// Requested sample rate in Hz
    pub rate: f64,
    /// Finite or continuous
    pub mode: TimingMode,
    /// Total samples (finite) or buffer size (continuous), per channel
    pub samples_per_channel: usize,
}

/// A chunk of output samples produced by a refill callback.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputChunk {
    /// Interleaved analog output codes
    Analog(Vec<u16>),
    /// Digital port bit-masks
    Digital(Vec<u32>),
}

impl OutputChunk {
    /// Number of raw values in the chunk.
    pub fn len(&self) -> usize {
        match self {
            Self::Analog(v) => v.len(),
            Self::Digital(v) => v.len(),
        }
    }

    /// Whether the chunk holds no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Called by the hardware every N transferred samples of an output task.
///
/// Returning `None` means nothing is written this round.
pub type RefillCallback = Box<dyn FnMut() -> Option<OutputChunk> + Send>;

/// A channel group owned by exactly one thread at a time.
pub trait HardwareTask: Send {
    /// Name given at creation.
    fn name(&self) -> &str;

    /// Kind given at creation.
    fn kind(&self) -> ChannelKind;

    /// Add one physical channel.
    fn add_channel(&mut self, spec: ChannelSpec) -> Result<()>;

    /// Number of channels added so far.
    fn n_channels(&self) -> usize;

    /// Configure the sample clock, returning the rate actually accepted.
    fn configure_timing(&mut self, timing: SampleTiming) -> Result<f64>;

    /// Start when the named task starts, `delay_ticks` clock ticks later.
    fn follow_start_of(&mut self, master: &str, delay_ticks: u32) -> Result<()>;

    /// Loop over the written buffer instead of consuming it.
    fn set_regeneration(&mut self, enabled: bool) -> Result<()>;

    /// Invoke `callback` every `every_n` samples transferred to the device.
    fn register_refill(&mut self, every_n: usize, callback: RefillCallback) -> Result<()>;

    /// Queue interleaved analog output codes. Returns samples per channel written.
    fn write_analog(&mut self, data: &[u16], timeout: Duration) -> Result<usize>;

    /// Queue digital port masks. Returns samples written.
    fn write_digital(&mut self, data: &[u32], timeout: Duration) -> Result<usize>;

    /// Read interleaved analog input codes. Returns samples per channel read.
    fn read_analog(&mut self, buf: &mut [i16], timeout: Duration) -> Result<usize>;

    /// Read counter values. Returns samples per channel read.
    fn read_counter(&mut self, buf: &mut [u32], timeout: Duration) -> Result<usize>;

    /// Arm the task (it may still wait for its start trigger).
    fn start(&mut self) -> Result<()>;

    /// Stop the task. Stopping a stopped task is not an error.
    fn stop(&mut self) -> Result<()>;

    /// Whether a finite task has transferred all its samples.
    fn is_done(&self) -> Result<bool>;
}

/// Device-level capabilities shared between the acquisition and status workers.
pub trait ScanHardware: Send + Sync {
    /// Clock and buffer limits of the device.
    fn capabilities(&self) -> &TimingCapabilities;

    /// Open a new channel group.
    fn create_task(&self, kind: ChannelKind, name: &str) -> Result<Box<dyn HardwareTask>>;

    /// Closest legal sample period that is `>= period`.
    fn closest_period(&self, kind: ChannelKind, n_channels: usize, period: f64) -> Result<f64>;

    /// Drive un-clocked digital lines. Each entry is `(line, high)`.
    fn write_static_lines(&self, levels: &[(u32, bool)]) -> Result<()>;

    /// Hold the beam at a fixed position (raw output codes).
    fn write_static_position(&self, x: u16, y: u16) -> Result<()>;
}
