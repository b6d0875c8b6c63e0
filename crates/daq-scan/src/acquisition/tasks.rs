//! Channel groups of one run and how they are wired together.
//!
//! The input task that exists first is the master: analog input when any
//! analog detector is registered, the counter group otherwise. Every other
//! task starts off the master's start trigger, so the tasks are armed
//! followers first and master last.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::error::{Result, ScanError};
use crate::hal::{
    ChannelKind, ChannelSpec, HardwareTask, OutputChunk, Range, SampleTiming, ScanHardware,
    TimingMode,
};
use crate::settings::{AcquisitionSettings, Chunking};
use crate::waveform::FrameWaveform;

use super::{AcquisitionConfig, EngineCounters};

const AI_TASK: &str = "scan_ai";
const CI_TASK: &str = "scan_ci";
const AO_TASK: &str = "scan_ao";
const DO_TASK: &str = "scan_do";

enum FeedSource {
    Analog(Arc<FrameWaveform>),
    Digital(Arc<FrameWaveform>),
}

/// Cursor over a frame waveform that hands out output chunks, wrapping at
/// the frame end.
pub(crate) struct OutputFeeder {
    source: FeedSource,
    next: usize,
    remaining: Option<usize>,
}

impl OutputFeeder {
    fn analog(waveform: Arc<FrameWaveform>, remaining: Option<usize>) -> Self {
        Self {
            source: FeedSource::Analog(waveform),
            next: 0,
            remaining,
        }
    }

    fn digital(waveform: Arc<FrameWaveform>, remaining: Option<usize>) -> Self {
        Self {
            source: FeedSource::Digital(waveform),
            next: 0,
            remaining,
        }
    }

    fn len(&self) -> usize {
        match &self.source {
            FeedSource::Analog(w) => w.n_samples(),
            FeedSource::Digital(w) => w.status.as_ref().map_or(0, |s| s.len()),
        }
    }

    /// Next `n` samples per channel, or `None` once a finite frame is exhausted.
    pub fn take(&mut self, n: usize) -> Result<Option<OutputChunk>> {
        let n = match self.remaining {
            Some(0) => return Ok(None),
            Some(left) => n.min(left),
            None => n,
        };
        let len = self.len();
        if len == 0 || n == 0 {
            return Ok(None);
        }

        let start = self.next;
        let indices = (0..n).map(|i| (start + i) % len);
        let chunk = match &self.source {
            FeedSource::Analog(w) => {
                let flat = w
                    .positions
                    .as_slice()
                    .ok_or_else(|| ScanError::hardware("position waveform is not contiguous"))?;
                let mut out = Vec::with_capacity(n * 2);
                for i in indices {
                    out.extend_from_slice(&flat[i * 2..i * 2 + 2]);
                }
                OutputChunk::Analog(out)
            }
            FeedSource::Digital(w) => {
                let flat = w
                    .status
                    .as_ref()
                    .and_then(|s| s.as_slice())
                    .ok_or_else(|| ScanError::hardware("status waveform is not contiguous"))?;
                OutputChunk::Digital(indices.map(|i| flat[i]).collect())
            }
        };

        self.next = (start + n) % len;
        if let Some(left) = self.remaining.as_mut() {
            *left -= n;
        }
        Ok(Some(chunk))
    }
}

/// Every hardware task of one run.
pub(crate) struct RunTasks {
    pub ai: Option<Box<dyn HardwareTask>>,
    pub ci: Option<Box<dyn HardwareTask>>,
    pub ao: Box<dyn HardwareTask>,
    pub digital: Option<Box<dyn HardwareTask>>,
    io_timeout: Duration,
}

impl RunTasks {
    /// Create and configure the tasks for `settings`. Nothing is started.
    pub fn open(
        hardware: &dyn ScanHardware,
        settings: &AcquisitionSettings,
        config: &AcquisitionConfig,
        counters: &Arc<EngineCounters>,
        output_range: Range,
    ) -> Result<Self> {
        let mode = if settings.continuous {
            TimingMode::Continuous
        } else {
            TimingMode::Finite
        };
        let input = settings.chunks.input;
        let input_timing = SampleTiming {
            rate: settings.sample_rate(ChannelKind::AnalogInput),
            mode,
            samples_per_channel: input.buffer,
        };

        let mut ai = None;
        if !settings.analog_detectors.is_empty() {
            let mut task = hardware.create_task(ChannelKind::AnalogInput, AI_TASK)?;
            for det in &settings.analog_detectors {
                task.add_channel(det.channel().clone())?;
            }
            task.configure_timing(input_timing)?;
            ai = Some(task);
        }
        let master = if ai.is_some() { AI_TASK } else { CI_TASK };

        let mut ci = None;
        if !settings.counting_detectors.is_empty() {
            let mut task = hardware.create_task(ChannelKind::Counter, CI_TASK)?;
            for det in &settings.counting_detectors {
                task.add_channel(det.channel().clone())?;
            }
            task.configure_timing(input_timing)?;
            if master != CI_TASK {
                task.follow_start_of(master, 0)?;
            }
            ci = Some(task);
        }

        let mut ao = hardware.create_task(ChannelKind::AnalogOutput, AO_TASK)?;
        for &channel in &config.position_channels {
            ao.add_channel(ChannelSpec::new(channel).with_range(output_range))?;
        }
        let ao_chunks = settings.chunks.ao;
        ao.configure_timing(SampleTiming {
            rate: settings.sample_rate(ChannelKind::AnalogOutput),
            mode,
            samples_per_channel: output_samples(ao_chunks, settings.continuous),
        })?;
        ao.follow_start_of(master, config.trigger_delay_ticks)?;
        let feeder = OutputFeeder::analog(
            Arc::clone(&settings.waveform),
            (!settings.continuous).then_some(ao_chunks.total),
        );
        prime(
            ao.as_mut(),
            feeder,
            ao_chunks.chunk,
            ao_chunks.streaming,
            settings.continuous,
            counters,
        )?;

        let mut digital = None;
        if settings.waveform.status.is_some() {
            let mut task = hardware.create_task(ChannelKind::DigitalOutput, DO_TASK)?;
            task.add_channel(ChannelSpec::new(config.fast_line_port))?;
            let do_chunks = settings.chunks.digital;
            task.configure_timing(SampleTiming {
                rate: settings.sample_rate(ChannelKind::DigitalOutput),
                mode,
                samples_per_channel: output_samples(do_chunks, settings.continuous),
            })?;
            task.follow_start_of(master, config.trigger_delay_ticks)?;
            let feeder = OutputFeeder::digital(
                Arc::clone(&settings.waveform),
                (!settings.continuous).then_some(do_chunks.total),
            );
            prime(
                task.as_mut(),
                feeder,
                do_chunks.chunk,
                do_chunks.streaming,
                settings.continuous,
                counters,
            )?;
            digital = Some(task);
        }

        let nominal = Duration::from_secs_f64(
            input.chunk as f64 / settings.sample_rate(ChannelKind::AnalogInput),
        );
        debug!(
            master,
            analog = settings.analog_detectors.len(),
            counting = settings.counting_detectors.len(),
            status_lines = digital.is_some(),
            ?mode,
            "Opened acquisition tasks"
        );
        Ok(Self {
            ai,
            ci,
            ao,
            digital,
            io_timeout: nominal + config.io_timeout,
        })
    }

    /// Timeout for reading one chunk.
    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    /// Arm followers, then the master.
    pub fn start(&mut self) -> Result<()> {
        self.ao.start()?;
        if let Some(task) = self.digital.as_mut() {
            task.start()?;
        }
        match (self.ai.as_mut(), self.ci.as_mut()) {
            (Some(ai), Some(ci)) => {
                ci.start()?;
                ai.start()?;
            }
            (Some(ai), None) => ai.start()?,
            (None, Some(ci)) => ci.start()?,
            (None, None) => return Err(ScanError::config("run has no input task")),
        }
        Ok(())
    }

    /// Stop every task, master first. Errors are logged, not returned.
    pub fn stop_all(&mut self) {
        let tasks = self
            .ai
            .iter_mut()
            .chain(self.ci.iter_mut())
            .chain(std::iter::once(&mut self.ao))
            .chain(self.digital.iter_mut());
        for task in tasks {
            match task.is_done() {
                Ok(done) => trace!(task = task.name(), done, "Stopping task"),
                Err(e) => debug!(task = task.name(), error = %e, "Task reported error at stop"),
            }
            if let Err(e) = task.stop() {
                warn!(task = task.name(), error = %e, "Failed to stop task");
            }
        }
    }
}

/// Buffer size of a looping output, whole frame of a finite one.
fn output_samples(chunks: Chunking, continuous: bool) -> usize {
    if continuous {
        chunks.buffer
    } else {
        chunks.total
    }
}

/// Write the initial output buffer and, when streaming, hook up the refill.
fn prime(
    task: &mut dyn HardwareTask,
    mut feeder: OutputFeeder,
    chunk: usize,
    streaming: bool,
    continuous: bool,
    counters: &Arc<EngineCounters>,
) -> Result<()> {
    let timeout = Duration::from_secs(1);
    let first = if streaming { 2 * chunk } else { feeder.len() };
    match feeder.take(first)? {
        Some(OutputChunk::Analog(data)) => {
            task.write_analog(&data, timeout)?;
        }
        Some(OutputChunk::Digital(data)) => {
            task.write_digital(&data, timeout)?;
        }
        None => return Err(ScanError::config(format!("no output samples for '{}'", task.name()))),
    }

    if !streaming {
        return task.set_regeneration(continuous);
    }

    task.set_regeneration(false)?;
    let counters = Arc::clone(counters);
    let name = task.name().to_string();
    task.register_refill(
        chunk,
        Box::new(move || match feeder.take(chunk) {
            Ok(chunk) => chunk,
            Err(e) => {
                counters.callback_failures.fetch_add(1, Ordering::Relaxed);
                warn!(task = %name, error = %e, "Output refill failed");
                None
            }
        }),
    )
}
