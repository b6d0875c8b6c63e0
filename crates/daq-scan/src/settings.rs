//! Per-run acquisition descriptor and chunk sizing.

use std::sync::Arc;
use std::time::Duration;

use daq_core::limits::validate_frame_size;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::detector::Detector;
use crate::error::{Result, ScanError};
use crate::hal::{ChannelKind, ScanHardware};
use crate::period::{NegotiatedTiming, NegotiationConfig, PeriodNegotiator};
use crate::timing::TimingCapabilities;
use crate::waveform::{
    BeamGeometry, FastLines, FrameWaveform, ScanPattern, WaveformCache, WaveformKey,
};

/// Scanner-facing parameters of the next frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanSettings {
    /// Positions per line and number of lines
    pub resolution: [usize; 2],
    /// Logical distance between positions
    pub scale: [f64; 2],
    /// Logical offset of the frame centre
    pub translation: [f64; 2],
    /// Requested dwell time in seconds
    pub dwell_time: f64,
    /// Settle positions per line
    pub margin: usize,
    /// Vector path replacing the raster, in logical coordinates
    pub path: Option<Arc<[[f64; 2]]>>,
    /// Clocked status-line layout
    pub fast_lines: FastLines,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            resolution: [256, 256],
            scale: [8.0, 8.0],
            translation: [0.0, 0.0],
            dwell_time: 1e-6,
            margin: 0,
            path: None,
            fast_lines: FastLines::default(),
        }
    }
}

impl ScanSettings {
    /// Reject parameters no frame can be built from.
    pub fn validate(&self, geometry: &BeamGeometry) -> Result<()> {
        check_resolution(self.resolution)?;
        check_scale(self.scale)?;
        check_translation(self.translation)?;
        if !self.dwell_time.is_finite() || self.dwell_time <= 0.0 {
            return Err(ScanError::config(format!(
                "dwell time {} s must be positive",
                self.dwell_time
            )));
        }
        if let Some(points) = &self.path {
            check_path(points, geometry.shape)?;
        }
        self.fast_lines.validate()
    }

    /// Trajectory described by these settings.
    pub fn pattern(&self) -> ScanPattern {
        match &self.path {
            Some(points) => ScanPattern::Path(Arc::clone(points)),
            None => ScanPattern::Raster {
                resolution: self.resolution,
                scale: self.scale,
                translation: self.translation,
                margin: self.margin,
            },
        }
    }
}

pub(crate) fn check_resolution(resolution: [usize; 2]) -> Result<()> {
    if resolution.contains(&0) {
        return Err(ScanError::config(format!(
            "resolution {}x{} must be non-zero",
            resolution[0], resolution[1]
        )));
    }
    Ok(())
}

pub(crate) fn check_scale(scale: [f64; 2]) -> Result<()> {
    if scale.iter().any(|v| !v.is_finite() || *v <= 0.0) {
        return Err(ScanError::config(format!("scale {:?} must be positive", scale)));
    }
    Ok(())
}

pub(crate) fn check_translation(translation: [f64; 2]) -> Result<()> {
    if translation.iter().any(|v| !v.is_finite()) {
        return Err(ScanError::config(format!("translation {:?} is not finite", translation)));
    }
    Ok(())
}

/// Points must lie inside `[-shape/2, shape/2]`.
pub(crate) fn check_path(points: &[[f64; 2]], shape: [f64; 2]) -> Result<()> {
    if points.is_empty() {
        return Err(ScanError::config("vector path has no points"));
    }
    let outside = points
        .iter()
        .find(|p| (0..2).any(|axis| !p[axis].is_finite() || p[axis].abs() > shape[axis] / 2.0));
    if let Some(p) = outside {
        return Err(ScanError::config(format!("path point {:?} lies outside the field", p)));
    }
    Ok(())
}

/// Scan parameters shared by the scanner facade and the acquisition loop.
#[derive(Debug)]
pub struct ScanState {
    settings: RwLock<ScanSettings>,
    cache: Mutex<WaveformCache>,
    geometry: BeamGeometry,
}

impl ScanState {
    /// Create the shared state.
    pub fn new(geometry: BeamGeometry, settings: ScanSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
            cache: Mutex::new(WaveformCache::new()),
            geometry,
        }
    }

    /// Snapshot of the current settings.
    pub fn settings(&self) -> ScanSettings {
        self.settings.read().clone()
    }

    /// Modify the settings in place.
    pub fn update<R>(&self, f: impl FnOnce(&mut ScanSettings) -> R) -> R {
        f(&mut self.settings.write())
    }

    /// Coordinate mapping of the position outputs.
    pub fn geometry(&self) -> &BeamGeometry {
        &self.geometry
    }

    /// Frames generated by the waveform cache so far.
    pub fn waveforms_generated(&self) -> u64 {
        self.cache.lock().generated()
    }

    /// Build a run descriptor from the current settings.
    pub fn build(
        &self,
        hardware: &dyn ScanHardware,
        analog_detectors: Vec<Detector>,
        counting_detectors: Vec<Detector>,
        continuous: bool,
        tuning: &RunTuning,
    ) -> Result<AcquisitionSettings> {
        let scan = self.settings();
        let mut cache = self.cache.lock();
        AcquisitionSettings::build(
            hardware,
            &scan,
            &self.geometry,
            &mut cache,
            analog_detectors,
            counting_detectors,
            continuous,
            tuning,
        )
    }
}

/// Tuning that shapes a run descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunTuning {
    /// Wall-clock length of one input chunk
    #[serde(with = "humantime_serde")]
    pub chunk_duration: Duration,
    /// Period negotiation search
    pub negotiation: NegotiationConfig,
}

impl Default for RunTuning {
    fn default() -> Self {
        Self {
            chunk_duration: Duration::from_millis(100),
            negotiation: NegotiationConfig::default(),
        }
    }
}

/// Transfer sizes of one channel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunking {
    /// Samples per channel moved per read or refill
    pub chunk: usize,
    /// Hardware buffer length in samples per channel
    pub buffer: usize,
    /// Samples per channel in one frame
    pub total: usize,
    /// Whether the frame does not fit the buffer and is refilled chunk by chunk
    pub streaming: bool,
}

/// Transfer sizes for every channel group of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    /// Position outputs
    pub ao: Chunking,
    /// Clocked status lines
    pub digital: Chunking,
    /// Analog and counter inputs
    pub input: Chunking,
}

impl ChunkPlan {
    /// Size chunks and buffers for one frame.
    #[allow(clippy::too_many_arguments)]
    pub fn compute(
        caps: &TimingCapabilities,
        timing: &NegotiatedTiming,
        line_len: usize,
        n_lines: usize,
        ao_total: usize,
        do_total: usize,
        chunk_duration: Duration,
        continuous: bool,
    ) -> Self {
        let ai_osr = timing.ai_osr as usize;
        let ao_osr = timing.ao_osr as usize;
        let input_total = line_len * n_lines * ai_osr;
        let target = (chunk_duration.as_secs_f64() / timing.ai_period).round().max(1.0) as usize;

        let mut ai_chunk = input_chunk(target, ai_osr, line_len, n_lines).max(caps.min_buffer_len);
        if !continuous {
            ai_chunk = ai_chunk.min(input_total);
        }
        let input = Chunking {
            chunk: ai_chunk,
            buffer: if continuous { ai_chunk * 4 } else { input_total },
            total: input_total,
            streaming: continuous,
        };

        let max_chunk = (caps.max_buffer_len / 2).max(caps.min_buffer_len);
        let ao_chunk = (ai_chunk * ao_osr)
            .div_ceil(ai_osr)
            .clamp(caps.min_buffer_len, max_chunk);
        let ao = output_chunking(caps, ao_chunk, ao_total);
        let digital = output_chunking(caps, (ao_chunk * 2).min(max_chunk), do_total);

        Self { ao, digital, input }
    }
}

/// Whole frames, else whole lines dividing the frame, else whole pixels
/// dividing a line, else the largest divisor of one pixel. Every choice
/// lands on a frame boundary after a whole number of chunks.
fn input_chunk(target: usize, osr: usize, line_len: usize, n_lines: usize) -> usize {
    let line = line_len * osr;
    let frame = line * n_lines;
    if frame <= target {
        frame * (target / frame)
    } else if line <= target {
        let max_lines = target / line;
        let lines = (1..=max_lines)
            .rev()
            .find(|k| n_lines % k == 0)
            .unwrap_or(1);
        lines * line
    } else if osr <= target {
        let max_pixels = target / osr;
        let pixels = (1..=max_pixels)
            .rev()
            .find(|k| line_len % k == 0)
            .unwrap_or(1);
        pixels * osr
    } else {
        (1..=target).rev().find(|d| osr % d == 0).unwrap_or(1)
    }
}

fn output_chunking(caps: &TimingCapabilities, chunk: usize, total: usize) -> Chunking {
    let streaming = total > caps.max_buffer_len;
    if streaming {
        Chunking {
            chunk,
            buffer: 2 * chunk,
            total,
            streaming,
        }
    } else {
        Chunking {
            chunk: chunk.min(total),
            buffer: total,
            total,
            streaming,
        }
    }
}

/// Immutable descriptor of one frame run.
#[derive(Debug, Clone)]
pub struct AcquisitionSettings {
    /// Analog detectors in channel order
    pub analog_detectors: Vec<Detector>,
    /// Counting detectors in channel order
    pub counting_detectors: Vec<Detector>,
    /// Negotiated clocks
    pub timing: NegotiatedTiming,
    /// Image `[width, height]`
    pub resolution: [usize; 2],
    /// Settle positions per line
    pub margin: usize,
    /// Positions in one frame, margins included
    pub positions_n: usize,
    /// Keep re-arming after one frame
    pub continuous: bool,
    /// Output samples for the frame
    pub waveform: Arc<FrameWaveform>,
    /// Clocked status-line layout
    pub fast_lines: FastLines,
    /// Transfer sizes
    pub chunks: ChunkPlan,
}

impl AcquisitionSettings {
    /// Negotiate timing, fetch the waveform and size the transfers.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        hardware: &dyn ScanHardware,
        scan: &ScanSettings,
        geometry: &BeamGeometry,
        cache: &mut WaveformCache,
        analog_detectors: Vec<Detector>,
        counting_detectors: Vec<Detector>,
        continuous: bool,
        tuning: &RunTuning,
    ) -> Result<Self> {
        if analog_detectors.is_empty() && counting_detectors.is_empty() {
            return Err(ScanError::config("no detector to acquire for"));
        }
        let pattern = scan.pattern();
        let resolution = pattern.image_resolution();
        if resolution.contains(&0) || pattern.n_positions() == 0 {
            return Err(ScanError::config(format!(
                "scan pattern {}x{} has no positions",
                resolution[0], resolution[1]
            )));
        }
        validate_frame_size(resolution[0] as u32, resolution[1] as u32, 8)
            .map_err(|e| ScanError::config(e.to_string()))?;

        // Counters follow the analog input clock
        let n_inputs = analog_detectors.len().max(1);
        let timing = PeriodNegotiator::with_config(hardware, tuning.negotiation)
            .negotiate(scan.dwell_time, n_inputs)?;

        let key = WaveformKey {
            geometry: geometry.clone(),
            pattern: pattern.clone(),
            ao_osr: timing.ao_osr,
            fast_lines: scan.fast_lines,
        };
        let waveform = cache.get_or_generate(&key);

        let margin = pattern.margin();
        let line_len = resolution[0] + margin;
        let n_lines = resolution[1];
        let chunks = ChunkPlan::compute(
            hardware.capabilities(),
            &timing,
            line_len,
            n_lines,
            waveform.n_samples(),
            waveform.status.as_ref().map_or(0, |s| s.len()),
            tuning.chunk_duration,
            continuous,
        );

        debug!(
            dwell = timing.dwell_time,
            ao_osr = timing.ao_osr,
            ai_osr = timing.ai_osr,
            width = resolution[0],
            height = resolution[1],
            margin,
            input_chunk = chunks.input.chunk,
            ao_streaming = chunks.ao.streaming,
            continuous,
            "Built acquisition settings"
        );

        Ok(Self {
            analog_detectors,
            counting_detectors,
            timing,
            resolution,
            margin,
            positions_n: waveform.n_positions,
            continuous,
            waveform,
            fast_lines: scan.fast_lines,
            chunks,
        })
    }

    /// Accepted dwell time in seconds.
    pub fn dwell_time(&self) -> f64 {
        self.timing.dwell_time
    }

    /// Sample rate of a channel group in Hz.
    pub fn sample_rate(&self, kind: ChannelKind) -> f64 {
        let period = match kind {
            ChannelKind::AnalogOutput => self.timing.ao_period,
            ChannelKind::DigitalOutput => self.timing.do_period,
            ChannelKind::AnalogInput | ChannelKind::Counter => self.timing.ai_period,
        };
        1.0 / period
    }

    /// Samples per channel in one frame.
    pub fn total_samples(&self, kind: ChannelKind) -> usize {
        match kind {
            ChannelKind::AnalogOutput => self.chunks.ao.total,
            ChannelKind::DigitalOutput => self.chunks.digital.total,
            ChannelKind::AnalogInput | ChannelKind::Counter => self.chunks.input.total,
        }
    }

    /// Transfer sizes of a channel group.
    pub fn chunking(&self, kind: ChannelKind) -> &Chunking {
        match kind {
            ChannelKind::AnalogOutput => &self.chunks.ao,
            ChannelKind::DigitalOutput => &self.chunks.digital,
            ChannelKind::AnalogInput | ChannelKind::Counter => &self.chunks.input,
        }
    }
}
