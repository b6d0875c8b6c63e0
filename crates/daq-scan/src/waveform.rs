//! Beam trajectory and status-line waveforms.
//!
//! A frame is generated once per distinct set of scan parameters and then
//! reused for every chunk refill and every repeated frame.
//!
//! # Raster layout
//!
//! ```text
//!   line j:  [m m m | x0 x1 x2 ... x(w-1)]   m = held copy of x0 (settle)
//!             margin   resolution[0]
//! ```
//!
//! Every position is repeated `ao_osr` times so the output clock can run
//! faster than the dwell clock. Positions are centred on their pixel cell:
//! logical `x = (k + 0.5 - w/2) * scale + translation`.

use std::sync::Arc;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, ScanError};
use crate::hal::Range;

/// Mapping from logical scan coordinates to output codes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeamGeometry {
    /// Logical size of the full field per axis; it spans `[-shape/2, shape/2]`
    pub shape: [f64; 2],
    /// Voltage at the negative and positive field edge, per axis
    pub limits: [[f64; 2]; 2],
    /// Range of the position output channels
    pub output_range: Range,
}

impl Default for BeamGeometry {
    fn default() -> Self {
        Self {
            shape: [2048.0, 2048.0],
            limits: [[-5.0, 5.0], [-5.0, 5.0]],
            output_range: Range::default(),
        }
    }
}

impl BeamGeometry {
    /// Voltage for a logical coordinate on one axis.
    pub fn to_voltage(&self, axis: usize, logical: f64) -> f64 {
        let [lo, hi] = self.limits[axis];
        lo + (logical / self.shape[axis] + 0.5) * (hi - lo)
    }

    /// Output code for a logical coordinate on one axis.
    pub fn to_code(&self, axis: usize, logical: f64) -> u16 {
        self.output_range
            .voltage_to_code(self.to_voltage(axis, logical))
    }
}

/// Bit assignment of the clocked status lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FastLines {
    /// Toggles once per position
    pub pixel_bit: Option<u8>,
    /// High while the beam is on the non-margin part of a line
    pub line_bit: Option<u8>,
    /// High for the whole frame
    pub frame_bit: Option<u8>,
    /// Lines that are active-low
    pub inverted: u32,
}

impl FastLines {
    /// Every bit must fit the 32-line port and drive a distinct line.
    pub fn validate(&self) -> Result<()> {
        let bits: Vec<u8> = [self.pixel_bit, self.line_bit, self.frame_bit]
            .into_iter()
            .flatten()
            .collect();
        if bits.iter().any(|&b| b >= 32) {
            return Err(ScanError::config(format!("status line bits {:?} exceed the port", bits)));
        }
        if self.used_mask().count_ones() as usize != bits.len() {
            return Err(ScanError::config(format!("status line bits {:?} overlap", bits)));
        }
        Ok(())
    }

    /// Whether any clocked line is configured.
    pub fn is_enabled(&self) -> bool {
        self.pixel_bit.is_some() || self.line_bit.is_some() || self.frame_bit.is_some()
    }

    /// Port pattern with every line inactive.
    pub fn rest_pattern(&self) -> u32 {
        self.inverted & self.used_mask()
    }

    /// Mask of every line this layout drives.
    pub fn used_mask(&self) -> u32 {
        [self.pixel_bit, self.line_bit, self.frame_bit]
            .into_iter()
            .flatten()
            .fold(0, |acc, bit| acc | (1u32 << bit))
    }

    fn mask(bit: Option<u8>) -> u32 {
        bit.map_or(0, |b| 1u32 << b)
    }
}

/// What the beam should trace.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanPattern {
    /// Line-by-line raster
    Raster {
        /// Positions per line and number of lines
        resolution: [usize; 2],
        /// Logical distance between neighbouring positions
        scale: [f64; 2],
        /// Logical offset of the frame centre
        translation: [f64; 2],
        /// Settle positions prepended to every line
        margin: usize,
    },
    /// Arbitrary list of logical coordinates, already centred
    Path(Arc<[[f64; 2]]>),
}

impl ScanPattern {
    /// Number of beam positions in one frame, margins included.
    pub fn n_positions(&self) -> usize {
        match self {
            Self::Raster {
                resolution, margin, ..
            } => (resolution[0] + margin) * resolution[1],
            Self::Path(points) => points.len(),
        }
    }

    /// Image shape `(width, height)` produced by this pattern.
    pub fn image_resolution(&self) -> [usize; 2] {
        match self {
            Self::Raster { resolution, .. } => *resolution,
            Self::Path(points) => [points.len(), 1],
        }
    }

    /// Margin positions per line.
    pub fn margin(&self) -> usize {
        match self {
            Self::Raster { margin, .. } => *margin,
            Self::Path(_) => 0,
        }
    }
}

/// Everything the output tasks need for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameWaveform {
    /// `(samples, 2)` interleaved x/y output codes
    pub positions: Array2<u16>,
    /// Clocked status-line masks at twice the output rate
    pub status: Option<Array1<u32>>,
    /// Positions per frame, margins included
    pub n_positions: usize,
    /// Output ticks per position
    pub ao_osr: u32,
}

impl FrameWaveform {
    /// Number of output samples per channel.
    pub fn n_samples(&self) -> usize {
        self.positions.nrows()
    }
}

/// Generate a raster frame.
pub fn generate(
    geometry: &BeamGeometry,
    resolution: [usize; 2],
    scale: [f64; 2],
    translation: [f64; 2],
    margin: usize,
    ao_osr: u32,
    fast_lines: &FastLines,
) -> FrameWaveform {
    let [w, h] = resolution;
    let centred = |axis: usize, k: usize, n: usize| {
        (k as f64 + 0.5 - n as f64 / 2.0) * scale[axis] + translation[axis]
    };
    let x_codes: Vec<u16> = (0..w)
        .map(|k| geometry.to_code(0, centred(0, k, w)))
        .collect();
    let y_codes: Vec<u16> = (0..h)
        .map(|k| geometry.to_code(1, centred(1, k, h)))
        .collect();

    let line_len = w + margin;
    let osr = ao_osr.max(1) as usize;
    let n_positions = line_len * h;
    let positions = Array2::from_shape_fn((n_positions * osr, 2), |(i, axis)| {
        let p = i / osr;
        match axis {
            // Margin holds the first real position of the line
            0 => x_codes[(p % line_len).saturating_sub(margin)],
            _ => y_codes[p / line_len],
        }
    });

    FrameWaveform {
        positions: at_least_two(positions),
        status: fast_lines
            .is_enabled()
            .then(|| status_bits(fast_lines, n_positions, line_len, margin, osr)),
        n_positions,
        ao_osr: osr as u32,
    }
}

/// Generate a frame from an explicit list of logical coordinates.
pub fn generate_from_path(
    geometry: &BeamGeometry,
    points: &[[f64; 2]],
    ao_osr: u32,
    fast_lines: &FastLines,
) -> FrameWaveform {
    let osr = ao_osr.max(1) as usize;
    let n_positions = points.len();
    let positions = Array2::from_shape_fn((n_positions * osr, 2), |(i, axis)| {
        geometry.to_code(axis, points[i / osr][axis])
    });

    FrameWaveform {
        positions: at_least_two(positions),
        status: fast_lines
            .is_enabled()
            .then(|| status_bits(fast_lines, n_positions, n_positions, 0, osr)),
        n_positions,
        ao_osr: osr as u32,
    }
}

/// Output buffers need at least two samples.
fn at_least_two(positions: Array2<u16>) -> Array2<u16> {
    if positions.nrows() == 1 {
        let row = positions.row(0);
        Array2::from_shape_fn((2, 2), |(_, axis)| row[axis])
    } else {
        positions
    }
}

fn status_bits(
    layout: &FastLines,
    n_positions: usize,
    line_len: usize,
    margin: usize,
    osr: usize,
) -> Array1<u32> {
    let per_position = 2 * osr;
    let len = n_positions * per_position;
    let pixel = FastLines::mask(layout.pixel_bit);
    let line = FastLines::mask(layout.line_bit);
    let frame = FastLines::mask(layout.frame_bit);

    Array1::from_shape_fn(len, |i| {
        let p = i / per_position;
        let mut bits = 0;
        if i % per_position < osr {
            bits |= pixel;
        }
        if p % line_len.max(1) >= margin {
            bits |= line;
        }
        // Falls on the last sample so repeated frames show an edge
        if i + 1 < len {
            bits |= frame;
        }
        bits ^ layout.rest_pattern()
    })
}

/// Inputs that fully determine a generated frame.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformKey {
    /// Coordinate mapping
    pub geometry: BeamGeometry,
    /// Trajectory
    pub pattern: ScanPattern,
    /// Output ticks per position
    pub ao_osr: u32,
    /// Status-line layout
    pub fast_lines: FastLines,
}

/// Keeps the most recently generated frame.
#[derive(Debug, Default)]
pub struct WaveformCache {
    last: Option<(WaveformKey, Arc<FrameWaveform>)>,
    generated: u64,
}

impl WaveformCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the frame for `key`, generating it only if the key changed.
    pub fn get_or_generate(&mut self, key: &WaveformKey) -> Arc<FrameWaveform> {
        if let Some((cached_key, frame)) = &self.last {
            if cached_key == key {
                return Arc::clone(frame);
            }
        }

        let frame = Arc::new(match &key.pattern {
            ScanPattern::Raster {
                resolution,
                scale,
                translation,
                margin,
            } => generate(
                &key.geometry,
                *resolution,
                *scale,
                *translation,
                *margin,
                key.ao_osr,
                &key.fast_lines,
            ),
            ScanPattern::Path(points) => {
                generate_from_path(&key.geometry, points, key.ao_osr, &key.fast_lines)
            }
        });
        self.generated += 1;
        debug!(
            positions = frame.n_positions,
            samples = frame.n_samples(),
            ao_osr = key.ao_osr,
            status = frame.status.is_some(),
            "Generated frame waveform"
        );
        self.last = Some((key.clone(), Arc::clone(&frame)));
        frame
    }

    /// Drop the cached frame.
    pub fn invalidate(&mut self) {
        self.last = None;
    }

    /// Number of frames generated so far.
    pub fn generated(&self) -> u64 {
        self.generated
    }
}
