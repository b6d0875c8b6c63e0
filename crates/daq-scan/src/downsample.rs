//! Reduction of over-sampled input into pixel images.
//!
//! Input arrives in chunks that need not line up with pixels or lines. Each
//! call to [`Downsampler::reduce`] runs in phases:
//!
//! 1. finish the pixel left partial by the previous chunk
//! 2. reduce whole pixels up to the next line boundary
//! 3. reduce every whole line in one vectorised fold
//! 4. reduce whole pixels of the trailing partial line and stash the
//!    remaining `< osr` samples
//!
//! Margin positions advance the cursor but are never written to the image.

use std::marker::PhantomData;
use std::ops::AddAssign;

use ndarray::{s, Array2, ArrayView3, Axis};

use crate::error::{Result, ScanError};

/// Integer or float type wide enough to sum `osr` samples.
pub trait Accumulator: Copy + Default + AddAssign + Send + std::fmt::Debug + 'static {
    /// Divide by the sample count (truncating for integers).
    fn divide(self, n: usize) -> Self;
}

impl Accumulator for i32 {
    fn divide(self, n: usize) -> Self {
        self / n as i32
    }
}

impl Accumulator for i64 {
    fn divide(self, n: usize) -> Self {
        self / n as i64
    }
}

impl Accumulator for u64 {
    fn divide(self, n: usize) -> Self {
        self / n as u64
    }
}

impl Accumulator for f64 {
    fn divide(self, n: usize) -> Self {
        self / n as f64
    }
}

/// How the samples of one pixel are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ReductionMode {
    /// Mean of the samples (analog voltages)
    Average,
    /// Total of the samples (edge counts)
    Sum,
}

/// Accumulator width able to hold `osr` full-scale samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorWidth {
    /// 32-bit accumulator
    W32,
    /// 64-bit accumulator
    W64,
}

impl AccumulatorWidth {
    /// Pick the narrowest signed accumulator for `sample_bits`-wide samples.
    pub fn select(sample_bits: u32, osr: usize) -> Self {
        let max_sum = (osr as u128) << sample_bits.min(64);
        if max_sum <= i32::MAX as u128 {
            Self::W32
        } else {
            Self::W64
        }
    }
}

/// Position of a reduction inside its frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamingCursor<A> {
    /// Samples of this frame consumed so far
    pub next_sample_index: usize,
    /// Samples already in the partial pixel
    pub partial_count: usize,
    /// Running sum of the partial pixel
    pub partial_acc: A,
}

/// Incremental reduction of one channel into a `(height, width)` image.
#[derive(Debug)]
pub struct Downsampler<T, A> {
    mode: ReductionMode,
    osr: usize,
    resolution: [usize; 2],
    margin: usize,
    image: Array2<A>,
    cursor: StreamingCursor<A>,
    _sample: PhantomData<fn(T)>,
}

impl<T, A> Downsampler<T, A>
where
    T: Copy,
    A: Accumulator + From<T>,
{
    /// Create a downsampler for one frame geometry.
    pub fn new(
        mode: ReductionMode,
        osr: usize,
        resolution: [usize; 2],
        margin: usize,
    ) -> Result<Self> {
        if osr == 0 || resolution[0] == 0 || resolution[1] == 0 {
            return Err(ScanError::config(format!(
                "cannot downsample osr={} into {}x{}",
                osr, resolution[0], resolution[1]
            )));
        }
        Ok(Self {
            mode,
            osr,
            resolution,
            margin,
            image: Array2::default((resolution[1], resolution[0])),
            cursor: StreamingCursor::default(),
            _sample: PhantomData,
        })
    }

    fn line_len(&self) -> usize {
        self.resolution[0] + self.margin
    }

    /// Samples in one complete frame.
    pub fn frame_samples(&self) -> usize {
        self.line_len() * self.resolution[1] * self.osr
    }

    /// Current cursor.
    pub fn cursor(&self) -> &StreamingCursor<A> {
        &self.cursor
    }

    /// Reduction mode.
    pub fn mode(&self) -> ReductionMode {
        self.mode
    }

    /// Whether every sample of the frame has been consumed.
    pub fn is_complete(&self) -> bool {
        self.cursor.next_sample_index >= self.frame_samples()
    }

    /// Image assembled so far.
    pub fn image(&self) -> &Array2<A> {
        &self.image
    }

    /// Take the image and start a new frame.
    pub fn take_frame(&mut self) -> Array2<A> {
        let shape = self.image.raw_dim();
        self.cursor = StreamingCursor::default();
        std::mem::replace(&mut self.image, Array2::default(shape))
    }

    /// Discard progress on the current frame.
    pub fn reset(&mut self) {
        self.cursor = StreamingCursor::default();
        self.image.fill(A::default());
    }

    fn finish(&self, acc: A) -> A {
        match self.mode {
            ReductionMode::Average => acc.divide(self.osr),
            ReductionMode::Sum => acc,
        }
    }

    /// Store a finished pixel at position `pos` unless it lies in the margin.
    fn store(&mut self, pos: usize, acc: A) {
        let line_len = self.line_len();
        let col = pos % line_len;
        if col >= self.margin {
            let value = self.finish(acc);
            self.image[[pos / line_len, col - self.margin]] = value;
        }
    }

    fn in_margin(&self, pos: usize) -> bool {
        pos % self.line_len() < self.margin
    }

    /// Reduce up to `n_pixels` whole pixels from the front of `data`.
    fn reduce_pixels(&mut self, data: &[T], n_pixels: usize) -> usize {
        for pixel in data.chunks_exact(self.osr).take(n_pixels) {
            let pos = self.cursor.next_sample_index / self.osr;
            if !self.in_margin(pos) {
                let mut acc = A::default();
                for &v in pixel {
                    acc += A::from(v);
                }
                self.store(pos, acc);
            }
            self.cursor.next_sample_index += self.osr;
        }
        n_pixels.min(data.len() / self.osr) * self.osr
    }

    /// Reduce a chunk of samples for this channel.
    ///
    /// Returns how many samples were consumed; anything past the end of the
    /// frame is left for the caller.
    pub fn reduce(&mut self, chunk: &[T]) -> usize {
        let frame_samples = self.frame_samples();
        let remaining = frame_samples - self.cursor.next_sample_index.min(frame_samples);
        let mut data = &chunk[..chunk.len().min(remaining)];
        let consumed = data.len();
        let osr = self.osr;
        let line_len = self.line_len();

        // Phase 1: complete the partial pixel
        if self.cursor.partial_count > 0 {
            let take = (osr - self.cursor.partial_count).min(data.len());
            let pos = self.cursor.next_sample_index / osr;
            if !self.in_margin(pos) {
                for &v in &data[..take] {
                    self.cursor.partial_acc += A::from(v);
                }
            }
            self.cursor.partial_count += take;
            data = &data[take..];
            if self.cursor.partial_count < osr {
                return consumed;
            }
            let acc = self.cursor.partial_acc;
            self.store(pos, acc);
            self.cursor.next_sample_index = (pos + 1) * osr;
            self.cursor.partial_count = 0;
            self.cursor.partial_acc = A::default();
        }

        // Phase 2: whole pixels up to the next line boundary
        let col = (self.cursor.next_sample_index / osr) % line_len;
        if col != 0 {
            let used = self.reduce_pixels(data, line_len - col);
            data = &data[used..];
        }

        // Phase 3: whole lines at once
        let n_lines = data.len() / (line_len * osr);
        if n_lines > 0 && (self.cursor.next_sample_index / osr) % line_len == 0 {
            let first_line = self.cursor.next_sample_index / osr / line_len;
            let n_samples = n_lines * line_len * osr;
            let shape = (n_lines, line_len, osr);
            if let Ok(lines) = ArrayView3::from_shape(shape, &data[..n_samples]) {
                let sums = lines
                    .slice(s![.., self.margin.., ..])
                    .fold_axis(Axis(2), A::default(), |acc, &v| {
                        let mut acc = *acc;
                        acc += A::from(v);
                        acc
                    });
                let mode = self.mode;
                let mut target = self.image.slice_mut(s![first_line..first_line + n_lines, ..]);
                target.zip_mut_with(&sums, |px, &sum| {
                    *px = match mode {
                        ReductionMode::Average => sum.divide(osr),
                        ReductionMode::Sum => sum,
                    }
                });
                self.cursor.next_sample_index += n_samples;
                data = &data[n_samples..];
            }
        }

        // Phase 4: trailing partial line, then stash the leftover
        let used = self.reduce_pixels(data, data.len() / osr);
        data = &data[used..];
        if !data.is_empty() {
            let pos = self.cursor.next_sample_index / osr;
            let mut acc = A::default();
            if !self.in_margin(pos) {
                for &v in data {
                    acc += A::from(v);
                }
            }
            self.cursor.partial_acc = acc;
            self.cursor.partial_count = data.len();
            self.cursor.next_sample_index += data.len();
        }

        consumed
    }
}
