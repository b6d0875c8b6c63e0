//! Turns raw input chunks into per-detector frames.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use ndarray::Array2;
use tracing::{debug, trace, warn};

use crate::detector::{Detector, DetectorKind, Frame, FrameData, RunMode};
use crate::downsample::{Accumulator, AccumulatorWidth, Downsampler};
use crate::error::Result;
use crate::settings::AcquisitionSettings;

use super::tasks::RunTasks;
use super::{EngineCounters, ReadPools};

/// Reduction state of one input channel, sized for its oversampling ratio.
#[derive(Debug)]
pub enum ChannelReducer {
    /// Analog input into a 32-bit accumulator
    Analog32(Downsampler<i16, i32>),
    /// Analog input into a 64-bit accumulator
    Analog64(Downsampler<i16, i64>),
    /// Counter input
    Counts(Downsampler<u32, u64>),
}

impl ChannelReducer {
    fn for_detector(detector: &Detector, settings: &AcquisitionSettings) -> Result<Self> {
        let osr = settings.timing.ai_osr as usize;
        let mode = detector.kind().reduction();
        let (res, margin) = (settings.resolution, settings.margin);
        Ok(match detector.kind() {
            DetectorKind::Counting => {
                Self::Counts(Downsampler::new(mode, osr, res, margin)?)
            }
            DetectorKind::Analog => match AccumulatorWidth::select(16, osr) {
                AccumulatorWidth::W32 => Self::Analog32(Downsampler::new(mode, osr, res, margin)?),
                AccumulatorWidth::W64 => Self::Analog64(Downsampler::new(mode, osr, res, margin)?),
            },
        })
    }

    fn feed_analog(&mut self, data: &[i16], out: &mut VecDeque<FrameData>) {
        match self {
            Self::Analog32(ds) => feed(ds, data, FrameData::Analog, out),
            Self::Analog64(ds) => feed(ds, data, FrameData::AnalogWide, out),
            Self::Counts(_) => warn!("Analog samples routed to a counting reducer"),
        }
    }

    fn feed_counts(&mut self, data: &[u32], out: &mut VecDeque<FrameData>) {
        match self {
            Self::Counts(ds) => feed(ds, data, FrameData::Counts, out),
            _ => warn!("Counter samples routed to an analog reducer"),
        }
    }

    fn at_frame_start(&self) -> bool {
        match self {
            Self::Analog32(ds) => ds.cursor().next_sample_index == 0,
            Self::Analog64(ds) => ds.cursor().next_sample_index == 0,
            Self::Counts(ds) => ds.cursor().next_sample_index == 0,
        }
    }
}

fn feed<T, A>(
    ds: &mut Downsampler<T, A>,
    mut data: &[T],
    wrap: fn(Array2<A>) -> FrameData,
    out: &mut VecDeque<FrameData>,
) where
    T: Copy,
    A: Accumulator + From<T>,
{
    loop {
        let used = ds.reduce(data);
        data = &data[used..];
        if ds.is_complete() {
            out.push_back(wrap(ds.take_frame()));
        }
        if data.is_empty() || (used == 0 && !ds.is_complete()) {
            break;
        }
    }
}

struct Slot {
    detector: Detector,
    reducer: ChannelReducer,
    pending: VecDeque<FrameData>,
}

/// Reads the input tasks of one run and assembles frames.
pub(crate) struct FrameAssembler {
    analog: Vec<Slot>,
    counting: Vec<Slot>,
    analog_buf: Vec<i16>,
    count_buf: Vec<u32>,
    analog_scratch: Vec<i16>,
    count_scratch: Vec<u32>,
    mode: RunMode,
    dwell_time: f64,
    integration_count: u32,
    resolution: [usize; 2],
}

impl FrameAssembler {
    /// Build reducers for every detector and borrow read buffers for `chunk` samples.
    pub fn new(settings: &AcquisitionSettings, pools: &ReadPools, mode: RunMode) -> Result<Self> {
        let chunk = settings.chunks.input.chunk;
        let slot = |d: &Detector| -> Result<Slot> {
            Ok(Slot {
                detector: d.clone(),
                reducer: ChannelReducer::for_detector(d, settings)?,
                pending: VecDeque::new(),
            })
        };
        let analog = settings.analog_detectors.iter().map(slot).collect::<Result<Vec<_>>>()?;
        let counting = settings.counting_detectors.iter().map(slot).collect::<Result<Vec<_>>>()?;

        Ok(Self {
            analog_buf: pools.analog.take(chunk * analog.len()),
            count_buf: pools.counts.take(chunk * counting.len()),
            analog_scratch: pools.analog.take(chunk),
            count_scratch: pools.counts.take(chunk),
            analog,
            counting,
            mode,
            dwell_time: settings.dwell_time(),
            integration_count: settings.timing.ai_osr,
            resolution: settings.resolution,
        })
    }

    /// Read up to `n` samples per channel from every input task and reduce them.
    ///
    /// Returns the samples per channel actually read.
    pub fn read_chunk(
        &mut self,
        tasks: &mut RunTasks,
        n: usize,
        timeout: Duration,
    ) -> Result<usize> {
        let mut got = None;

        if let Some(ai) = tasks.ai.as_mut() {
            let n_ch = self.analog.len();
            let len = (n * n_ch).min(self.analog_buf.len());
            let read = ai.read_analog(&mut self.analog_buf[..len], timeout)?;
            for (c, slot) in self.analog.iter_mut().enumerate() {
                self.analog_scratch.clear();
                self.analog_scratch
                    .extend(self.analog_buf[..read * n_ch].iter().skip(c).step_by(n_ch));
                slot.reducer.feed_analog(&self.analog_scratch, &mut slot.pending);
            }
            got = Some(read);
        }

        if let Some(ci) = tasks.ci.as_mut() {
            let n_ch = self.counting.len();
            let len = (n * n_ch).min(self.count_buf.len());
            let read = ci.read_counter(&mut self.count_buf[..len], timeout)?;
            for (c, slot) in self.counting.iter_mut().enumerate() {
                self.count_scratch.clear();
                self.count_scratch
                    .extend(self.count_buf[..read * n_ch].iter().skip(c).step_by(n_ch));
                slot.reducer.feed_counts(&self.count_scratch, &mut slot.pending);
            }
            if let Some(ai_read) = got {
                if ai_read != read {
                    warn!(
                        analog = ai_read,
                        counter = read,
                        "Input groups returned different sample counts"
                    );
                }
            }
            got = Some(got.map_or(read, |g: usize| g.min(read)));
        }

        let got = got.unwrap_or(0);
        trace!(requested = n, got, "Read input chunk");
        Ok(got)
    }

    /// Push every complete frame to its detector.
    ///
    /// A frame goes out only once every detector of the run has it, so all
    /// detectors see the same sequence numbers. Returns frames delivered.
    pub fn deliver_ready(&mut self, sequence: &mut u64, counters: &EngineCounters) -> usize {
        let mut delivered = 0;
        if self.analog.is_empty() && self.counting.is_empty() {
            return 0;
        }
        while self
            .analog
            .iter()
            .chain(self.counting.iter())
            .all(|s| !s.pending.is_empty())
        {
            let timestamp = Utc::now();
            for slot in self.analog.iter_mut().chain(self.counting.iter_mut()) {
                let Some(data) = slot.pending.pop_front() else {
                    continue;
                };
                slot.detector.deliver(Frame {
                    detector: slot.detector.name().to_string(),
                    sequence: *sequence,
                    timestamp,
                    dwell_time: self.dwell_time,
                    integration_count: self.integration_count,
                    resolution: self.resolution,
                    mode: self.mode,
                    data,
                });
            }
            debug!(sequence = *sequence, mode = ?self.mode, "Frame delivered");
            *sequence += 1;
            delivered += 1;
            counters.frames_delivered.fetch_add(1, Ordering::Relaxed);
            let per_mode = match self.mode {
                RunMode::Continuous => &counters.continuous_frames,
                RunMode::Synchronized => &counters.synchronized_frames,
            };
            per_mode.fetch_add(1, Ordering::Relaxed);
        }
        delivered
    }

    /// Whether no frame is partially assembled.
    pub fn at_frame_boundary(&self) -> bool {
        self.analog
            .iter()
            .chain(self.counting.iter())
            .all(|s| s.reducer.at_frame_start())
    }

    /// Return the read buffers to the pools.
    pub fn release(self, pools: &ReadPools) {
        pools.analog.give(self.analog_buf);
        pools.analog.give(self.analog_scratch);
        pools.counts.give(self.count_buf);
        pools.counts.give(self.count_scratch);
    }
}
