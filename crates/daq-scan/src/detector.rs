//! Detector handles, software triggers and frame delivery.
//!
//! A [`Detector`] is a cheap, clonable handle shared between the caller and
//! the acquisition loop. Frames are pushed to the detector's sink with
//! `try_send`: a full sink drops the frame and counts the drop instead of
//! stalling the acquisition thread.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ndarray::Array2;
use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::downsample::ReductionMode;
use crate::hal::{ChannelSpec, Range};

static NEXT_DETECTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Signal a detector produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    /// Voltage sampled by an analog input
    Analog,
    /// Edges counted by a counter
    Counting,
}

impl DetectorKind {
    /// How samples of this kind are reduced to pixels.
    pub fn reduction(self) -> ReductionMode {
        match self {
            Self::Analog => ReductionMode::Average,
            Self::Counting => ReductionMode::Sum,
        }
    }
}

/// Acquisition strategy that produced a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Free-running acquisition
    Continuous,
    /// Single triggered frame with finite timing
    Synchronized,
}

/// Pixel data of one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameData {
    /// Averaged analog codes, 32-bit accumulation
    Analog(Array2<i32>),
    /// Averaged analog codes, 64-bit accumulation
    AnalogWide(Array2<i64>),
    /// Summed counts
    Counts(Array2<u64>),
}

impl FrameData {
    /// `(height, width)` of the image.
    pub fn dim(&self) -> (usize, usize) {
        match self {
            Self::Analog(a) => a.dim(),
            Self::AnalogWide(a) => a.dim(),
            Self::Counts(a) => a.dim(),
        }
    }

    /// Pixel value as `f64`.
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        match self {
            Self::Analog(a) => a.get((row, col)).map(|&v| v as f64),
            Self::AnalogWide(a) => a.get((row, col)).map(|&v| v as f64),
            Self::Counts(a) => a.get((row, col)).map(|&v| v as f64),
        }
    }

    /// Mean pixel value.
    pub fn mean(&self) -> f64 {
        let (h, w) = self.dim();
        if h * w == 0 {
            return 0.0;
        }
        let total: f64 = match self {
            Self::Analog(a) => a.iter().map(|&v| v as f64).sum(),
            Self::AnalogWide(a) => a.iter().map(|&v| v as f64).sum(),
            Self::Counts(a) => a.iter().map(|&v| v as f64).sum(),
        };
        total / (h * w) as f64
    }
}

/// One assembled frame plus its acquisition metadata.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Name of the detector that produced it
    pub detector: String,
    /// Engine-wide frame counter
    pub sequence: u64,
    /// When the frame was completed
    pub timestamp: DateTime<Utc>,
    /// Dwell time per position in seconds
    pub dwell_time: f64,
    /// Input samples integrated per pixel
    pub integration_count: u32,
    /// `[width, height]`
    pub resolution: [usize; 2],
    /// Strategy that acquired the frame
    pub mode: RunMode,
    /// Pixel data
    pub data: FrameData,
}

/// Receiving end of a detector's frame sink.
pub type FrameReceiver = mpsc::Receiver<Frame>;

/// Counting barrier a caller fires to release one synchronized frame.
#[derive(Clone, Default)]
pub struct SoftwareTrigger {
    inner: Arc<(Mutex<u64>, Condvar)>,
}

impl fmt::Debug for SoftwareTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareTrigger")
            .field("pending", &self.pending())
            .finish()
    }
}

impl SoftwareTrigger {
    /// Create an unfired trigger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Release one frame.
    pub fn fire(&self) {
        let (count, cond) = &*self.inner;
        *count.lock() += 1;
        cond.notify_all();
    }

    /// Number of fires not yet consumed.
    pub fn pending(&self) -> u64 {
        *self.inner.0.lock()
    }

    /// Wait up to `timeout` for a fire without consuming it.
    pub fn wait_fired(&self, timeout: Duration) -> bool {
        let (count, cond) = &*self.inner;
        let mut pending = count.lock();
        if *pending == 0 {
            let _ = cond.wait_for(&mut pending, timeout);
        }
        *pending > 0
    }

    /// Consume one fire, waiting up to `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (count, cond) = &*self.inner;
        let mut pending = count.lock();
        if *pending == 0 {
            let _ = cond.wait_for(&mut pending, timeout);
        }
        if *pending > 0 {
            *pending -= 1;
            true
        } else {
            false
        }
    }
}

struct DetectorInner {
    id: u64,
    name: String,
    kind: DetectorKind,
    channel: ChannelSpec,
    trigger: Option<SoftwareTrigger>,
    sender: mpsc::Sender<Frame>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Handle for a detector registered with the acquisition loop.
#[derive(Clone)]
pub struct Detector {
    inner: Arc<DetectorInner>,
}

impl fmt::Debug for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Detector")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("channel", &self.inner.channel.channel)
            .finish()
    }
}

impl PartialEq for Detector {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Detector {}

impl Detector {
    /// Analog detector on an input channel with the default range.
    pub fn analog(name: &str, channel: u32, capacity: usize) -> (Self, FrameReceiver) {
        DetectorBuilder::new(name, DetectorKind::Analog, channel)
            .capacity(capacity)
            .build()
    }

    /// Counting detector on a counter.
    pub fn counting(name: &str, counter: u32, capacity: usize) -> (Self, FrameReceiver) {
        DetectorBuilder::new(name, DetectorKind::Counting, counter)
            .capacity(capacity)
            .build()
    }

    /// Start building a detector.
    pub fn builder(name: &str, kind: DetectorKind, channel: u32) -> DetectorBuilder {
        DetectorBuilder::new(name, kind, channel)
    }

    /// Unique identifier.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Signal kind.
    pub fn kind(&self) -> DetectorKind {
        self.inner.kind
    }

    /// Physical channel.
    pub fn channel(&self) -> &ChannelSpec {
        &self.inner.channel
    }

    /// Software trigger, if this detector acquires synchronized frames.
    pub fn trigger(&self) -> Option<&SoftwareTrigger> {
        self.inner.trigger.as_ref()
    }

    /// Frames accepted by the sink.
    pub fn frames_delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    /// Frames dropped because the sink was full.
    pub fn frames_dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Push a frame to the sink without blocking.
    pub fn deliver(&self, frame: Frame) -> bool {
        match self.inner.sender.try_send(frame) {
            Ok(()) => {
                self.inner.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(frame)) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(
                    detector = %self.inner.name,
                    sequence = frame.sequence,
                    "Dropped frame (sink full)"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(detector = %self.inner.name, "Frame sink closed");
                false
            }
        }
    }
}

/// Builder for [`Detector`].
#[derive(Debug)]
pub struct DetectorBuilder {
    name: String,
    kind: DetectorKind,
    channel: ChannelSpec,
    capacity: usize,
    trigger: Option<SoftwareTrigger>,
}

impl DetectorBuilder {
    fn new(name: &str, kind: DetectorKind, channel: u32) -> Self {
        Self {
            name: name.to_string(),
            kind,
            channel: ChannelSpec::new(channel),
            capacity: 4,
            trigger: None,
        }
    }

    /// Input voltage range.
    pub fn range(mut self, range: Range) -> Self {
        self.channel = self.channel.with_range(range);
        self
    }

    /// Frames buffered in the sink before drops start.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Acquire synchronized frames released by `trigger`.
    pub fn trigger(mut self, trigger: SoftwareTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Create the detector and its frame receiver.
    pub fn build(self) -> (Detector, FrameReceiver) {
        let (sender, receiver) = mpsc::channel(self.capacity.max(1));
        let detector = Detector {
            inner: Arc::new(DetectorInner {
                id: NEXT_DETECTOR_ID.fetch_add(1, Ordering::Relaxed),
                name: self.name,
                kind: self.kind,
                channel: self.channel,
                trigger: self.trigger,
                sender,
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        };
        (detector, receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn frame(seq: u64) -> Frame {
        Frame {
            detector: "se".into(),
            sequence: seq,
            timestamp: Utc::now(),
            dwell_time: 1e-6,
            integration_count: 4,
            resolution: [2, 1],
            mode: RunMode::Continuous,
            data: FrameData::Counts(Array2::from_elem((1, 2), 7)),
        }
    }

    #[test]
    fn test_full_sink_drops_and_counts() {
        let (det, mut rx) = Detector::counting("pmt", 0, 1);
        assert!(det.deliver(frame(0)));
        assert!(!det.deliver(frame(1)));
        assert_eq!(det.frames_delivered(), 1);
        assert_eq!(det.frames_dropped(), 1);
        assert_eq!(rx.try_recv().unwrap().sequence, 0);
    }

    #[tracing_test::traced_test]
    #[test]
    fn test_closed_sink_is_logged() {
        let (det, rx) = Detector::analog("se", 0, 1);
        drop(rx);
        assert!(!det.deliver(frame(3)));
        assert_eq!(det.frames_dropped(), 0);
        assert!(logs_contain("Frame sink closed"));
    }

    #[test]
    fn test_identity_equality() {
        let (a, _rx_a) = Detector::analog("se", 0, 1);
        let (b, _rx_b) = Detector::analog("se", 0, 1);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_software_trigger_counts_fires() {
        let trigger = SoftwareTrigger::new();
        assert!(!trigger.wait_timeout(Duration::from_millis(10)));
        trigger.fire();
        trigger.fire();
        assert!(trigger.wait_timeout(Duration::ZERO));
        assert!(trigger.wait_timeout(Duration::ZERO));
        assert!(!trigger.wait_timeout(Duration::ZERO));

        trigger.fire();
        assert!(trigger.wait_fired(Duration::ZERO));
        assert_eq!(trigger.pending(), 1);
        assert!(trigger.wait_timeout(Duration::ZERO));

        let remote = trigger.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.fire();
        });
        assert!(trigger.wait_timeout(Duration::from_secs(2)));
        handle.join().unwrap();
    }

    #[test]
    fn test_frame_data_stats() {
        let data = FrameData::Analog(Array2::from_shape_vec((1, 2), vec![2, 4]).unwrap());
        assert_eq!(data.dim(), (1, 2));
        assert_eq!(data.get(0, 1), Some(4.0));
        assert_eq!(data.get(1, 0), None);
        assert!((data.mean() - 3.0).abs() < 1e-12);
    }
}
