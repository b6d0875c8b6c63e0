//! Scanning-beam acquisition engine.
//!
//! This crate drives a scanning-beam instrument through a multi-function DAQ
//! device: two analog outputs steer the beam, analog and counter inputs sample
//! the detectors, and digital outputs announce pixel, line and frame timing.
//!
//! # Architecture
//!
//! ```text
//!   Scanner ──setters──► ScanState (settings + WaveformCache)
//!      │                      │ build()
//!      │ add/remove_detector  ▼
//!      └──────────────► AcquisitionEngine (worker thread)
//!                             │  PeriodNegotiator ─► NegotiatedTiming
//!                             │  WaveformCache    ─► FrameWaveform
//!                             │  RunTasks (AO | DO | AI | CI)
//!                             │  FrameAssembler ─► Downsampler ─► Frame
//!                             ▼
//!                      ActiveStateManager (worker thread) ─► status lines
//! ```
//!
//! ## Components
//!
//! - [`period`] - dwell time to legal clock periods and oversampling ratios
//! - [`waveform`] - beam trajectory and clocked status-line buffers
//! - [`downsample`] - incremental reduction of oversampled input into images
//! - [`acquisition`] - the acquisition loop with its continuous and
//!   synchronized strategies
//! - [`active_state`] - debounced "scanning active" status lines
//! - [`scanner`] - scanner-facing setters
//! - [`hal`] - the hardware contract, plus [`hal::SimHardware`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use daq_scan::{Detector, Scanner, ScannerConfig, SimHardware};
//!
//! # async fn example() -> daq_scan::Result<()> {
//! let scanner = Scanner::new(Arc::new(SimHardware::default()), ScannerConfig::default())?;
//! scanner.set_resolution([128, 128])?;
//! let dwell = scanner.set_dwell_time(2e-6)?;
//! println!("accepted dwell time: {dwell:e} s");
//!
//! let (detector, mut frames) = Detector::analog("se", 0, 4);
//! scanner.add_detector(detector.clone())?;
//! if let Some(frame) = frames.recv().await {
//!     println!("frame {} mean {:.1}", frame.sequence, frame.data.mean());
//! }
//! scanner.remove_detector(&detector)?;
//! # Ok(())
//! # }
//! ```

pub mod acquisition;
pub mod active_state;
pub mod detector;
pub mod downsample;
pub mod error;
pub mod hal;
pub mod period;
pub mod pool;
pub mod scanner;
pub mod settings;
pub mod timing;
pub mod waveform;

pub use acquisition::{
    AcquisitionConfig, AcquisitionEngine, AcquisitionMode, AcquisitionStats, LoopState,
};
pub use active_state::{
    ActiveLine, ActiveState, ActiveStateConfig, ActiveStateManager, LineOverride,
};
pub use detector::{
    Detector, DetectorKind, Frame, FrameData, FrameReceiver, RunMode, SoftwareTrigger,
};
pub use downsample::{AccumulatorWidth, Downsampler, ReductionMode};
pub use error::{Result, ScanError};
pub use hal::{ChannelKind, HardwareTask, Range, ScanHardware, SimConfig, SimHardware};
pub use period::{NegotiatedTiming, NegotiationConfig, PeriodNegotiator};
pub use scanner::{Scanner, ScannerConfig};
pub use settings::{AcquisitionSettings, RunTuning, ScanSettings, ScanState};
pub use timing::TimingCapabilities;
pub use waveform::{BeamGeometry, FastLines, FrameWaveform, ScanPattern, WaveformCache};
