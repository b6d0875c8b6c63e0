//! Run the engine against simulated hardware.
//!
//! Used by the `simulate` subcommand: registers analog and counting
//! detectors, waits for a number of frames from each and reports what came
//! back together with the engine statistics.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use daq_scan::{AcquisitionStats, Detector, FrameReceiver, RunMode, Scanner, SimHardware};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::EngineConfig;

/// What to simulate.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Frames to wait for per detector
    pub frames: usize,
    /// Analog detectors, on input channels `0..n`
    pub analog: u32,
    /// Counting detectors, on counters `0..n`
    pub counting: u32,
    /// Longest wait for any single frame
    pub frame_timeout: Duration,
}

impl Default for SimulateOptions {
    fn default() -> Self {
        Self {
            frames: 3,
            analog: 1,
            counting: 0,
            frame_timeout: Duration::from_secs(10),
        }
    }
}

/// One received frame, reduced to what gets logged.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSummary {
    /// Detector name
    pub detector: String,
    /// Engine-wide frame sequence number
    pub sequence: u64,
    /// `(height, width)`
    pub dim: (usize, usize),
    /// Mean pixel value
    pub mean: f64,
    /// Strategy that produced the frame
    pub mode: RunMode,
}

/// Outcome of a simulation.
#[derive(Debug, Clone)]
pub struct SimulationReport {
    /// Dwell time the negotiation settled on
    pub dwell_time: f64,
    /// Frames in arrival order per detector, detectors in registration order
    pub frames: Vec<FrameSummary>,
    /// Engine counters after the last frame
    pub stats: AcquisitionStats,
}

/// Bring up a scanner on [`SimHardware`] and collect frames.
pub async fn run(config: &EngineConfig, options: &SimulateOptions) -> Result<SimulationReport> {
    if options.analog + options.counting == 0 {
        bail!("simulation needs at least one analog or counting detector");
    }

    let hardware = Arc::new(SimHardware::new(config.hardware.sim_config()));
    let scanner =
        Scanner::new(hardware, config.scanner_config()).context("Failed to start scanner")?;

    let capacity = options.frames.max(1);
    let mut detectors = Vec::new();
    let mut receivers = Vec::new();
    for channel in 0..options.analog {
        let (detector, rx) = Detector::analog(&format!("ai{channel}"), channel, capacity);
        detectors.push(detector);
        receivers.push(rx);
    }
    for counter in 0..options.counting {
        let (detector, rx) = Detector::counting(&format!("ctr{counter}"), counter, capacity);
        detectors.push(detector);
        receivers.push(rx);
    }

    for detector in &detectors {
        scanner
            .add_detector(detector.clone())
            .with_context(|| format!("Failed to add detector '{}'", detector.name()))?;
    }
    let dwell_time = scanner
        .set_dwell_time(config.scanner.dwell_time)
        .context("Dwell time negotiation failed")?;
    info!(
        dwell_time,
        analog = options.analog,
        counting = options.counting,
        frames = options.frames,
        "Simulation running"
    );

    let mut set = JoinSet::new();
    for (index, rx) in receivers.into_iter().enumerate() {
        set.spawn(collect(index, rx, options.frames, options.frame_timeout));
    }
    let mut per_detector = vec![Vec::new(); detectors.len()];
    let mut failure = None;
    while let Some(joined) = set.join_next().await {
        match joined.context("Frame collector panicked")? {
            Ok((index, frames)) => per_detector[index] = frames,
            Err(e) => failure = Some(e),
        }
    }

    for detector in &detectors {
        if let Err(e) = scanner.remove_detector(detector) {
            warn!(detector = detector.name(), error = %e, "Failed to remove detector");
        }
    }
    let stats = scanner.stats();
    let last_error = scanner.last_error();
    scanner.shutdown();

    if let Some(e) = failure {
        return Err(match last_error {
            Some(cause) => e.context(format!("Acquisition stopped: {cause}")),
            None => e,
        });
    }

    info!(
        frames = stats.frames_delivered,
        continuous = stats.continuous_frames,
        synchronized = stats.synchronized_frames,
        rejections = stats.continuous_rejections,
        "Simulation finished"
    );
    Ok(SimulationReport {
        dwell_time,
        frames: per_detector.into_iter().flatten().collect(),
        stats,
    })
}

async fn collect(
    index: usize,
    mut rx: FrameReceiver,
    frames: usize,
    frame_timeout: Duration,
) -> Result<(usize, Vec<FrameSummary>)> {
    let mut out = Vec::with_capacity(frames);
    while out.len() < frames {
        let frame = timeout(frame_timeout, rx.recv())
            .await
            .with_context(|| format!("No frame within {:?}", frame_timeout))?
            .context("Detector channel closed")?;
        let summary = FrameSummary {
            dim: frame.data.dim(),
            mean: frame.data.mean(),
            detector: frame.detector,
            sequence: frame.sequence,
            mode: frame.mode,
        };
        info!(
            detector = %summary.detector,
            sequence = summary.sequence,
            height = summary.dim.0,
            width = summary.dim.1,
            mean = summary.mean,
            mode = ?summary.mode,
            timestamp = %frame.timestamp,
            "Frame"
        );
        out.push(summary);
    }
    Ok((index, out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.scanner.resolution = [16, 8];
        config.scanner.dwell_time = 2e-6;
        config.acquisition.tuning.chunk_duration = Duration::from_millis(1);
        config
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_simulation_collects_frames() {
        let options = SimulateOptions {
            frames: 2,
            analog: 1,
            counting: 1,
            frame_timeout: Duration::from_secs(10),
        };
        let report = run(&small_config(), &options).await.unwrap();

        assert_eq!(report.frames.len(), 4);
        assert!(report.frames.iter().all(|f| f.dim == (8, 16)));
        assert_eq!(report.frames[0].detector, "ai0");
        assert_eq!(report.frames[2].detector, "ctr0");
        assert!(report.dwell_time >= 2e-6 - 1e-9);
        assert!(report.stats.frames_delivered >= 2);
    }

    #[tokio::test]
    async fn test_simulation_needs_a_detector() {
        let options = SimulateOptions {
            analog: 0,
            counting: 0,
            ..Default::default()
        };
        assert!(run(&small_config(), &options).await.is_err());
    }
}
