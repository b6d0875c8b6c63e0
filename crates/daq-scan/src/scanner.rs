//! Scanner facade.
//!
//! Owns the scan parameters, the acquisition loop and the status-line worker.
//! Setters validate their input, store it and ask a running acquisition to
//! pick the change up on the next frame.

use std::sync::Arc;

use tracing::info;

use crate::acquisition::{AcquisitionConfig, AcquisitionEngine, AcquisitionStats, LoopState};
use crate::active_state::{ActiveState, ActiveStateConfig, ActiveStateManager, LineOverride};
use crate::detector::{Detector, DetectorKind};
use crate::error::{Result, ScanError};
use crate::hal::ScanHardware;
use crate::period::{NegotiatedTiming, PeriodNegotiator};
use crate::settings::{
    check_path, check_resolution, check_scale, check_translation, ScanSettings, ScanState,
};
use crate::waveform::{BeamGeometry, FastLines};

/// Everything needed to bring up a scanner.
#[derive(Debug, Clone, Default)]
pub struct ScannerConfig {
    /// Logical field and output voltage mapping
    pub geometry: BeamGeometry,
    /// Scan parameters used until a setter changes them
    pub initial: ScanSettings,
    /// Acquisition loop tuning
    pub acquisition: AcquisitionConfig,
    /// Status-line worker
    pub active_state: ActiveStateConfig,
}

/// A scanning-beam acquisition front end.
pub struct Scanner {
    hardware: Arc<dyn ScanHardware>,
    state: Arc<ScanState>,
    active: Arc<ActiveStateManager>,
    engine: AcquisitionEngine,
    acquisition: AcquisitionConfig,
}

impl Scanner {
    /// Start both workers against `hardware`.
    ///
    /// Fails with [`ScanError::InvalidConfig`] if the initial settings could
    /// never produce a frame.
    pub fn new(hardware: Arc<dyn ScanHardware>, config: ScannerConfig) -> Result<Self> {
        config.initial.validate(&config.geometry)?;
        let state = Arc::new(ScanState::new(config.geometry, config.initial));
        let active = Arc::new(ActiveStateManager::start(
            Arc::clone(&hardware),
            config.active_state,
        )?);
        let engine = AcquisitionEngine::start(
            Arc::clone(&hardware),
            Arc::clone(&state),
            Arc::clone(&active),
            config.acquisition.clone(),
        )?;
        info!(shape = ?state.geometry().shape, "Scanner ready");
        Ok(Self {
            hardware,
            state,
            active,
            engine,
            acquisition: config.acquisition,
        })
    }

    /// Current scan parameters.
    pub fn settings(&self) -> ScanSettings {
        self.state.settings()
    }

    /// Coordinate mapping.
    pub fn geometry(&self) -> &BeamGeometry {
        self.state.geometry()
    }

    /// Waveforms generated so far (cache misses).
    pub fn waveforms_generated(&self) -> u64 {
        self.state.waveforms_generated()
    }

    fn shape(&self) -> [f64; 2] {
        self.state.geometry().shape
    }

    fn changed(&self) -> Result<()> {
        self.engine.update_settings_on_next_frame()
    }

    /// Set the image resolution, keeping the field of view.
    ///
    /// Each axis is clamped to `[1, shape]`. Returns the resolution applied.
    pub fn set_resolution(&self, resolution: [usize; 2]) -> Result<[usize; 2]> {
        check_resolution(resolution)?;
        let shape = self.shape();
        let applied = self.state.update(|s| {
            let mut applied = resolution;
            for axis in 0..2 {
                applied[axis] = applied[axis].min(shape[axis].max(1.0) as usize);
                let fov = s.resolution[axis] as f64 * s.scale[axis];
                s.scale[axis] = fov / applied[axis] as f64;
            }
            s.resolution = applied;
            applied
        });
        info!(width = applied[0], height = applied[1], "Resolution set");
        self.changed()?;
        Ok(applied)
    }

    /// Set the distance between positions, keeping the frame inside the field.
    pub fn set_scale(&self, scale: [f64; 2]) -> Result<[f64; 2]> {
        check_scale(scale)?;
        let shape = self.shape();
        let applied = self.state.update(|s| {
            for axis in 0..2 {
                s.scale[axis] = scale[axis].min(shape[axis] / s.resolution[axis] as f64);
                s.translation[axis] = clamp_translation(shape[axis], s, axis, s.translation[axis]);
            }
            s.scale
        });
        self.changed()?;
        Ok(applied)
    }

    /// Offset the frame centre, keeping the frame inside the field.
    pub fn set_translation(&self, translation: [f64; 2]) -> Result<[f64; 2]> {
        check_translation(translation)?;
        let shape = self.shape();
        let applied = self.state.update(|s| {
            for axis in 0..2 {
                s.translation[axis] = clamp_translation(shape[axis], s, axis, translation[axis]);
            }
            s.translation
        });
        self.changed()?;
        Ok(applied)
    }

    /// Settle positions prepended to every line.
    pub fn set_margin(&self, margin: usize) -> Result<()> {
        self.state.update(|s| s.margin = margin);
        self.changed()
    }

    /// Replace the raster with a vector path, or go back to raster with `None`.
    pub fn set_path(&self, path: Option<Vec<[f64; 2]>>) -> Result<()> {
        if let Some(points) = &path {
            check_path(points, self.shape())?;
        }
        self.state.update(|s| s.path = path.map(Arc::from));
        self.changed()
    }

    /// Clocked status-line layout.
    pub fn set_fast_lines(&self, fast_lines: FastLines) -> Result<()> {
        fast_lines.validate()?;
        self.state.update(|s| s.fast_lines = fast_lines);
        self.changed()
    }

    /// Negotiate and apply a dwell time. Returns the accepted dwell time.
    ///
    /// A negotiation failure leaves the current dwell time untouched.
    pub fn set_dwell_time(&self, dwell_time: f64) -> Result<f64> {
        let timing = self.negotiate(dwell_time)?;
        self.state.update(|s| s.dwell_time = timing.dwell_time);
        info!(requested = dwell_time, accepted = timing.dwell_time, "Dwell time set");
        self.changed()?;
        Ok(timing.dwell_time)
    }

    /// Negotiate a dwell time for the currently registered detectors.
    ///
    /// Counter-only setups are clocked like a single analog channel.
    pub fn negotiate(&self, dwell_time: f64) -> Result<NegotiatedTiming> {
        let n_inputs = self
            .engine
            .detectors()
            .iter()
            .filter(|d| d.kind() == DetectorKind::Analog)
            .count()
            .max(1);
        PeriodNegotiator::with_config(self.hardware.as_ref(), self.acquisition.tuning.negotiation)
            .negotiate(dwell_time, n_inputs)
    }

    /// Start delivering frames to `detector`.
    pub fn add_detector(&self, detector: Detector) -> Result<()> {
        self.engine.add_detector(detector)
    }

    /// Stop delivering frames to `detector`.
    pub fn remove_detector(&self, detector: &Detector) -> Result<()> {
        self.engine.remove_detector(detector)
    }

    /// Registered detectors.
    pub fn detectors(&self) -> Vec<Detector> {
        self.engine.detectors()
    }

    /// Acquisition loop state.
    pub fn loop_state(&self) -> LoopState {
        self.engine.state()
    }

    /// Status-line state.
    pub fn active_state(&self) -> ActiveState {
        self.active.state()
    }

    /// Pin a status line or hand it back to the scanning state.
    pub fn set_line_override(&self, line: u32, line_override: LineOverride) -> Result<()> {
        self.active.set_override(line, line_override)
    }

    /// Acquisition counters.
    pub fn stats(&self) -> AcquisitionStats {
        self.engine.stats()
    }

    /// Error that stopped the last acquisition.
    pub fn last_error(&self) -> Option<ScanError> {
        self.engine.last_error()
    }

    /// Stop both workers. Safe to call more than once.
    pub fn shutdown(&self) {
        self.engine.terminate();
        self.active.shutdown();
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn clamp_translation(shape: f64, s: &ScanSettings, axis: usize, translation: f64) -> f64 {
    let half_room = ((shape - s.resolution[axis] as f64 * s.scale[axis]) / 2.0).max(0.0);
    translation.clamp(-half_room, half_room)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::SimHardware;

    fn scanner() -> Scanner {
        Scanner::new(Arc::new(SimHardware::default()), ScannerConfig::default()).unwrap()
    }

    #[test]
    fn test_resolution_keeps_field_of_view() {
        let scanner = scanner();
        let before = scanner.settings();
        let applied = scanner.set_resolution([512, 128]).unwrap();
        assert_eq!(applied, [512, 128]);
        let after = scanner.settings();
        for axis in 0..2 {
            let fov_before = before.resolution[axis] as f64 * before.scale[axis];
            let fov_after = after.resolution[axis] as f64 * after.scale[axis];
            assert!((fov_before - fov_after).abs() < 1e-9);
        }
        assert!(scanner.set_resolution([0, 10]).is_err());
        assert_eq!(scanner.set_resolution([1_000_000, 4]).unwrap(), [2048, 4]);
    }

    #[test]
    fn test_frame_stays_inside_field() {
        let scanner = scanner();
        scanner.set_resolution([256, 256]).unwrap();
        let scale = scanner.set_scale([100.0, 4.0]).unwrap();
        assert!((scale[0] - 8.0).abs() < 1e-9);
        assert!((scale[1] - 4.0).abs() < 1e-9);
        let t = scanner.set_translation([5000.0, -5000.0]).unwrap();
        assert_eq!(t[0], 0.0);
        assert!((t[1] + 512.0).abs() < 1e-9);
    }

    #[test]
    fn test_initial_settings_validated() {
        let hw: Arc<dyn ScanHardware> = Arc::new(SimHardware::default());
        let bad = [
            ScanSettings {
                resolution: [0, 4],
                margin: 2,
                ..Default::default()
            },
            ScanSettings {
                scale: [f64::NAN, 1.0],
                ..Default::default()
            },
            ScanSettings {
                dwell_time: 0.0,
                ..Default::default()
            },
            ScanSettings {
                path: Some(Arc::from(vec![[5000.0, 0.0]])),
                ..Default::default()
            },
            ScanSettings {
                fast_lines: FastLines {
                    pixel_bit: Some(3),
                    line_bit: Some(3),
                    ..Default::default()
                },
                ..Default::default()
            },
        ];
        for initial in bad {
            let config = ScannerConfig {
                initial: initial.clone(),
                ..Default::default()
            };
            match Scanner::new(Arc::clone(&hw), config) {
                Err(ScanError::InvalidConfig { .. }) => {}
                Err(e) => panic!("{initial:?}: unexpected {e}"),
                Ok(_) => panic!("{initial:?} accepted"),
            }
        }
    }

    #[test]
    fn test_dwell_time_negotiated() {
        let scanner = scanner();
        let accepted = scanner.set_dwell_time(3.3e-6).unwrap();
        assert!(accepted >= 3.3e-6);
        assert_eq!(scanner.settings().dwell_time, accepted);

        assert!(scanner.set_dwell_time(-1.0).is_err());
        assert_eq!(scanner.settings().dwell_time, accepted);
    }

    #[test]
    fn test_path_validation() {
        let scanner = scanner();
        assert!(scanner.set_path(Some(Vec::new())).is_err());
        assert!(scanner.set_path(Some(vec![[5000.0, 0.0]])).is_err());
        scanner.set_path(Some(vec![[0.0, 0.0], [10.0, 10.0]])).unwrap();
        assert_eq!(scanner.settings().path.as_deref().map(|p| p.len()), Some(2));
        scanner.set_path(None).unwrap();
        assert!(scanner.settings().path.is_none());
    }

    #[test]
    fn test_fast_line_validation() {
        let scanner = scanner();
        let overlapping = FastLines {
            pixel_bit: Some(1),
            line_bit: Some(1),
            ..Default::default()
        };
        assert!(scanner.set_fast_lines(overlapping).is_err());
        let out_of_port = FastLines {
            frame_bit: Some(40),
            ..Default::default()
        };
        assert!(scanner.set_fast_lines(out_of_port).is_err());
    }
}
