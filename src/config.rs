//! Engine configuration using Figment.
//!
//! Configuration is merged from, in increasing priority:
//! 1. built-in defaults
//! 2. a TOML file (`config/scan.toml` unless another path is given)
//! 3. environment variables prefixed with `SCAN_DAQ_`, with `__` separating
//!    nested keys
//!
//! For example `SCAN_DAQ_APPLICATION__LOG_LEVEL=debug` or
//! `SCAN_DAQ_ACQUISITION__BARRIER_POLL=20ms`.
//!
//! # Example
//! ```no_run
//! use scan_daq::config::EngineConfig;
//!
//! let config = EngineConfig::load()?;
//! config.validate()?;
//! println!("dwell time: {:e} s", config.scanner.dwell_time);
//! # Ok::<(), scan_daq::config::ConfigError>(())
//! ```

use std::collections::HashSet;
use std::path::Path;

use daq_scan::{
    AcquisitionConfig, ActiveStateConfig, BeamGeometry, FastLines, Range, ScanSettings,
    ScannerConfig, SimConfig, TimingCapabilities,
};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tracing_setup::{parse_log_level, OutputFormat};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/scan.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "SCAN_DAQ_";

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File or environment could not be parsed into the config
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// Values parse but do not make sense together
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self::Load(Box::new(e))
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Logging
    pub application: ApplicationConfig,
    /// Simulated device
    pub hardware: HardwareConfig,
    /// Field geometry, wiring and initial scan parameters
    pub scanner: ScannerSection,
    /// Acquisition loop tuning
    pub acquisition: AcquisitionConfig,
    /// Scanning-active status lines
    pub active_state: ActiveStateConfig,
    /// Clocked pixel / line / frame lines
    pub fast_lines: FastLines,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log line format
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "scan-daq".into(),
            log_level: "info".into(),
            log_format: OutputFormat::Pretty,
        }
    }
}

/// Simulated hardware.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Clock periods, dwell limits and buffer sizes
    pub timing: TimingCapabilities,
    /// Aggregate input rate above which continuous runs are refused
    pub max_continuous_input_rate: Option<f64>,
    /// Pace reads to wall-clock time
    pub pace: bool,
}

impl HardwareConfig {
    /// Settings for [`daq_scan::SimHardware`].
    pub fn sim_config(&self) -> SimConfig {
        let config = SimConfig::default()
            .with_capabilities(self.timing.clone())
            .with_pacing(self.pace);
        match self.max_continuous_input_rate {
            Some(rate) => config.with_max_continuous_input_rate(rate),
            None => config,
        }
    }
}

/// Field geometry, output wiring and the scan parameters used at start-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerSection {
    /// Logical field size per axis
    pub shape: [f64; 2],
    /// Voltage at the negative and positive field edge, per axis
    pub limits: [[f64; 2]; 2],
    /// Range of the position outputs
    pub output_range: Range,
    /// Position output channels `[x, y]`
    pub position_channels: [u32; 2],
    /// Digital port of the clocked status lines
    pub fast_line_port: u32,
    /// Idle beam position (raw codes)
    pub park_position: Option<[u16; 2]>,
    /// Initial resolution
    pub resolution: [usize; 2],
    /// Initial position spacing; the full field when absent
    pub scale: Option<[f64; 2]>,
    /// Initial dwell time in seconds
    pub dwell_time: f64,
    /// Initial settle positions per line
    pub margin: usize,
}

impl Default for ScannerSection {
    fn default() -> Self {
        let geometry = BeamGeometry::default();
        let acquisition = AcquisitionConfig::default();
        let settings = ScanSettings::default();
        Self {
            shape: geometry.shape,
            limits: geometry.limits,
            output_range: geometry.output_range,
            position_channels: acquisition.position_channels,
            fast_line_port: acquisition.fast_line_port,
            park_position: acquisition.park_position,
            resolution: settings.resolution,
            scale: None,
            dwell_time: settings.dwell_time,
            margin: settings.margin,
        }
    }
}

impl ScannerSection {
    /// Coordinate mapping described by this section.
    pub fn geometry(&self) -> BeamGeometry {
        BeamGeometry {
            shape: self.shape,
            limits: self.limits,
            output_range: self.output_range,
        }
    }
}

impl EngineConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Check that the values make sense together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        parse_log_level(&self.application.log_level).map_err(ConfigError::Invalid)?;

        let t = &self.hardware.timing;
        if !(t.base_clock_hz.is_finite() && t.base_clock_hz > 0.0) {
            return invalid(format!(
                "hardware.timing.base_clock_hz {} must be positive",
                t.base_clock_hz
            ));
        }
        if t.min_buffer_len == 0 || t.max_buffer_len < 2 * t.min_buffer_len {
            return invalid(format!(
                "hardware.timing buffer lengths {}..{} leave no room for double buffering",
                t.min_buffer_len, t.max_buffer_len
            ));
        }
        if let Some(rate) = self.hardware.max_continuous_input_rate {
            if !(rate.is_finite() && rate > 0.0) {
                return invalid(format!(
                    "hardware.max_continuous_input_rate {} must be positive",
                    rate
                ));
            }
        }

        let s = &self.scanner;
        if s.shape.iter().any(|v| !(v.is_finite() && *v > 0.0)) {
            return invalid(format!("scanner.shape {:?} must be positive", s.shape));
        }
        if s.limits.iter().any(|[lo, hi]| lo == hi) {
            return invalid(format!("scanner.limits {:?} span no voltage", s.limits));
        }
        if s.output_range.span() <= 0.0 {
            return invalid(format!("scanner.output_range {:?} is empty", s.output_range));
        }
        if s.position_channels[0] == s.position_channels[1] {
            return invalid(format!(
                "scanner.position_channels {:?} must differ",
                s.position_channels
            ));
        }
        if s.resolution.contains(&0) {
            return invalid(format!("scanner.resolution {:?} must be non-zero", s.resolution));
        }
        if let Some(scale) = s.scale {
            if scale.iter().any(|v| !(v.is_finite() && *v > 0.0)) {
                return invalid(format!("scanner.scale {:?} must be positive", scale));
            }
        }
        if !(s.dwell_time.is_finite() && s.dwell_time > 0.0) {
            return invalid(format!("scanner.dwell_time {} must be positive", s.dwell_time));
        }

        let a = &self.acquisition;
        if a.tuning.chunk_duration.is_zero() || a.barrier_poll.is_zero() {
            return invalid("acquisition.chunk_duration and barrier_poll must be non-zero".into());
        }
        if a.tuning.negotiation.max_attempts == 0 || a.tuning.negotiation.max_osr == 0 {
            return invalid(
                "acquisition.negotiation max_attempts and max_osr must be at least 1".into(),
            );
        }

        let mut lines = HashSet::new();
        for line in &self.active_state.lines {
            if !lines.insert(line.line) {
                return invalid(format!("active_state line {} listed twice", line.line));
            }
        }

        self.fast_lines
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("fast_lines: {e}")))
    }

    /// Scanner bring-up parameters.
    pub fn scanner_config(&self) -> ScannerConfig {
        let s = &self.scanner;
        let geometry = s.geometry();
        let scale = s.scale.unwrap_or_else(|| {
            [
                geometry.shape[0] / s.resolution[0] as f64,
                geometry.shape[1] / s.resolution[1] as f64,
            ]
        });

        let mut acquisition = self.acquisition.clone();
        acquisition.position_channels = s.position_channels;
        acquisition.fast_line_port = s.fast_line_port;
        acquisition.park_position = s.park_position;

        ScannerConfig {
            initial: ScanSettings {
                resolution: s.resolution,
                scale,
                dwell_time: s.dwell_time,
                margin: s.margin,
                fast_lines: self.fast_lines,
                ..ScanSettings::default()
            },
            geometry,
            acquisition,
            active_state: self.active_state.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_scan::LineOverride;
    use serial_test::serial;
    use std::io::Write;
    use std::time::Duration;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_defaults_are_valid() {
        let config = EngineConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config, EngineConfig::default());
        config.validate().unwrap();
    }

    #[test]
    #[serial]
    fn test_load_sections_from_file() {
        let file = write_config(
            r#"
            [application]
            log_level = "debug"
            log_format = "json"

            [hardware]
            pace = true
            max_continuous_input_rate = 2.0e6

            [hardware.timing]
            max_buffer_len = 4096

            [scanner]
            resolution = [128, 64]
            dwell_time = 2.0e-6
            park_position = [0, 0]

            [acquisition]
            chunk_duration = "20ms"
            barrier_poll = "15ms"

            [acquisition.negotiation]
            max_attempts = 3

            [active_state]
            activation_delay = "50ms"
            lines = [
                { line = 4 },
                { line = 5, active_high = false, override = "forced_high" },
            ]

            [fast_lines]
            pixel_bit = 0
            line_bit = 1
            "#,
        );

        let config = EngineConfig::load_from(file.path()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.application.log_format, OutputFormat::Json);
        assert!(config.hardware.pace);
        assert_eq!(config.hardware.timing.max_buffer_len, 4096);
        assert_eq!(
            config.hardware.timing.min_ao_period,
            TimingCapabilities::default().min_ao_period
        );
        assert_eq!(config.acquisition.tuning.chunk_duration, Duration::from_millis(20));
        assert_eq!(config.acquisition.barrier_poll, Duration::from_millis(15));
        assert_eq!(config.acquisition.tuning.negotiation.max_attempts, 3);
        assert_eq!(config.active_state.activation_delay, Duration::from_millis(50));
        assert_eq!(config.active_state.lines.len(), 2);
        assert!(!config.active_state.lines[1].active_high);
        assert_eq!(config.active_state.lines[1].line_override, LineOverride::ForcedHigh);
        assert_eq!(config.fast_lines.line_bit, Some(1));

        let scanner = config.scanner_config();
        assert_eq!(scanner.initial.resolution, [128, 64]);
        assert_eq!(scanner.initial.scale, [16.0, 32.0]);
        assert_eq!(scanner.initial.fast_lines.pixel_bit, Some(0));
        assert_eq!(scanner.acquisition.park_position, Some([0, 0]));
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        let file = write_config("[application]\nlog_level = \"info\"\n");
        std::env::set_var("SCAN_DAQ_APPLICATION__LOG_LEVEL", "warn");
        std::env::set_var("SCAN_DAQ_ACQUISITION__BARRIER_POLL", "20ms");
        let config = EngineConfig::load_from(file.path());
        std::env::remove_var("SCAN_DAQ_APPLICATION__LOG_LEVEL");
        std::env::remove_var("SCAN_DAQ_ACQUISITION__BARRIER_POLL");

        let config = config.unwrap();
        assert_eq!(config.application.log_level, "warn");
        assert_eq!(config.acquisition.barrier_poll, Duration::from_millis(20));
    }

    #[test]
    #[serial]
    fn test_shipped_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH);
        let config = EngineConfig::load_from(path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.active_state.lines.len(), 2);
        assert_eq!(config.scanner.margin, 8);
        assert_eq!(config.acquisition.tuning.chunk_duration, Duration::from_millis(50));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.application.log_level = "chatty".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = EngineConfig::default();
        config.scanner.resolution = [0, 16];
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.fast_lines = FastLines {
            pixel_bit: Some(3),
            frame_bit: Some(3),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.active_state.lines =
            vec![daq_scan::ActiveLine::new(2), daq_scan::ActiveLine::new(2)];
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.scanner.position_channels = [1, 1];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_scale_spans_field() {
        let config = EngineConfig::default();
        let scanner = config.scanner_config();
        for axis in 0..2 {
            let fov = scanner.initial.resolution[axis] as f64 * scanner.initial.scale[axis];
            assert_eq!(fov, scanner.geometry.shape[axis]);
        }
    }
}
