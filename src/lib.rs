//! `scan_daq`
//!
//! Application crate around the [`daq_scan`] engine: Figment configuration,
//! tracing setup and the simulated-hardware runner behind the `scan-daq`
//! binary.
//!
//! ## Modules
//!
//! - [`config`] - `EngineConfig` loaded from TOML and `SCAN_DAQ_` variables
//! - [`tracing_setup`] - `tracing-subscriber` initialisation
//! - [`simulate`] - run the engine on `SimHardware` and collect frames

pub mod config;
pub mod simulate;
pub mod tracing_setup;

pub use daq_core;
pub use daq_scan;

pub use config::{ConfigError, EngineConfig};
pub use simulate::{SimulateOptions, SimulationReport};
