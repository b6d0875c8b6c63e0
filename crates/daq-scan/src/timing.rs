//! Hardware timing capabilities for scan acquisition.
//!
//! This module describes the clock limits the engine negotiates against:
//!
//! - Base timebase and the resulting clock tick
//! - Minimum sample period per channel kind
//! - Maximum period a sample-clock counter can divide down to
//! - Buffer length limits
//!
//! # Timing Model
//!
//! ```text
//!   dwell time (one beam position)
//!   ├────────────────────────────────────────────┤
//!   AO  │ x,y │           (ao_osr ticks per dwell)
//!   DO  │ hi  │ lo  │     (2 × AO clock)
//!   AI  │ s │ s │ s │ s │ (ai_osr ticks per dwell)
//! ```
//!
//! Every period is an integer number of timebase ticks, so all arithmetic on
//! periods is done in ticks and converted back to seconds at the edges.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, ScanError};
use crate::hal::ChannelKind;

/// Clock and buffer limits of a multi-function DAQ device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingCapabilities {
    /// Timebase frequency in Hz
    pub base_clock_hz: f64,
    /// Minimum analog output period in seconds
    pub min_ao_period: f64,
    /// Minimum clocked digital output period in seconds
    pub min_do_period: f64,
    /// Minimum analog input period for a single channel in seconds
    pub min_ai_period: f64,
    /// Minimum conversion time per analog input channel in a multi-channel scan
    pub ai_convert_period: f64,
    /// Minimum counter sample period in seconds
    pub min_ci_period: f64,
    /// Largest divisor of the sample-clock counter
    pub max_period_ticks: u64,
    /// Smallest dwell time with up to two simultaneous input channels
    pub min_dwell_base: f64,
    /// Additional dwell time needed per input channel above two
    pub min_dwell_per_channel: f64,
    /// Shortest output buffer the device accepts
    pub min_buffer_len: usize,
    /// Longest on-board/host buffer in samples per channel
    pub max_buffer_len: usize,
}

impl Default for TimingCapabilities {
    fn default() -> Self {
        // X-series class card with a 100 MHz timebase
        Self {
            base_clock_hz: 100_000_000.0,
            min_ao_period: 400e-9,
            min_do_period: 100e-9,
            min_ai_period: 250e-9,
            ai_convert_period: 250e-9,
            min_ci_period: 50e-9,
            max_period_ticks: 0xFFFF_FFFF,
            min_dwell_base: 1e-6,
            min_dwell_per_channel: 0.5e-6,
            min_buffer_len: 2,
            max_buffer_len: 1 << 22,
        }
    }
}

impl TimingCapabilities {
    /// Duration of one timebase tick in seconds.
    pub fn tick(&self) -> f64 {
        1.0 / self.base_clock_hz
    }

    /// Convert a period to a whole number of ticks (nearest).
    pub fn period_to_ticks(&self, period: f64) -> u64 {
        (period * self.base_clock_hz).round().max(0.0) as u64
    }

    /// Convert a number of ticks back to seconds.
    pub fn ticks_to_period(&self, ticks: u64) -> f64 {
        ticks as f64 / self.base_clock_hz
    }

    /// Minimum sample period for a channel kind.
    ///
    /// Multi-channel analog input converts every channel within one sample
    /// period, so its minimum grows with the channel count.
    pub fn min_period(&self, kind: ChannelKind, n_channels: usize) -> f64 {
        match kind {
            ChannelKind::AnalogOutput => self.min_ao_period,
            ChannelKind::DigitalOutput => self.min_do_period,
            ChannelKind::AnalogInput => self
                .min_ai_period
                .max(n_channels.max(1) as f64 * self.ai_convert_period),
            ChannelKind::Counter => self.min_ci_period,
        }
    }

    /// Maximum sample period of any clock.
    pub fn max_period(&self) -> f64 {
        self.ticks_to_period(self.max_period_ticks)
    }

    /// Shortest dwell time for the given number of simultaneous input channels.
    ///
    /// Up to two channels share the base minimum; above that every extra
    /// channel adds settling time to bound cross-channel error.
    pub fn min_dwell_time(&self, n_input_channels: usize) -> f64 {
        if n_input_channels <= 2 {
            self.min_dwell_base
        } else {
            self.min_dwell_per_channel * n_input_channels as f64
        }
        .max(self.min_ao_period)
    }

    /// Closest legal period `>= period` for a channel kind.
    pub fn closest_period(&self, kind: ChannelKind, n_channels: usize, period: f64) -> Result<f64> {
        let max = self.max_period();
        if period > max * (1.0 + 1e-12) {
            return Err(ScanError::PeriodOutOfRange { kind, period, max });
        }

        let min_ticks =
            (self.min_period(kind, n_channels) * self.base_clock_hz - 1e-6).ceil() as u64;
        // Tolerate float noise so an exact multiple of the tick is not bumped up
        let ticks = (period * self.base_clock_hz - 1e-6).ceil().max(0.0) as u64;
        let ticks = ticks.max(min_ticks).max(1);

        if ticks > self.max_period_ticks {
            return Err(ScanError::PeriodOutOfRange { kind, period, max });
        }

        let accepted = self.ticks_to_period(ticks);
        if ticks as f64 != (period * self.base_clock_hz).round() {
            debug!(
                %kind,
                requested = period,
                accepted,
                "Period adjusted to clock granularity"
            );
        }
        Ok(accepted)
    }

    /// Validate the capabilities themselves.
    pub fn validate(&self) -> Result<()> {
        if !(self.base_clock_hz > 0.0) {
            return Err(ScanError::config(format!(
                "base clock {} Hz must be positive",
                self.base_clock_hz
            )));
        }
        if self.min_buffer_len == 0 || self.max_buffer_len < self.min_buffer_len {
            return Err(ScanError::config(format!(
                "buffer limits [{}, {}] are inconsistent",
                self.min_buffer_len, self.max_buffer_len
            )));
        }
        if self.max_period_ticks == 0 {
            return Err(ScanError::config("max_period_ticks must be at least 1"));
        }
        for (name, value) in [
            ("min_ao_period", self.min_ao_period),
            ("min_do_period", self.min_do_period),
            ("min_ai_period", self.min_ai_period),
            ("min_ci_period", self.min_ci_period),
            ("min_dwell_base", self.min_dwell_base),
        ] {
            if !(value > 0.0) {
                return Err(ScanError::config(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }
}
