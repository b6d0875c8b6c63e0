//! Sample period negotiation.
//!
//! Given a requested dwell time per beam position and a number of input
//! channels, find clock periods that the hardware can produce for every
//! channel group at once:
//!
//! ```text
//!   dwell = ao_osr × ao_period = ai_osr × ai_period
//!   do_period = ao_period / 2
//! ```
//!
//! All periods are handled in whole timebase ticks so the equalities above
//! hold exactly.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{Result, ScanError};
use crate::hal::{ChannelKind, ScanHardware};

/// Default number of nudged attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default cap on the input oversampling ratio.
pub const DEFAULT_MAX_OSR: u32 = 1 << 24;

/// Tuning of the negotiation search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Attempts per output split with the input period nudged up by one tick
    pub max_attempts: u32,
    /// Largest input oversampling ratio
    pub max_osr: u32,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_osr: DEFAULT_MAX_OSR,
        }
    }
}

/// Result of a successful negotiation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NegotiatedTiming {
    /// Accepted dwell time in seconds (>= requested)
    pub dwell_time: f64,
    /// Output clock ticks per position
    pub ao_osr: u32,
    /// Input clock ticks per position
    pub ai_osr: u32,
    /// Output sample period in seconds
    pub ao_period: f64,
    /// Input sample period in seconds
    pub ai_period: f64,
    /// Digital output sample period in seconds
    pub do_period: f64,
}

enum Split {
    Found {
        total_ticks: u64,
        ao_ticks: u64,
        ai_osr: u64,
        ai_ticks: u64,
    },
    OutputTooLong,
    Exhausted,
}

/// Finds legal clock periods for a dwell time.
pub struct PeriodNegotiator<'a> {
    hardware: &'a dyn ScanHardware,
    config: NegotiationConfig,
}

impl<'a> PeriodNegotiator<'a> {
    /// Create a negotiator with default tuning.
    pub fn new(hardware: &'a dyn ScanHardware) -> Self {
        Self::with_config(hardware, NegotiationConfig::default())
    }

    /// Create a negotiator with explicit tuning.
    pub fn with_config(hardware: &'a dyn ScanHardware, config: NegotiationConfig) -> Self {
        Self { hardware, config }
    }

    fn ticks(&self, period: f64) -> u64 {
        self.hardware.capabilities().period_to_ticks(period)
    }

    fn seconds(&self, ticks: u64) -> f64 {
        self.hardware.capabilities().ticks_to_period(ticks)
    }

    /// Whether `ticks` is exactly a legal period for `kind`.
    fn is_legal(&self, kind: ChannelKind, n_channels: usize, ticks: u64) -> bool {
        if ticks == 0 {
            return false;
        }
        match self.hardware.closest_period(kind, n_channels, self.seconds(ticks)) {
            Ok(p) => self.ticks(p) == ticks,
            Err(_) => false,
        }
    }

    /// Search input periods for a fixed number of output ticks per dwell.
    ///
    /// The input period is nudged up one tick per attempt; `tried` counts
    /// attempts across calls.
    fn try_split(
        &self,
        dwell_ticks: u64,
        n: usize,
        ao_osr: u64,
        ai_min_ticks: u64,
        tried: &mut u32,
    ) -> Split {
        // Largest osr whose sub-period is still legal, as a multiple of ao_osr
        let max_osr = (self.config.max_osr as u64 / ao_osr * ao_osr).max(ao_osr);
        let fit = (dwell_ticks / ai_min_ticks.max(1)).max(1);
        let osr = (fit.min(max_osr) / ao_osr).max(1) * ao_osr;
        let max_ao_ticks = self.hardware.capabilities().max_period_ticks;

        let base_ai_ticks = dwell_ticks.div_ceil(osr).max(ai_min_ticks);
        for attempt in 0..self.config.max_attempts.max(1) {
            let ai_ticks = base_ai_ticks + attempt as u64;
            let total_ticks = ai_ticks * osr;
            let ao_ticks = total_ticks / ao_osr;
            trace!(attempt, ai_ticks, osr, ao_osr, total_ticks, "Trying period combination");
            if ao_ticks > max_ao_ticks {
                return Split::OutputTooLong;
            }
            *tried += 1;

            if !self.is_legal(ChannelKind::AnalogInput, n, ai_ticks)
                || !self.is_legal(ChannelKind::AnalogOutput, 2, ao_ticks)
            {
                continue;
            }
            if ao_ticks % 2 != 0 || !self.is_legal(ChannelKind::DigitalOutput, 1, ao_ticks / 2) {
                continue;
            }

            // One more oversampling step at the same total period
            let next_osr = osr + ao_osr;
            if next_osr <= max_osr && total_ticks % next_osr == 0 {
                let next_ticks = total_ticks / next_osr;
                if self.is_legal(ChannelKind::AnalogInput, n, next_ticks) {
                    return Split::Found {
                        total_ticks,
                        ao_ticks,
                        ai_osr: next_osr,
                        ai_ticks: next_ticks,
                    };
                }
            }
            return Split::Found {
                total_ticks,
                ao_ticks,
                ai_osr: osr,
                ai_ticks,
            };
        }
        Split::Exhausted
    }

    /// Negotiate `(dwell, ao_osr, ai_osr)` for `n_inputs` simultaneous input channels.
    ///
    /// A request below the minimum dwell for that channel count is raised to it.
    pub fn negotiate(&self, requested_dwell: f64, n_inputs: usize) -> Result<NegotiatedTiming> {
        if !requested_dwell.is_finite() || requested_dwell <= 0.0 {
            return Err(ScanError::config(format!(
                "dwell time {} s must be positive",
                requested_dwell
            )));
        }

        let caps = self.hardware.capabilities();
        let n = n_inputs.max(1);
        let dwell = requested_dwell.max(caps.min_dwell_time(n));
        // Round up to a whole tick, ignoring float noise
        let dwell_ticks = ((dwell * caps.base_clock_hz) - 1e-6).ceil().max(1.0) as u64;

        let ai_min_ticks = self.ticks(self.hardware.closest_period(
            ChannelKind::AnalogInput,
            n,
            caps.min_period(ChannelKind::AnalogInput, n),
        )?);
        let ao_min_ticks = self.ticks(caps.min_period(ChannelKind::AnalogOutput, 2)).max(1);

        // Split long dwells over several output ticks
        let max_ao_ticks = self.ticks(caps.max_period()).max(1);
        let mut ao_osr_t = dwell_ticks.div_ceil(max_ao_ticks);
        let mut tried = 0u32;

        loop {
            if ao_osr_t > self.config.max_osr as u64
                || (ao_osr_t > 1 && dwell_ticks / ao_osr_t < ao_min_ticks)
            {
                break;
            }
            let ao_osr = ao_osr_t as u32;

            match self.try_split(dwell_ticks, n, ao_osr_t, ai_min_ticks, &mut tried) {
                Split::Found {
                    total_ticks,
                    ao_ticks,
                    ai_osr,
                    ai_ticks,
                } => {
                    let timing = NegotiatedTiming {
                        dwell_time: self.seconds(total_ticks),
                        ao_osr,
                        ai_osr: ai_osr as u32,
                        ao_period: self.seconds(ao_ticks),
                        ai_period: self.seconds(ai_ticks),
                        do_period: self.seconds(ao_ticks / 2),
                    };
                    debug!(
                        requested = requested_dwell,
                        dwell = timing.dwell_time,
                        ao_osr,
                        ai_osr = timing.ai_osr,
                        attempts = tried,
                        "Negotiated sample periods"
                    );
                    return Ok(timing);
                }
                // Rounding pushed the output period past the counter limit
                Split::OutputTooLong => {
                    trace!(ao_osr, "Output period too long, splitting further");
                    ao_osr_t += 1;
                }
                Split::Exhausted => break,
            }
        }

        Err(ScanError::Negotiation {
            dwell_time: requested_dwell,
            channels: n,
            attempts: tried.max(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::SimHardware;

    #[test]
    fn test_four_channel_minimum() {
        let hw = SimHardware::default();
        let t = PeriodNegotiator::new(&hw).negotiate(1e-9, 4).unwrap();
        assert!((t.dwell_time - 2e-6).abs() < 1e-12);
        assert!((t.ai_period - 1e-6).abs() < 1e-12);
        assert_eq!(t.ai_osr, 2);
        assert_eq!(t.ao_osr, 1);
    }

    #[test]
    fn test_single_channel_oversamples() {
        let hw = SimHardware::default();
        let t = PeriodNegotiator::new(&hw).negotiate(10e-6, 1).unwrap();
        assert!((t.dwell_time - 10e-6).abs() < 1e-12);
        // 250 ns minimum input period
        assert_eq!(t.ai_osr, 40);
        assert!((t.ai_period * t.ai_osr as f64 - t.dwell_time).abs() < 1e-12);
    }

    #[test]
    fn test_long_dwell_splits_output_clock() {
        let hw = SimHardware::new(crate::hal::SimConfig::default().with_capabilities(
            crate::timing::TimingCapabilities {
                max_period_ticks: 1000,
                ..Default::default()
            },
        ));
        let t = PeriodNegotiator::new(&hw).negotiate(25e-6, 1).unwrap();
        assert_eq!(t.ao_osr, 3);
        assert_eq!(t.ai_osr % t.ao_osr, 0);
        assert!(t.ao_period <= 10e-6 + 1e-12);
        assert!((t.ao_period * 3.0 - t.dwell_time).abs() < 1e-8);
    }

    #[test]
    fn test_rounding_past_counter_limit_splits_again() {
        let hw = SimHardware::new(crate::hal::SimConfig::default().with_capabilities(
            crate::timing::TimingCapabilities {
                max_period_ticks: 1000,
                ..Default::default()
            },
        ));
        let negotiator = PeriodNegotiator::new(&hw);
        // 999 ticks rounds up to 39 x 26 = 1014 on a single output tick
        let t = negotiator.negotiate(9.99e-6, 1).unwrap();
        assert_eq!(t.ao_osr, 2);
        assert!(t.ao_period <= 10e-6 + 1e-12);
        assert!(t.dwell_time >= 9.99e-6 - 1e-12);

        let t = negotiator.negotiate(29.99e-6, 1).unwrap();
        assert!(t.ao_osr >= 4);
        assert!(t.ao_period <= 10e-6 + 1e-12);
    }

    #[test]
    fn test_rejects_non_positive_dwell() {
        let hw = SimHardware::default();
        let err = PeriodNegotiator::new(&hw).negotiate(0.0, 1).unwrap_err();
        assert!(matches!(err, ScanError::InvalidConfig { .. }));
        assert!(PeriodNegotiator::new(&hw).negotiate(f64::NAN, 1).is_err());
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let hw = SimHardware::default();
        let negotiator = PeriodNegotiator::with_config(
            &hw,
            NegotiationConfig {
                max_attempts: 0,
                ..Default::default()
            },
        );
        assert!(negotiator.negotiate(1e-6, 1).is_ok());
    }
}
