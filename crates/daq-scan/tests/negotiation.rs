//! Period negotiation against the simulated clock.

use daq_scan::{
    ChannelKind, PeriodNegotiator, ScanHardware, SimConfig, SimHardware, TimingCapabilities,
};

const TICK: f64 = 10e-9;

#[test]
fn negotiated_timing_is_consistent() {
    let hw = SimHardware::default();
    let caps = hw.capabilities();
    let negotiator = PeriodNegotiator::new(&hw);

    let requests = [
        1e-6, 1.37e-6, 2.5e-6, 3.3e-6, 7.77e-6, 1e-5, 3.1415e-5, 1e-4, 1e-3, 0.05,
    ];
    for &requested in &requests {
        for channels in 1..=8 {
            let t = negotiator
                .negotiate(requested, channels)
                .unwrap_or_else(|e| panic!("{requested:e} s / {channels} ch: {e}"));

            assert!(t.dwell_time >= requested - TICK / 2.0, "{requested:e} / {channels}");
            assert!(t.dwell_time >= caps.min_dwell_time(channels) - TICK / 2.0);
            assert!((t.ao_period * t.ao_osr as f64 - t.dwell_time).abs() <= TICK);
            assert!((t.ai_period * t.ai_osr as f64 - t.dwell_time).abs() <= TICK);
            assert!((t.do_period * 2.0 - t.ao_period).abs() < TICK / 2.0);
            assert_eq!(t.ai_osr % t.ao_osr, 0);

            // Every period is one the hardware accepts unchanged
            for (kind, n, period) in [
                (ChannelKind::AnalogInput, channels, t.ai_period),
                (ChannelKind::AnalogOutput, 2, t.ao_period),
                (ChannelKind::DigitalOutput, 1, t.do_period),
            ] {
                let legal = hw.closest_period(kind, n, period).unwrap();
                assert!((legal - period).abs() < TICK / 2.0, "{kind} {period:e}");
            }
        }
    }
}

#[test]
fn four_channels_raise_the_minimum() {
    let hw = SimHardware::default();
    let negotiator = PeriodNegotiator::new(&hw);
    let one = negotiator.negotiate(1e-9, 1).unwrap();
    let four = negotiator.negotiate(1e-9, 4).unwrap();
    assert!((one.dwell_time - 1e-6).abs() < TICK / 2.0);
    assert!((four.dwell_time - 2e-6).abs() < TICK / 2.0);
}

#[test]
fn longer_dwell_never_reduces_oversampling() {
    let hw = SimHardware::default();
    let negotiator = PeriodNegotiator::new(&hw);
    let short = negotiator.negotiate(2e-6, 1).unwrap();
    let long = negotiator.negotiate(20e-6, 1).unwrap();
    assert!(long.ai_osr >= short.ai_osr);
}

#[test]
fn short_period_counter_accepts_every_dwell() {
    let hw = SimHardware::new(SimConfig::default().with_capabilities(TimingCapabilities {
        max_period_ticks: 1000,
        ..Default::default()
    }));
    let negotiator = PeriodNegotiator::new(&hw);
    let max_period = 1000.0 * TICK;

    // Every tick from 1 us to 50 us crosses several multiples of the counter limit
    for channels in [1, 2, 4] {
        let mut failures = Vec::new();
        for step in 100..=5000u32 {
            let requested = f64::from(step) * TICK;
            match negotiator.negotiate(requested, channels) {
                Ok(t) => {
                    assert!(t.dwell_time >= requested - TICK / 2.0, "{requested:e}");
                    assert!(t.ao_period <= max_period + TICK / 2.0, "{requested:e}");
                    assert!(t.ai_period <= max_period + TICK / 2.0, "{requested:e}");
                    assert!((t.ao_period * t.ao_osr as f64 - t.dwell_time).abs() <= TICK);
                    assert_eq!(t.ai_osr % t.ao_osr, 0);
                }
                Err(_) => failures.push(requested),
            }
        }
        assert!(
            failures.is_empty(),
            "{channels} ch: {} failures, first {:?}",
            failures.len(),
            failures.first()
        );
    }
}
