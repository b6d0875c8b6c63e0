//! End-to-end acquisition against the simulated device.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use daq_scan::{
    AcquisitionConfig, ActiveLine, ActiveStateConfig, Detector, DetectorKind, FastLines, Frame,
    FrameData, FrameReceiver, LoopState, RunMode, ScanError, ScanSettings, Scanner, ScannerConfig,
    SimConfig, SimHardware, SoftwareTrigger, TimingCapabilities,
};

const STATUS_LINE: u32 = 5;

fn config(resolution: [usize; 2], dwell_time: f64) -> ScannerConfig {
    let mut acquisition = AcquisitionConfig::default();
    acquisition.tuning.chunk_duration = Duration::from_millis(1);
    acquisition.barrier_poll = Duration::from_millis(10);
    ScannerConfig {
        initial: ScanSettings {
            resolution,
            scale: [4.0, 4.0],
            dwell_time,
            ..Default::default()
        },
        acquisition,
        active_state: ActiveStateConfig {
            lines: vec![ActiveLine::new(STATUS_LINE)],
            deactivation_delay: Duration::from_millis(300),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn recv_frame(rx: &mut FrameReceiver, timeout: Duration) -> Option<Frame> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(frame) = rx.try_recv() {
            return Some(frame);
        }
        thread::sleep(Duration::from_millis(1));
    }
    None
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[tokio::test(flavor = "multi_thread")]
async fn continuous_frames_are_delivered() {
    let hw = Arc::new(SimHardware::default());
    let scanner = Scanner::new(hw.clone(), config([16, 8], 2e-6)).unwrap();
    let (detector, mut rx) = Detector::analog("se", 0, 16);
    scanner.add_detector(detector.clone()).unwrap();

    let mut last_sequence = None;
    for _ in 0..3 {
        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("frame in time")
            .expect("sink open");
        assert_eq!(frame.mode, RunMode::Continuous);
        assert_eq!(frame.resolution, [16, 8]);
        assert_eq!(frame.data.dim(), (8, 16));
        assert!(matches!(frame.data, FrameData::Analog(_)));
        assert!(frame.integration_count >= 1);
        assert!(frame.dwell_time >= 2e-6);
        if let Some(prev) = last_sequence {
            assert!(frame.sequence > prev);
        }
        last_sequence = Some(frame.sequence);
    }
    assert_eq!(hw.static_line(STATUS_LINE), Some(true));
    assert!(scanner.stats().continuous_frames >= 3);
    assert_eq!(scanner.stats().continuous_rejections, 0);

    scanner.remove_detector(&detector).unwrap();
    scanner.shutdown();
}

#[test]
fn analog_and_counting_detectors_share_sequence_numbers() {
    let hw = Arc::new(SimHardware::new(SimConfig::default().with_pacing(true)));
    let scanner = Scanner::new(hw.clone(), config([16, 16], 10e-6)).unwrap();
    let (se, mut se_rx) = Detector::analog("se", 0, 64);
    let (pmt, mut pmt_rx) = Detector::counting("pmt", 0, 64);
    scanner.add_detector(se.clone()).unwrap();
    scanner.add_detector(pmt.clone()).unwrap();

    // Frames from before the counter joined may be analog-only
    let counts = recv_frame(&mut pmt_rx, Duration::from_secs(5)).expect("counting frame");
    assert!(matches!(counts.data, FrameData::Counts(_)));
    assert_eq!(counts.data.dim(), (16, 16));

    let mut analog = recv_frame(&mut se_rx, Duration::from_secs(5)).expect("analog frame");
    while analog.sequence < counts.sequence {
        analog = recv_frame(&mut se_rx, Duration::from_secs(5)).expect("analog frame");
    }
    assert_eq!(analog.sequence, counts.sequence);
    assert_eq!(analog.timestamp, counts.timestamp);

    scanner.shutdown();
}

#[test]
fn counter_only_run_uses_counter_clock() {
    let hw = Arc::new(SimHardware::new(SimConfig::default().with_counter_signal(|_, _| 1)));
    let scanner = Scanner::new(hw.clone(), config([4, 4], 2e-6)).unwrap();
    let (pmt, mut rx) = Detector::counting("pmt", 1, 4);
    scanner.add_detector(pmt).unwrap();

    let frame = recv_frame(&mut rx, Duration::from_secs(5)).expect("frame");
    let FrameData::Counts(image) = &frame.data else {
        panic!("expected counts, got {:?}", frame.data);
    };
    // One count per input sample, summed over the pixel
    assert!(image.iter().all(|&v| v == frame.integration_count as u64));
}

#[test]
fn settings_update_completes_the_frame_in_flight() {
    let hw = Arc::new(SimHardware::new(SimConfig::default().with_pacing(true)));
    let scanner = Scanner::new(hw.clone(), config([32, 32], 10e-6)).unwrap();
    let (detector, mut rx) = Detector::analog("se", 0, 64);
    scanner.add_detector(detector).unwrap();

    let first = recv_frame(&mut rx, Duration::from_secs(5)).expect("first frame");
    assert_eq!(first.resolution, [32, 32]);
    scanner.set_resolution([16, 16]).unwrap();

    let mut seen_new = false;
    let deadline = Instant::now() + Duration::from_secs(5);
    while !seen_new && Instant::now() < deadline {
        let Some(frame) = recv_frame(&mut rx, Duration::from_millis(500)) else {
            continue;
        };
        // Every frame is whole: either the old geometry or the new one
        match frame.resolution {
            [32, 32] => assert_eq!(frame.data.dim(), (32, 32)),
            [16, 16] => {
                assert_eq!(frame.data.dim(), (16, 16));
                seen_new = true;
            }
            other => panic!("unexpected resolution {other:?}"),
        }
    }
    assert!(seen_new, "no frame with the new resolution");

    // Once the new geometry is live no old frame follows
    for _ in 0..3 {
        if let Some(frame) = recv_frame(&mut rx, Duration::from_millis(500)) {
            assert_eq!(frame.resolution, [16, 16]);
        }
    }
    assert!(scanner.stats().runs >= 2);
}

#[test]
fn deregistering_stops_quickly_and_lowers_lines_after_delay() {
    let hw = Arc::new(SimHardware::new(SimConfig::default().with_pacing(true)));
    let scanner = Scanner::new(hw.clone(), config([32, 32], 10e-6)).unwrap();
    let (detector, mut rx) = Detector::analog("se", 0, 4);
    scanner.add_detector(detector.clone()).unwrap();
    recv_frame(&mut rx, Duration::from_secs(5)).expect("frame");
    assert_eq!(hw.static_line(STATUS_LINE), Some(true));

    let removed_at = Instant::now();
    scanner.remove_detector(&detector).unwrap();
    // Idempotent
    scanner.remove_detector(&detector).unwrap();

    assert!(wait_until(Duration::from_secs(1), || scanner.loop_state() == LoopState::Stopped));
    assert!(removed_at.elapsed() < Duration::from_millis(300));
    assert_eq!(hw.static_line(STATUS_LINE), Some(true));
    assert!(hw.park_position().is_some());

    assert!(wait_until(Duration::from_secs(2), || hw.static_line(STATUS_LINE) == Some(false)));
    let lowered = hw
        .line_history()
        .into_iter()
        .rev()
        .find(|e| e.line == STATUS_LINE && !e.high)
        .expect("line lowered");
    assert!(lowered.at.duration_since(removed_at) >= Duration::from_millis(300));
}

#[test]
fn rejected_continuous_rate_falls_back_to_synchronized_frames() {
    let hw = Arc::new(SimHardware::new(
        SimConfig::default().with_max_continuous_input_rate(1e5),
    ));
    let scanner = Scanner::new(hw.clone(), config([8, 8], 2e-6)).unwrap();
    let (detector, mut rx) = Detector::analog("se", 0, 16);
    scanner.add_detector(detector).unwrap();

    for _ in 0..2 {
        let frame = recv_frame(&mut rx, Duration::from_secs(5)).expect("frame");
        assert_eq!(frame.mode, RunMode::Synchronized);
        assert_eq!(frame.data.dim(), (8, 8));
    }
    let stats = scanner.stats();
    assert!(stats.continuous_rejections >= 1);
    assert!(stats.synchronized_frames >= 2);
    assert_eq!(stats.continuous_frames, 0);
    assert!(scanner.last_error().is_none());
}

#[test]
fn read_fault_mid_run_drops_the_partial_frame_and_falls_back() {
    let hw = Arc::new(SimHardware::new(SimConfig::default().with_pacing(true)));
    let scanner = Scanner::new(hw.clone(), config([16, 16], 10e-6)).unwrap();
    let (detector, mut rx) = Detector::analog("se", 0, 64);
    scanner.add_detector(detector).unwrap();

    let first = recv_frame(&mut rx, Duration::from_secs(5)).expect("continuous frame");
    assert_eq!(first.mode, RunMode::Continuous);

    hw.inject_read_faults(1);
    assert!(wait_until(Duration::from_secs(5), || {
        scanner.stats().continuous_rejections >= 1
    }));
    let continuous_frames = scanner.stats().continuous_frames;

    // Frames finished before the fault may still be queued; nothing
    // continuous follows the first synchronized frame.
    let mut last_sequence = first.sequence;
    let mut synchronized = 0;
    while synchronized < 2 {
        let frame = recv_frame(&mut rx, Duration::from_secs(5)).expect("frame after fault");
        assert_eq!(frame.data.dim(), (16, 16));
        assert!(frame.sequence > last_sequence);
        last_sequence = frame.sequence;
        match frame.mode {
            RunMode::Synchronized => synchronized += 1,
            RunMode::Continuous => assert_eq!(synchronized, 0, "continuous frame after fallback"),
        }
    }

    let stats = scanner.stats();
    assert_eq!(stats.continuous_frames, continuous_frames);
    assert!(stats.synchronized_frames >= 2);
    assert!(scanner.last_error().is_none());
    scanner.shutdown();
}

#[test]
fn read_racing_task_teardown_is_not_a_failure() {
    let hw = Arc::new(SimHardware::new(SimConfig::default().with_pacing(true)));
    let scanner = Scanner::new(hw.clone(), config([16, 16], 10e-6)).unwrap();
    let (detector, mut rx) = Detector::analog("se", 0, 64);
    scanner.add_detector(detector.clone()).unwrap();
    recv_frame(&mut rx, Duration::from_secs(5)).expect("frame");

    // The loop restarts the run instead of failing or leaving continuous mode
    let runs = scanner.stats().runs;
    hw.inject_stopped_reads(1);
    assert!(wait_until(Duration::from_secs(5), || scanner.stats().runs > runs));
    let frame = recv_frame(&mut rx, Duration::from_secs(5)).expect("frame after restart");
    assert_eq!(frame.mode, RunMode::Continuous);

    // Same race while a stop is on its way
    hw.inject_stopped_reads(1);
    scanner.remove_detector(&detector).unwrap();
    assert!(wait_until(Duration::from_secs(1), || scanner.loop_state() == LoopState::Stopped));

    let stats = scanner.stats();
    assert_eq!(stats.continuous_rejections, 0);
    assert_eq!(stats.callback_failures, 0);
    assert!(scanner.last_error().is_none());
}

#[test]
fn zero_width_raster_is_rejected_before_any_worker_starts() {
    let hw = Arc::new(SimHardware::default());
    let mut cfg = config([0, 4], 2e-6);
    cfg.initial.margin = 2;
    match Scanner::new(hw.clone(), cfg) {
        Err(ScanError::InvalidConfig { .. }) => {}
        Err(e) => panic!("unexpected error {e}"),
        Ok(_) => panic!("zero-width raster accepted"),
    }
    assert_eq!(hw.stats().tasks_created, 0);
}

#[test]
fn synchronized_update_waits_for_the_frame_boundary() {
    let hw = Arc::new(SimHardware::new(
        SimConfig::default()
            .with_pacing(true)
            .with_max_continuous_input_rate(1e3),
    ));
    let scanner = Scanner::new(hw.clone(), config([32, 32], 10e-6)).unwrap();
    let (detector, mut rx) = Detector::analog("se", 0, 64);
    scanner.add_detector(detector).unwrap();

    let first = recv_frame(&mut rx, Duration::from_secs(5)).expect("first frame");
    assert_eq!(first.mode, RunMode::Synchronized);
    scanner.set_resolution([16, 16]).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut seen_new = false;
    while !seen_new && Instant::now() < deadline {
        let Some(frame) = recv_frame(&mut rx, Duration::from_millis(500)) else {
            continue;
        };
        assert_eq!(frame.mode, RunMode::Synchronized);
        match frame.resolution {
            [32, 32] => assert_eq!(frame.data.dim(), (32, 32)),
            [16, 16] => {
                assert_eq!(frame.data.dim(), (16, 16));
                seen_new = true;
            }
            other => panic!("unexpected resolution {other:?}"),
        }
    }
    assert!(seen_new, "no frame with the new resolution");
    assert!(scanner.last_error().is_none());
    scanner.shutdown();
}

#[test]
fn triggered_detector_waits_for_each_fire() {
    let hw = Arc::new(SimHardware::default());
    let scanner = Scanner::new(hw.clone(), config([8, 4], 2e-6)).unwrap();
    let trigger = SoftwareTrigger::new();
    let (detector, mut rx) = Detector::builder("bse", DetectorKind::Analog, 1)
        .trigger(trigger.clone())
        .capacity(8)
        .build();
    scanner.add_detector(detector.clone()).unwrap();

    assert!(recv_frame(&mut rx, Duration::from_millis(200)).is_none());
    assert_eq!(scanner.loop_state(), LoopState::SynchronizedRun);

    trigger.fire();
    let first = recv_frame(&mut rx, Duration::from_secs(5)).expect("first frame");
    assert_eq!(first.mode, RunMode::Synchronized);
    trigger.fire();
    let second = recv_frame(&mut rx, Duration::from_secs(5)).expect("second frame");
    assert!(second.sequence > first.sequence);
    assert!(recv_frame(&mut rx, Duration::from_millis(100)).is_none());

    // Stop stays responsive while waiting at the barrier
    scanner.remove_detector(&detector).unwrap();
    assert!(wait_until(Duration::from_secs(1), || scanner.loop_state() == LoopState::Stopped));
}

#[test]
fn synchronized_io_failure_is_fatal() {
    let hw = Arc::new(SimHardware::default());
    hw.inject_read_faults(1);
    let scanner = Scanner::new(hw.clone(), config([8, 4], 2e-6)).unwrap();
    let trigger = SoftwareTrigger::new();
    trigger.fire();
    let (detector, mut rx) = Detector::builder("bse", DetectorKind::Analog, 0)
        .trigger(trigger)
        .build();
    scanner.add_detector(detector).unwrap();

    assert!(wait_until(Duration::from_secs(2), || scanner.last_error().is_some()));
    assert!(matches!(scanner.last_error(), Some(ScanError::Hardware { .. })));
    assert!(wait_until(Duration::from_secs(1), || scanner.loop_state() == LoopState::Stopped));
    assert!(rx.try_recv().is_err());
    assert_eq!(scanner.stats().frames_delivered, 0);
}

#[test]
fn large_frames_stream_through_refills() {
    let caps = TimingCapabilities {
        max_buffer_len: 64,
        ..Default::default()
    };
    let hw = Arc::new(SimHardware::new(SimConfig::default().with_capabilities(caps)));
    let mut cfg = config([32, 32], 2e-6);
    cfg.initial.fast_lines = FastLines {
        pixel_bit: Some(0),
        line_bit: Some(1),
        ..Default::default()
    };
    let scanner = Scanner::new(hw.clone(), cfg).unwrap();
    let (detector, mut rx) = Detector::analog("se", 0, 8);
    scanner.add_detector(detector.clone()).unwrap();

    for _ in 0..2 {
        let frame = recv_frame(&mut rx, Duration::from_secs(5)).expect("frame");
        assert_eq!(frame.mode, RunMode::Continuous);
        assert_eq!(frame.data.dim(), (32, 32));
    }
    scanner.remove_detector(&detector).unwrap();
    assert!(wait_until(Duration::from_secs(1), || scanner.loop_state() == LoopState::Stopped));

    let sim = hw.stats();
    assert!(sim.refills > 0);
    assert_eq!(sim.underruns, 0);
    assert_eq!(scanner.stats().callback_failures, 0);
    // Clocked lines return to rest once idle
    assert_eq!(hw.static_line(0), Some(false));
    assert_eq!(hw.static_line(1), Some(false));
}

#[test]
fn waveform_is_reused_across_runs() {
    let hw = Arc::new(SimHardware::default());
    let scanner = Scanner::new(hw.clone(), config([8, 8], 2e-6)).unwrap();
    let (detector, mut rx) = Detector::analog("se", 0, 4);
    scanner.add_detector(detector.clone()).unwrap();
    recv_frame(&mut rx, Duration::from_secs(5)).expect("frame");
    scanner.remove_detector(&detector).unwrap();
    assert!(wait_until(Duration::from_secs(1), || scanner.loop_state() == LoopState::Stopped));

    scanner.add_detector(detector.clone()).unwrap();
    recv_frame(&mut rx, Duration::from_secs(5)).expect("frame");
    assert_eq!(scanner.waveforms_generated(), 1);
    assert!(scanner.stats().runs >= 2);
}
