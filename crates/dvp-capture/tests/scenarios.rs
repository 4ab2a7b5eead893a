use std::sync::Arc;

use dvp_capture::mode;
use dvp_capture::{
    AncillaryConfig, AncillaryError, AncillaryQueue, BufferId, CaptureDevice, CaptureSession,
    CaptureSlot, CaptureState, CaptureStats, CropOutcome, DecodeBuffer, EngineConfig, ManualClock,
    NotificationEvent, Notifications, Rect, ScalingParams, ScalingState, SimulatedPipeline,
    StreamEvent, SurfaceFormat,
};
use proptest::prelude::*;

const START: u64 = 5_000_000;

struct Rig {
    session: CaptureSession,
    stats: Arc<CaptureStats>,
    ancillary: Arc<AncillaryQueue>,
    scaling: ScalingParams,
    next_id: u64,
}

impl Rig {
    fn new(mode_id: u32) -> Self {
        Self::with_config(mode_id, EngineConfig::default())
    }

    fn with_config(mode_id: u32, config: EngineConfig) -> Self {
        let stats = Arc::new(CaptureStats::default());
        let ancillary = Arc::new(AncillaryQueue::new(AncillaryConfig::default()));
        let mut session = CaptureSession::new(
            &config,
            ancillary.clone(),
            stats.clone(),
            Arc::new(Notifications::new()),
        );
        let mode = mode::lookup(mode_id).unwrap();
        session.configure_mode(mode);
        let mut scaling = ScalingState::new(2, true, false);
        scaling.configure_mode(mode.active_width, mode.active_height, mode.is_interlaced());
        Self {
            session,
            stats,
            ancillary,
            scaling: scaling.next(),
            next_id: 0,
        }
    }

    fn commit(&mut self) {
        let slot = CaptureSlot {
            buffer: DecodeBuffer {
                id: BufferId(self.next_id),
                stride: self.scaling.bytes_per_line,
            },
            scaling: self.scaling,
        };
        self.next_id += 1;
        self.session.commit_slot(slot).unwrap();
    }

    /// One source tick followed by an injector pass. Returns slots injected.
    fn tick(&mut self, now: u64) -> usize {
        let actions = self.session.on_tick(now);
        for _ in 0..actions.release_ahead {
            self.commit();
        }
        let mut injected = 0;
        while self.session.take_injectable().is_some() {
            injected += 1;
        }
        injected
    }

    /// Warm up on exact ticks and enter run. Returns the next tick time.
    fn run(&mut self, period: u64) -> u64 {
        let permits = self.session.startup().unwrap();
        let mut now = START;
        while self.session.state() != CaptureState::Started {
            self.session.on_tick(now);
            now += period;
        }
        for _ in 0..=permits {
            self.commit();
        }
        self.session.request_run();
        now
    }
}

proptest! {
    #[test]
    fn prop_warm_up_within_tolerance_needs_no_retries(offset in -3i64..=3, mode_id in prop::sample::select(vec![5u32, 13, 25])) {
        let mut rig = Rig::new(mode_id);
        let nominal = rig.session.timing().frame_duration_us();
        let period = (nominal as i64 + offset * nominal as i64 / 20_000) as u64;

        rig.session.startup().unwrap();
        let mut now = START;
        let mut ticks = 0;
        while rig.session.state() != CaptureState::Started && ticks < 200 {
            rig.session.on_tick(now);
            now += period;
            ticks += 1;
        }

        prop_assert_eq!(rig.session.state(), CaptureState::Started);
        prop_assert_eq!(ticks, rig.session.timing().warm_up_frames() + 1);
        prop_assert_eq!(rig.session.timing().warm_up_attempts(), 1);
    }

    #[test]
    fn prop_standard_rate_keeps_correction_in_band(drift in -30i64..=30, switch_at in 20usize..200) {
        let mut rig = Rig::new(13);
        let mut now = rig.run(20_000);
        let drifted = (20_000 + drift) as u64;

        for tick in 0..600 {
            rig.tick(now);
            let timing = rig.session.timing();
            if rig.session.state() == CaptureState::Running && timing.is_standard_rate() {
                prop_assert!(timing.correction_in_band(), "tick {} correction {}", tick, timing.correction());
            }
            now += if tick < switch_at { 20_000 } else { drifted };
        }
    }
}

#[test]
fn test_ring_never_laps_injection() {
    let mut rig = Rig::new(13);
    rig.run(20_000);
    let depth = EngineConfig::default().ring_depth as u64;

    let mut refused = false;
    for _ in 0..depth {
        let slot = CaptureSlot {
            buffer: DecodeBuffer {
                id: BufferId(1000),
                stride: rig.scaling.bytes_per_line,
            },
            scaling: rig.scaling,
        };
        if rig.session.commit_slot(slot).is_err() {
            refused = true;
            break;
        }
        let cursors = rig.session.cursors();
        assert!(cursors.next_to_inject <= cursors.next_to_fill);
        assert!(cursors.next_to_fill <= cursors.next_to_get);
        assert!(cursors.next_to_get - cursors.next_to_inject < depth);
    }
    assert!(refused);
}

#[test]
fn test_small_rings_keep_capturing() {
    for mode_id in [11u32, 13, 16] {
        for depth in (4..=12).chain([16, 32]) {
            let config = EngineConfig {
                ring_depth: depth,
                ..Default::default()
            };
            config.validate().unwrap();
            let mut rig = Rig::with_config(mode_id, config);
            let period = rig.session.timing().frame_duration_us();
            assert!(rig.session.buffers_ahead() as usize <= depth - 2);

            let mut now = rig.run(period);
            let mut injected = 0;
            for _ in 0..200 {
                injected += rig.tick(now);
                now += period;
            }

            assert_eq!(rig.session.state(), CaptureState::Running, "mode {} depth {}", mode_id, depth);
            assert!(injected > 150, "mode {} depth {} injected {}", mode_id, depth, injected);
            assert_eq!(rig.stats.snapshot().dropped_frames, 0, "mode {} depth {}", mode_id, depth);
        }
    }
}

#[test]
fn test_oversized_ancillary_capture_discarded() {
    let mut rig = Rig::new(13);
    rig.ancillary.request_buffers(2, 64).unwrap();
    rig.ancillary.queue_buffer(0).unwrap();
    rig.ancillary.stream_on().unwrap();

    let mut now = rig.run(20_000);
    rig.tick(now);
    now += 20_000;

    // Five 70 byte packets against a 64 byte buffer
    for _ in 0..5 {
        let mut packet = vec![0x11; 70];
        packet[3] = 16;
        rig.ancillary.hardware_write(&packet);
    }
    rig.tick(now);

    let snap = rig.stats.snapshot();
    assert_eq!(snap.ancillary_discards, 1);
    assert_eq!(snap.ancillary_fills, 0);
    let info = rig.ancillary.query_buffer(0).unwrap();
    assert!(info.queued);
    assert!(!info.done);
    assert_eq!(info.bytes, 0);
}

#[test]
fn test_ancillary_queue_twice_rejected() {
    let queue = AncillaryQueue::new(AncillaryConfig::default());
    assert_eq!(queue.request_buffers(0, 256), Err(AncillaryError::NothingAllocated));

    queue.request_buffers(4, 256).unwrap();
    queue.queue_buffer(1).unwrap();
    let before = queue.query_buffer(1).unwrap();
    assert_eq!(queue.queue_buffer(1), Err(AncillaryError::BufferBusy { index: 1 }));
    assert_eq!(queue.query_buffer(1).unwrap(), before);

    assert!(queue.request_buffers(0, 256).is_ok());
}

fn device() -> (CaptureDevice, Arc<SimulatedPipeline>) {
    let pipeline = Arc::new(SimulatedPipeline::new(SurfaceFormat::Ycbcr422R));
    let device = CaptureDevice::open(
        EngineConfig::default(),
        pipeline.clone(),
        Arc::new(ManualClock::new(0)),
    )
    .unwrap();
    (device, pipeline)
}

#[test]
fn test_output_crop_equal_to_current_reached_at_once() {
    let (device, _) = device();
    let mut rx = device.notifications().subscribe();

    assert_eq!(device.set_output_crop(Rect::default()), CropOutcome::TargetReached);
    assert_eq!(rx.try_recv().unwrap(), NotificationEvent::OutputCropTargetReached);
    assert!(!device.notifications().crop_target_outstanding());
}

#[test]
fn test_output_crop_reached_when_displayed() {
    let (device, _) = device();
    let mut rx = device.notifications().subscribe();
    let target = Rect::new(100, 50, 960, 540);

    assert_eq!(device.set_output_crop(target), CropOutcome::Stepping { steps: 1 });
    assert!(device.notifications().crop_target_outstanding());

    device.handle_event(StreamEvent::OutputSizeChanged(Rect::new(0, 0, 1920, 1080)));
    assert!(rx.try_recv().is_err());

    device.handle_event(StreamEvent::OutputSizeChanged(target));
    assert_eq!(rx.try_recv().unwrap(), NotificationEvent::OutputCropTargetReached);
    assert!(!device.notifications().crop_target_outstanding());
}
