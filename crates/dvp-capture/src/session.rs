//! Capture session
//!
//! One capture sequence: the state machine driven by source ticks, the
//! timing model, and the decode ring of scheduled slots. Tick handling is
//! synchronous and never blocks; anything that needs a task (waking the
//! synchronizer, releasing the injector) is returned as [`TickActions`] for
//! the caller to apply once the session lock is dropped.

use std::sync::Arc;

use ancillary::{AncillaryQueue, CaptureOutcome};
use frame_timing::{FrameRate, Integration, RateEstimate, TimingModel};
use ring_buffer::{DecodeRing, DropReason, FillOutcome, Injectable, RingCursors};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::CaptureError;
use crate::mode::{ModeParams, StreamInfo};
use crate::pipeline::DecodeBuffer;
use crate::state::{CaptureState, TickAction, Transition};
use crate::stats::{CaptureStats, Notifications};
use crate::window::ScalingParams;

/// Frame periods below this are never reported as interlaced
const INTERLACED_MIN_FRAME_DURATION_US: u64 = 32_000;

const MIN_BUFFERS_AHEAD: u32 = 2;

/// A decode buffer scheduled for capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSlot {
    pub buffer: DecodeBuffer,
    /// Window and scaling programmed for this slot
    pub scaling: ScalingParams,
}

/// Work requested by a tick, applied outside the session lock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickActions {
    /// Further buffers the injector may get ahead of capture
    pub release_ahead: u32,
    pub wake_synchronizer: bool,
    /// Warm-up finished; the injector may proceed
    pub wake_injector: bool,
    /// The time base moved; output vsync must be re-locked
    pub resynchronize: bool,
    /// First tick with an established time base
    pub first_content: bool,
}

/// State of one capture sequence
#[derive(Debug)]
pub struct CaptureSession {
    config: EngineConfig,
    state: CaptureState,
    mode: Option<&'static ModeParams>,
    stream: Option<StreamInfo>,

    timing: TimingModel,
    ring: DecodeRing<CaptureSlot>,

    ancillary: Arc<AncillaryQueue>,
    stats: Arc<CaptureStats>,
    notifications: Arc<Notifications>,

    run_requested: bool,
    run_from_time: u64,
    missed_in_row: u32,
    buffers_ahead: u32,
    first_content_signalled: bool,
}

impl CaptureSession {
    pub fn new(
        config: &EngineConfig,
        ancillary: Arc<AncillaryQueue>,
        stats: Arc<CaptureStats>,
        notifications: Arc<Notifications>,
    ) -> Self {
        Self {
            config: config.clone(),
            state: CaptureState::Inactive,
            mode: None,
            stream: None,
            timing: TimingModel::new(config.timing.clone(), FrameRate::new(50, 1)),
            ring: DecodeRing::new(config.ring_depth),
            ancillary,
            stats,
            notifications,
            run_requested: false,
            run_from_time: 0,
            missed_in_row: 0,
            buffers_ahead: 1,
            first_content_signalled: false,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn mode(&self) -> Option<&'static ModeParams> {
        self.mode
    }

    pub fn stream_info(&self) -> Option<StreamInfo> {
        self.stream
    }

    pub fn timing(&self) -> &TimingModel {
        &self.timing
    }

    pub fn cursors(&self) -> RingCursors {
        self.ring.cursors()
    }

    /// Expected fill time of the slot the next tick completes
    pub fn current_fill_time(&self) -> Option<u64> {
        self.ring.current_fill_time()
    }

    /// Slots the injector keeps scheduled ahead of capture
    pub fn buffers_ahead(&self) -> u32 {
        self.buffers_ahead
    }

    pub fn run_from_time(&self) -> u64 {
        self.run_from_time
    }

    pub fn applied_latency_us(&self) -> u64 {
        self.config.applied_latency_us()
    }

    /// Adopt a video mode: nominal rate, stream description and
    /// bounded-ahead depth
    pub fn configure_mode(&mut self, mode: &'static ModeParams) {
        let stream = StreamInfo::for_mode(mode, self.config.top_field_first, self.config.pixel_aspect_ratio);
        self.timing.set_nominal_rate(stream.rate);
        self.mode = Some(mode);
        self.stream = Some(stream);
        self.buffers_ahead = self.required_ahead();
        self.notifications
            .set_microseconds_per_frame(self.timing.frame_duration_us());
        info!(
            "Mode {} at {} ({} us per tick), {} buffers ahead",
            mode.name,
            stream.rate,
            self.timing.frame_duration_us(),
            self.buffers_ahead
        );
    }

    /// Arm a new capture sequence. The next tick anchors the time base.
    ///
    /// Returns the number of slots the injector may get beyond the first.
    pub fn startup(&mut self) -> Result<u32, CaptureError> {
        if self.mode.is_none() {
            return Err(CaptureError::NoMode);
        }
        self.timing.reset();
        self.ring.reset();
        self.run_requested = false;
        self.run_from_time = 0;
        self.missed_in_row = 0;
        self.first_content_signalled = false;
        self.state = CaptureState::Starting;
        Ok(self.buffers_ahead.saturating_sub(1))
    }

    /// Fail if the ring has no room for another slot
    pub fn ensure_slot(&self) -> Result<(), CaptureError> {
        self.ring.ensure_capacity().map_err(CaptureError::from)
    }

    /// Schedule a programmed slot at the next frame time.
    ///
    /// Returns the slot's expected fill time.
    pub fn commit_slot(&mut self, slot: CaptureSlot) -> Result<u64, CaptureError> {
        if slot.buffer.stride != slot.scaling.bytes_per_line {
            return Err(CaptureError::UnexpectedStride {
                expected: slot.scaling.bytes_per_line,
                actual: slot.buffer.stride,
            });
        }
        self.ring.ensure_capacity()?;
        let expected = self.timing.schedule_frame();
        self.ring.push(slot, expected)?;
        Ok(expected)
    }

    /// Oldest filled slot not yet handed downstream
    pub fn take_injectable(&mut self) -> Option<Injectable<CaptureSlot>> {
        self.ring.take_injectable()
    }

    /// Allow the sequence to leave Started once the first scheduled frame
    /// is due
    pub fn request_run(&mut self) {
        self.run_from_time = self.timing.run_from_time(self.config.run_from_allowance_us);
        self.run_requested = true;
        if self.state == CaptureState::Started {
            self.state = CaptureState::MovingToRun;
        }
        debug!("Run requested from {}", self.run_from_time);
    }

    /// Stop filling. The next tick completes the halt.
    pub fn halt(&mut self) {
        self.run_requested = false;
        if self.state != CaptureState::Inactive {
            self.state = CaptureState::MovingToInactive;
        }
    }

    /// Every slot scheduled but not injected, oldest first
    pub fn drain_uninjected(&mut self) -> Vec<CaptureSlot> {
        self.ring.drain_uninjected()
    }

    /// Handle one source tick
    pub fn on_tick(&mut self, now: u64) -> TickActions {
        let mut actions = TickActions::default();
        self.stats.ticks(1);
        self.timing.begin_tick();

        loop {
            let transition = match self.state.tick_action() {
                TickAction::HaltOutputs => self.tick_inactive(),
                TickAction::Anchor => self.tick_starting(now),
                TickAction::WarmUp => self.tick_warming_up(now, &mut actions),
                TickAction::AcquireFirstContent => self.tick_started(&mut actions),
                TickAction::AwaitRunFrom => self.tick_moving_to_run(now),
                TickAction::Run => self.tick_running(now, &mut actions),
                TickAction::FinishHalt => self.tick_moving_to_inactive(),
            };
            if transition.next != self.state {
                debug!("Capture {} -> {}", self.state, transition.next);
                self.state = transition.next;
            }
            if !transition.same_tick {
                break;
            }
        }

        self.timing.finish_tick(now);
        actions
    }

    fn tick_inactive(&mut self) -> Transition {
        warn!("Source tick with no capture sequence");
        self.ancillary.abort_capture();
        Transition::to(CaptureState::Inactive)
    }

    fn tick_starting(&mut self, now: u64) -> Transition {
        self.timing.anchor(now);
        self.missed_in_row = 0;
        Transition::then(CaptureState::WarmingUp)
    }

    fn tick_warming_up(&mut self, now: u64, actions: &mut TickActions) -> Transition {
        let step = self.timing.warm_up_tick(now);
        if step.resynchronized {
            self.stats.resynchronizations(1);
            actions.resynchronize = true;
            actions.wake_synchronizer = true;
        }
        if !step.finished {
            return Transition::to(CaptureState::WarmingUp);
        }

        if let Some(estimate) = step.estimate {
            self.apply_rate_estimate(estimate, actions);
        }
        info!(
            "Warm-up complete after {} attempts, base time {}",
            self.timing.warm_up_attempts(),
            self.timing.base_time()
        );
        actions.wake_injector = true;
        Transition::then(CaptureState::Started)
    }

    fn tick_started(&mut self, actions: &mut TickActions) -> Transition {
        if !self.first_content_signalled {
            self.first_content_signalled = true;
            actions.first_content = true;
        }
        if self.run_requested {
            Transition::then(CaptureState::MovingToRun)
        } else {
            Transition::to(CaptureState::Started)
        }
    }

    fn tick_moving_to_run(&mut self, now: u64) -> Transition {
        if now < self.run_from_time {
            return Transition::to(CaptureState::MovingToRun);
        }
        Transition::then(CaptureState::Running)
    }

    fn tick_moving_to_inactive(&mut self) -> Transition {
        self.ancillary.abort_capture();
        Transition::to(CaptureState::Inactive)
    }

    fn tick_running(&mut self, now: u64, actions: &mut TickActions) -> Transition {
        let missed = self.timing.compensate_missed_ticks(now);
        if missed > 0 {
            warn!("Missed {} source ticks", missed);
            self.stats.missed_ticks(u64::from(missed));
        }

        let fill_time = self.ring.current_fill_time().unwrap_or(now);
        match self.ancillary.capture(fill_time) {
            CaptureOutcome::Filled { .. } => self.stats.ancillary_fills(1),
            CaptureOutcome::Discarded { .. } => self.stats.ancillary_discards(1),
            CaptureOutcome::NoBufferQueued { bytes } => {
                debug!("No ancillary buffer queued, {} bytes lost", bytes)
            }
            CaptureOutcome::Idle | CaptureOutcome::Empty => {}
        }

        match self.ring.advance_fill(now, self.timing.frame_duration_us()) {
            FillOutcome::Advanced { late_skip_us } => {
                actions.release_ahead += 1;
                self.missed_in_row = 0;
                if late_skip_us > 0 {
                    warn!("Capture fell {} us behind schedule, skipping ahead", late_skip_us);
                    self.timing.shift_base(late_skip_us);
                    self.stats.late_fills(1);
                }
            }
            FillOutcome::Dropped(reason) => {
                self.missed_in_row += 1;
                self.stats.dropped_frames(1);
                match reason {
                    DropReason::NoNextSlot => debug!("Frame dropped, no slot scheduled"),
                    DropReason::TooEarly { early_us } => {
                        debug!("Frame dropped, tick {} us early for next slot", early_us)
                    }
                }
            }
        }

        if self.notifications.on_running_tick() {
            actions.wake_synchronizer = true;
        }

        if self.missed_in_row > self.config.post_mortem_missed_frames
            && self.notifications.raise_post_mortem()
        {
            warn!("{} frames dropped in a row, raising post-mortem", self.missed_in_row);
            self.stats.post_mortems(1);
            actions.wake_synchronizer = true;
        }

        let drift_error = self
            .ring
            .current_fill_time()
            .map_or(0, |expected| expected as i64 - now as i64);
        let ring = &mut self.ring;
        let outcome = self.timing.integrate(now, drift_error, |rate, now| {
            ring.rebase_pending(now, |frames| rate.time_for_frames(frames))
        });
        match outcome {
            Integration::Pending => {}
            Integration::Corrected { .. } => self.stats.correction_updates(1),
            Integration::RateReset(estimate) => {
                self.stats.rate_resets(1);
                self.apply_rate_estimate(estimate, actions);
            }
        }

        Transition::to(CaptureState::Running)
    }

    /// Publish a re-measured rate and grow the bounded-ahead depth if the
    /// new rate needs more slots in flight
    fn apply_rate_estimate(&mut self, estimate: RateEstimate, actions: &mut TickActions) {
        if let Some(stream) = self.stream.as_mut() {
            stream.rate = estimate.rate;
            if estimate.frame_duration_us < INTERLACED_MIN_FRAME_DURATION_US {
                stream.interlaced = false;
            }
        }
        self.notifications
            .set_microseconds_per_frame(estimate.frame_duration_us);
        actions.wake_synchronizer = true;

        let required = self.required_ahead();
        if required > self.buffers_ahead {
            actions.release_ahead += required - self.buffers_ahead;
            self.buffers_ahead = required;
        }
    }

    /// Bounded-ahead depth for the current rate.
    ///
    /// At get time the injector holds every slot ahead plus the one just
    /// filled, and the ring keeps one slot free, so at most `depth - 2` fit.
    /// Filling needs a successor slot, so at least two are kept ahead.
    fn required_ahead(&self) -> u32 {
        let limit = (self.ring.depth() as u32).saturating_sub(2).max(MIN_BUFFERS_AHEAD);
        self.timing
            .buffers_required_ahead()
            .clamp(MIN_BUFFERS_AHEAD, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode;
    use crate::pipeline::BufferId;
    use crate::window::ScalingState;
    use ancillary::AncillaryConfig;
    use std::collections::HashMap;

    const START: u64 = 1_000_000;
    const PERIOD: u64 = 20_000;

    struct Harness {
        session: CaptureSession,
        stats: Arc<CaptureStats>,
        notifications: Arc<Notifications>,
        ancillary: Arc<AncillaryQueue>,
        scaling: ScalingParams,
        next_id: u64,
        injected: u64,
        // Expected fill time of each slot when it became the fill slot
        fill_times: Vec<(u64, u64)>,
    }

    impl Harness {
        fn new(mode_id: u32) -> Self {
            Self::with_config(mode_id, EngineConfig::default())
        }

        fn with_config(mode_id: u32, config: EngineConfig) -> Self {
            let stats = Arc::new(CaptureStats::default());
            let notifications = Arc::new(Notifications::new());
            let ancillary = Arc::new(AncillaryQueue::new(AncillaryConfig::default()));
            let mut session =
                CaptureSession::new(&config, ancillary.clone(), stats.clone(), notifications.clone());
            let mode = mode::lookup(mode_id).unwrap();
            session.configure_mode(mode);

            let mut scaling = ScalingState::new(2, true, false);
            scaling.configure_mode(mode.active_width, mode.active_height, mode.is_interlaced());

            Self {
                session,
                stats,
                notifications,
                ancillary,
                scaling: scaling.next(),
                next_id: 0,
                injected: 0,
                fill_times: Vec::new(),
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

        fn tick(&mut self, now: u64) -> TickActions {
            let actions = self.session.on_tick(now);
            if let Some(expected) = self.session.current_fill_time() {
                let index = self.session.cursors().next_to_fill;
                if self.fill_times.last().map(|(i, _)| *i) != Some(index) {
                    self.fill_times.push((index, expected));
                }
            }
            for _ in 0..actions.release_ahead {
                self.commit();
            }
            while self.session.take_injectable().is_some() {
                self.injected += 1;
            }
            actions
        }

        /// Warm up to Started, prime the ring and request run.
        /// Returns the time of the next tick.
        fn start(&mut self) -> u64 {
            let permits = self.session.startup().unwrap();
            let mut now = START;
            while self.session.state() != CaptureState::Started {
                self.session.on_tick(now);
                now += PERIOD;
                assert!(now < START + 100 * PERIOD, "warm-up did not finish");
            }
            for _ in 0..=permits {
                self.commit();
            }
            self.session.request_run();
            now
        }
    }

    #[test]
    fn test_startup_requires_mode() {
        let config = EngineConfig::default();
        let mut session = CaptureSession::new(
            &config,
            Arc::new(AncillaryQueue::new(AncillaryConfig::default())),
            Arc::new(CaptureStats::default()),
            Arc::new(Notifications::new()),
        );
        assert!(matches!(session.startup(), Err(CaptureError::NoMode)));
    }

    #[test]
    fn test_configure_mode_sets_depth_and_period() {
        let harness = Harness::new(13);
        // 120 ms transit at 20 ms per frame
        assert_eq!(harness.session.buffers_ahead(), 7);
        assert_eq!(harness.notifications.microseconds_per_frame(), 20_000);
        assert_eq!(harness.session.stream_info().unwrap().width, 1920);
    }

    #[test]
    fn test_buffers_ahead_leaves_room_in_small_ring() {
        for (depth, expected) in [(4, 2), (6, 4), (8, 6), (9, 7), (10, 7)] {
            let config = EngineConfig {
                ring_depth: depth,
                ..Default::default()
            };
            let harness = Harness::with_config(13, config);
            assert_eq!(harness.session.buffers_ahead(), expected, "ring depth {}", depth);
        }
    }

    #[test]
    fn test_short_transit_keeps_two_buffers_ahead() {
        let mut config = EngineConfig::default();
        config.timing.max_player_transit_us = 1000;
        let harness = Harness::with_config(13, config);
        assert_eq!(harness.session.buffers_ahead(), 2);
    }

    #[test]
    fn test_warm_up_reaches_started_on_exact_ticks() {
        let mut harness = Harness::new(13);
        harness.session.startup().unwrap();

        let first = harness.session.on_tick(START);
        assert_eq!(harness.session.state(), CaptureState::WarmingUp);
        assert!(first.resynchronize);

        let mut now = START + PERIOD;
        let mut ticks = 1;
        let mut woke = false;
        let mut first_content = false;
        while harness.session.state() == CaptureState::WarmingUp {
            let actions = harness.session.on_tick(now);
            woke |= actions.wake_injector;
            first_content |= actions.first_content;
            now += PERIOD;
            ticks += 1;
        }

        assert_eq!(harness.session.state(), CaptureState::Started);
        assert_eq!(ticks, harness.session.timing().warm_up_frames() + 1);
        assert!(woke);
        assert!(first_content);
        assert_eq!(harness.stats.snapshot().resynchronizations, 1);
        assert_eq!(harness.session.timing().base_time(), START);
    }

    #[test]
    fn test_started_waits_for_run_request() {
        let mut harness = Harness::new(13);
        let mut now = harness.start();
        assert_eq!(harness.session.state(), CaptureState::MovingToRun);
        assert_eq!(
            harness.session.run_from_time(),
            START + 5 * PERIOD - 8000
        );

        harness.tick(now);
        now += PERIOD;
        assert_eq!(harness.session.state(), CaptureState::Running);

        for _ in 0..10 {
            harness.tick(now);
            now += PERIOD;
        }
        assert!(harness.injected > 0);
        assert_eq!(harness.stats.snapshot().dropped_frames, 0);
    }

    #[test]
    fn test_slots_stamped_one_period_apart() {
        let mut harness = Harness::new(13);
        let mut now = harness.start();
        for _ in 0..40 {
            harness.tick(now);
            now += PERIOD;
        }
        let times: Vec<u64> = harness.fill_times.iter().map(|(_, t)| *t).collect();
        for pair in times.windows(2) {
            assert_eq!(pair[1] - pair[0], PERIOD);
        }
    }

    #[test]
    fn test_stride_mismatch_rejected() {
        let mut harness = Harness::new(13);
        harness.session.startup().unwrap();
        let slot = CaptureSlot {
            buffer: DecodeBuffer {
                id: BufferId(9),
                stride: harness.scaling.bytes_per_line + 64,
            },
            scaling: harness.scaling,
        };
        assert!(matches!(
            harness.session.commit_slot(slot),
            Err(CaptureError::UnexpectedStride { .. })
        ));
        assert_eq!(harness.session.cursors().next_to_get, 0);
    }

    fn run_with_skip(skip: Option<usize>) -> (Vec<(u64, u64)>, u32) {
        let mut harness = Harness::new(13);
        let mut now = harness.start();
        for tick in 0..200 {
            if Some(tick) != skip {
                harness.tick(now);
            }
            now += PERIOD;
        }
        (
            harness.fill_times,
            harness.session.timing().interrupt_frame_count(),
        )
    }

    #[test]
    fn test_skipped_tick_shifts_schedule_by_one_period() {
        let (reference, reference_count) = run_with_skip(None);
        let (skipped, skipped_count) = run_with_skip(Some(120));

        // The lost tick is credited to the interrupt count
        assert_eq!(reference_count, skipped_count);

        let skipped: HashMap<u64, u64> = skipped.into_iter().collect();
        let common: Vec<(u64, u64, u64)> = reference
            .iter()
            .filter_map(|(index, time)| skipped.get(index).map(|other| (*index, *time, *other)))
            .collect();
        let split = common
            .iter()
            .position(|(_, time, other)| time != other)
            .unwrap();
        assert!(split > 100);

        for (index, time, other) in &common[split..] {
            assert_eq!(*other, time + PERIOD, "slot {}", index);
        }
    }

    #[test]
    fn test_missed_tick_and_drop_on_same_tick() {
        let mut harness = Harness::new(13);
        let mut now = harness.start();
        for _ in 0..20 {
            harness.tick(now);
            now += PERIOD;
        }
        let count_before = harness.session.timing().interrupt_frame_count();

        // Starve the ring, then lose a tick
        for _ in 0..8 {
            harness.session.on_tick(now);
            now += PERIOD;
        }
        let dropped_before = harness.stats.snapshot().dropped_frames;
        now += PERIOD;
        harness.session.on_tick(now);

        let snap = harness.stats.snapshot();
        assert_eq!(snap.missed_ticks, 1);
        assert_eq!(snap.dropped_frames, dropped_before + 1);
        let count_after = harness.session.timing().interrupt_frame_count();
        assert_eq!(count_after - count_before, 10);
    }

    #[test]
    fn test_post_mortem_after_consecutive_drops() {
        let mut harness = Harness::new(13);
        let mut rx = harness.notifications.subscribe();
        let mut now = harness.start();
        harness.tick(now);

        let mut woke = false;
        for _ in 0..20 {
            now += PERIOD;
            woke |= harness.session.on_tick(now).wake_synchronizer;
        }
        assert!(woke);
        assert_eq!(harness.notifications.post_mortem(), 1);
        assert_eq!(harness.stats.snapshot().post_mortems, 1);

        harness.notifications.publish_pending();
        let mut seen = false;
        while let Ok(event) = rx.try_recv() {
            seen |= event == crate::stats::NotificationEvent::PostMortem;
        }
        assert!(seen);
    }

    #[test]
    fn test_failed_warm_up_adopts_measured_rate() {
        let mut harness = Harness::new(13);
        harness.session.startup().unwrap();
        let mut now = START;
        while harness.session.state() != CaptureState::Started {
            harness.session.on_tick(now);
            now += 20_100;
            assert!(now < START + 200 * 20_100);
        }

        let timing = harness.session.timing();
        assert_eq!(timing.warm_up_attempts(), 4);
        assert!(!timing.is_standard_rate());
        assert_eq!(timing.frame_duration_us(), 20_100);
        assert_eq!(harness.notifications.microseconds_per_frame(), 20_100);
        assert_eq!(harness.stats.snapshot().resynchronizations, 4);
    }

    #[test]
    fn test_ancillary_data_stamped_with_fill_time() {
        let mut harness = Harness::new(13);
        harness.ancillary.request_buffers(2, 256).unwrap();
        harness.ancillary.queue_buffer(0).unwrap();
        harness.ancillary.stream_on().unwrap();

        let mut now = harness.start();
        // First running tick arms the capture
        harness.tick(now);
        now += PERIOD;

        let expected = harness.session.current_fill_time().unwrap();
        let mut packet = vec![0x5a; 18];
        packet[3] = 3;
        harness.ancillary.hardware_write(&packet);
        harness.tick(now);

        assert_eq!(harness.stats.snapshot().ancillary_fills, 1);
        let info = harness.ancillary.query_buffer(0).unwrap();
        assert_eq!(info.bytes, 32);
        assert_eq!(info.fill_time, expected);
    }

    #[test]
    fn test_halt_goes_inactive_on_next_tick() {
        let mut harness = Harness::new(13);
        let mut now = harness.start();
        for _ in 0..5 {
            harness.tick(now);
            now += PERIOD;
        }
        harness.session.halt();
        assert_eq!(harness.session.state(), CaptureState::MovingToInactive);
        harness.session.on_tick(now);
        assert_eq!(harness.session.state(), CaptureState::Inactive);

        let left = harness.session.drain_uninjected();
        assert_eq!(left.len() as u64, harness.next_id - harness.injected);
    }
}
