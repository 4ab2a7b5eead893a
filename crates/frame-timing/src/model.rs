//! Frame timing model
//!
//! Owns the base time and frame counters that every expected fill time is
//! derived from, and the integration state used to refine the frame period
//! while capture is running.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::history::{IntegrationHistory, IntegrationRecord};
use crate::rate::{
    corrected_time, matches_frame_time, FrameRate, RateEstimate, CANONICAL_RATES,
    CORRECTION_FRACTION_BITS, CORRECTION_ONE, ONE_PPM,
};
use crate::TimingError;

/// Frame period above which the low-rate warm-up profile applies
const LOW_RATE_FRAME_DURATION_US: u64 = 20_000;

/// Timing model configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    /// Largest supported source clock error in parts per million
    pub max_clock_error_ppm: u64,
    /// Warm-up re-anchoring attempts before the rate is re-measured
    pub warm_up_tries: u32,
    /// Warm-up ticks at frame periods above 20 ms
    pub warm_up_frames_low_rate: u32,
    /// Warm-up ticks at higher rates, and after a failed warm-up
    pub warm_up_frames_high_rate: u32,
    /// Frames between the base time and the first scheduled fill, low rates
    pub lead_in_frames_low_rate: u32,
    /// Frames between the base time and the first scheduled fill, high rates
    pub lead_in_frames_high_rate: u32,
    /// Shortest integration window in ticks
    pub min_integration_frames: u32,
    /// Longest integration window in ticks
    pub max_integration_frames: u32,
    /// Completed windows remembered for long-term averaging
    pub integration_history_depth: usize,
    /// Tick lateness beyond one period that marks a tick as jittered
    pub max_frame_jitter_us: u64,
    /// Historic disagreement that discards all history, in PPM
    pub step_change_threshold_ppm: u64,
    /// Disagreement of two windows in the same direction that discards all
    /// but the latest, in PPM
    pub sustained_change_threshold_ppm: u64,
    /// Worst-case time from injection to presentation downstream
    pub max_player_transit_us: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            max_clock_error_ppm: 200,
            warm_up_tries: 4,
            warm_up_frames_low_rate: 16,
            warm_up_frames_high_rate: 32,
            lead_in_frames_low_rate: 2,
            lead_in_frames_high_rate: 4,
            min_integration_frames: 32,
            max_integration_frames: 2048,
            integration_history_depth: 4,
            max_frame_jitter_us: 1000,
            step_change_threshold_ppm: 8,
            sustained_change_threshold_ppm: 1,
            max_player_transit_us: 120_000,
        }
    }
}

impl TimingConfig {
    /// Reject values the model cannot operate with
    pub fn validate(&self) -> Result<(), TimingError> {
        fn check(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), TimingError> {
            if value < min || value > max {
                return Err(TimingError::OutOfRange {
                    field,
                    value,
                    min,
                    max,
                });
            }
            Ok(())
        }

        check("max_clock_error_ppm", self.max_clock_error_ppm, 1, 10_000)?;
        check("warm_up_tries", u64::from(self.warm_up_tries), 1, 64)?;
        check("warm_up_frames_low_rate", u64::from(self.warm_up_frames_low_rate), 2, 1024)?;
        check("warm_up_frames_high_rate", u64::from(self.warm_up_frames_high_rate), 2, 1024)?;
        check("lead_in_frames_low_rate", u64::from(self.lead_in_frames_low_rate), 0, 64)?;
        check("lead_in_frames_high_rate", u64::from(self.lead_in_frames_high_rate), 0, 64)?;
        check("min_integration_frames", u64::from(self.min_integration_frames), 2, 1 << 16)?;
        check(
            "max_integration_frames",
            u64::from(self.max_integration_frames),
            u64::from(self.min_integration_frames),
            1 << 20,
        )?;
        check("integration_history_depth", self.integration_history_depth as u64, 2, 64)?;
        check("max_player_transit_us", self.max_player_transit_us, 1, 10_000_000)?;
        Ok(())
    }
}

/// Result of one warm-up tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WarmUpStep {
    /// The base time was re-anchored on this tick
    pub resynchronized: bool,
    /// Warm-up has seen enough ticks
    pub finished: bool,
    /// Set when warm-up gave up re-anchoring and re-measured the rate
    pub estimate: Option<RateEstimate>,
}

/// Result of one running-tick integration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integration {
    /// Not enough clean ticks yet
    Pending,
    /// The correction factor was recomputed
    Corrected { correction: u64, change: i64 },
    /// Running at a non-standard rate; the rate was re-measured and the
    /// schedule rebased on the current tick
    RateReset(RateEstimate),
}

/// Clock-recovery state for one capture session
#[derive(Debug, Clone)]
pub struct TimingModel {
    config: TimingConfig,
    rate: FrameRate,
    standard_rate: bool,

    base_time: u64,
    frame_count: i64,
    lead_in_frames: u32,
    warm_up_frames: u32,
    warm_up_attempts: u32,

    interrupt_frame_count: u32,
    time_at_zero_count: u64,
    time_of_last_tick: u64,

    correction: u64,
    total_elapsed_us: u64,
    total_frames: u32,
    history: IntegrationHistory,
    integrate_for_at_least: u32,

    current_drift_error: i64,
    last_frame_drift_error: i64,
    last_drift_correction: i64,
    drift_frame_count: i64,
}

impl TimingModel {
    pub fn new(config: TimingConfig, rate: FrameRate) -> Self {
        let history = IntegrationHistory::new(config.integration_history_depth);
        let integrate_for_at_least = config.min_integration_frames;
        let mut model = Self {
            config,
            rate,
            standard_rate: true,
            base_time: 0,
            frame_count: 0,
            lead_in_frames: 0,
            warm_up_frames: 0,
            warm_up_attempts: 0,
            interrupt_frame_count: 0,
            time_at_zero_count: 0,
            time_of_last_tick: 0,
            correction: CORRECTION_ONE,
            total_elapsed_us: 0,
            total_frames: 0,
            history,
            integrate_for_at_least,
            current_drift_error: 0,
            last_frame_drift_error: 0,
            last_drift_correction: 0,
            drift_frame_count: 0,
        };
        model.select_profile();
        model
    }

    /// Adopt the nominal rate of a newly selected mode
    pub fn set_nominal_rate(&mut self, rate: FrameRate) {
        self.rate = rate;
        self.standard_rate = true;
        self.select_profile();
    }

    /// Pick warm-up length and lead-in from the nominal frame period
    pub fn select_profile(&mut self) {
        if self.frame_duration_us() > LOW_RATE_FRAME_DURATION_US {
            self.warm_up_frames = self.config.warm_up_frames_low_rate;
            self.lead_in_frames = self.config.lead_in_frames_low_rate;
        } else {
            self.force_extended_warm_up();
        }
    }

    /// Use the longer warm-up profile regardless of rate
    pub fn force_extended_warm_up(&mut self) {
        self.warm_up_frames = self.config.warm_up_frames_high_rate;
        self.lead_in_frames = self.config.lead_in_frames_high_rate;
    }

    /// Clear all schedule and integration state ahead of a new sequence
    pub fn reset(&mut self) {
        self.base_time = 0;
        self.frame_count = 0;
        self.warm_up_attempts = 0;
        self.interrupt_frame_count = 0;
        self.time_at_zero_count = 0;
        self.correction = CORRECTION_ONE;
        self.total_elapsed_us = 0;
        self.total_frames = 0;
        self.history.clear();
        self.integrate_for_at_least = self.config.min_integration_frames;
        self.reset_drift();
    }

    fn reset_drift(&mut self) {
        self.current_drift_error = 0;
        self.last_frame_drift_error = 0;
        self.last_drift_correction = 0;
        self.drift_frame_count = 0;
    }

    pub fn config(&self) -> &TimingConfig {
        &self.config
    }

    pub fn rate(&self) -> FrameRate {
        self.rate
    }

    pub fn is_standard_rate(&self) -> bool {
        self.standard_rate
    }

    pub fn base_time(&self) -> u64 {
        self.base_time
    }

    pub fn frame_count(&self) -> i64 {
        self.frame_count
    }

    pub fn lead_in_frames(&self) -> u32 {
        self.lead_in_frames
    }

    pub fn warm_up_frames(&self) -> u32 {
        self.warm_up_frames
    }

    pub fn warm_up_attempts(&self) -> u32 {
        self.warm_up_attempts
    }

    pub fn interrupt_frame_count(&self) -> u32 {
        self.interrupt_frame_count
    }

    pub fn correction(&self) -> u64 {
        self.correction
    }

    pub fn current_drift_error(&self) -> i64 {
        self.current_drift_error
    }

    pub fn history(&self) -> &IntegrationHistory {
        &self.history
    }

    pub fn time_for_frames(&self, frames: u64) -> u64 {
        self.rate.time_for_frames(frames)
    }

    pub fn frame_duration_us(&self) -> u64 {
        self.rate.frame_duration_us()
    }

    /// Nominal time for `frames` frames scaled by the correction factor
    pub fn corrected_time_for_frames(&self, frames: u64) -> u64 {
        corrected_time(self.time_for_frames(frames), self.correction)
    }

    /// Whether the correction factor lies inside the supported clock error band
    pub fn correction_in_band(&self) -> bool {
        let band = self.config.max_clock_error_ppm * ONE_PPM;
        self.correction >= CORRECTION_ONE - band && self.correction <= CORRECTION_ONE + band
    }

    /// Bounded-ahead depth needed to cover the downstream transit time
    pub fn buffers_required_ahead(&self) -> u32 {
        (self.config.max_player_transit_us / self.frame_duration_us().max(1) + 1) as u32
    }

    /// Earliest time the first scheduled frame may be captured
    pub fn run_from_time(&self, allowance_us: u64) -> u64 {
        (self.base_time + self.time_for_frames(u64::from(self.lead_in_frames) + 1))
            .saturating_sub(allowance_us)
    }

    /// Count a source tick
    pub fn begin_tick(&mut self) {
        self.interrupt_frame_count = self.interrupt_frame_count.wrapping_add(1);
    }

    /// Record the tick time for jitter and missed-tick detection
    pub fn finish_tick(&mut self, now: u64) {
        self.time_of_last_tick = now;
    }

    /// Anchor a provisional base time one frame ahead of `now`
    pub fn anchor(&mut self, now: u64) {
        self.base_time = now + self.frame_duration_us();
        self.interrupt_frame_count = 0;
        self.warm_up_attempts = 0;
    }

    /// Validate the tick against the base time extrapolated from the tick count
    pub fn warm_up_tick(&mut self, now: u64) -> WarmUpStep {
        let mut step = WarmUpStep::default();

        let elapsed = u64::from(self.interrupt_frame_count);
        let estimated_base = now.saturating_sub(self.corrected_time_for_frames(elapsed));
        let range = 1 + (self.time_for_frames(elapsed) * self.config.max_clock_error_ppm) / 1_000_000;
        let in_range = self.base_time >= estimated_base.saturating_sub(range)
            && self.base_time <= estimated_base + range;

        if !in_range && self.warm_up_attempts < self.config.warm_up_tries {
            debug!(
                "Warm-up re-anchor {} (base {} expected {} +/- {})",
                self.warm_up_attempts, self.base_time, estimated_base, range
            );
            self.base_time = now;
            self.interrupt_frame_count = 0;
            self.time_at_zero_count = now;
            self.warm_up_attempts += 1;
            step.resynchronized = true;
        }

        if self.interrupt_frame_count < self.warm_up_frames {
            return step;
        }

        if self.warm_up_attempts >= self.config.warm_up_tries {
            warn!(
                "Warm-up failed after {} attempts, re-measuring frame rate",
                self.warm_up_attempts
            );
            let elapsed_us = now.saturating_sub(self.base_time);
            step.estimate = self.estimate_rate(elapsed_us, self.interrupt_frame_count);
            self.force_extended_warm_up();
        }

        self.integrate_for_at_least = self.config.min_integration_frames;
        step.finished = true;
        step
    }

    /// Derive a rate from raw tick timing, snapping to a canonical rate
    /// when within tolerance.
    ///
    /// A measured period that matches nothing and differs from the current
    /// non-standard rate is adopted as a raw microsecond rate; integration
    /// history and drift restart from scratch. An unchanged non-standard
    /// period is promoted to standard.
    pub fn estimate_rate(&mut self, elapsed_us: u64, frames: u32) -> Option<RateEstimate> {
        if frames == 0 {
            return None;
        }
        let frames = u64::from(frames);
        let frame_duration_us = (elapsed_us + frames / 2) / frames;
        let ppm = self.config.max_clock_error_ppm;

        self.standard_rate = true;
        if let Some(canonical) = CANONICAL_RATES
            .iter()
            .find(|c| matches_frame_time(frame_duration_us, c.frame_duration_us, ppm))
        {
            self.rate = canonical.rate;
        } else if self.rate != FrameRate::new(1_000_000, frame_duration_us) {
            self.standard_rate = false;
            self.rate = FrameRate::new(1_000_000, frame_duration_us.max(1));
            self.correction = CORRECTION_ONE;
            self.total_elapsed_us = 0;
            self.total_frames = 0;
            self.history.clear();
            self.reset_drift();
        }

        if self.standard_rate {
            info!(
                "Frame rate {} ({:.3} fps) from {} us per frame",
                self.rate,
                self.rate.fps(),
                frame_duration_us
            );
        } else {
            warn!("Non-standard frame period {} us adopted", frame_duration_us);
        }

        Some(RateEstimate {
            frame_duration_us,
            rate: self.rate,
            standard: self.standard_rate,
        })
    }

    /// Credit ticks the source delivered while we were not looking.
    ///
    /// Returns the number of ticks added to the interrupt count.
    pub fn compensate_missed_ticks(&mut self, now: u64) -> u32 {
        let frame = self.frame_duration_us().max(1);
        let since_last = now.saturating_sub(self.time_of_last_tick);
        let interrupts = (since_last + frame / 2) / frame;
        if interrupts > 1 {
            let missed = (interrupts - 1) as u32;
            self.interrupt_frame_count = self.interrupt_frame_count.wrapping_add(missed);
            return missed;
        }
        0
    }

    /// Move the base time forward, used when fills fall whole frames behind
    pub fn shift_base(&mut self, delta_us: u64) {
        self.base_time += delta_us;
    }

    /// Allocate the next frame slot in the schedule and return its expected
    /// fill time.
    ///
    /// The drift correction is spread over successive frames and folded
    /// into the base time at the next integration. Once the elapsed time
    /// from the base grows past 2^31 us the schedule rebases itself.
    pub fn schedule_frame(&mut self) -> u64 {
        let frames = (self.frame_count + i64::from(self.lead_in_frames)).max(0) as u64;
        let elapsed = self.corrected_time_for_frames(frames);

        self.drift_frame_count += 1;
        self.last_drift_correction = -(self.current_drift_error * self.drift_frame_count)
            / (2 * i64::from(self.config.max_integration_frames));

        let expected = (self.base_time as i64 + elapsed as i64 + self.last_drift_correction) as u64;

        if elapsed >= 1 << 31 {
            self.drift_frame_count = 0;
            self.last_drift_correction = 0;
            self.base_time = expected;
            self.frame_count = -i64::from(self.lead_in_frames);
        }

        self.frame_count += 1;
        expected
    }

    /// Feed one running tick into the integration.
    ///
    /// `drift_error` is the expected fill time of the slot now being filled
    /// minus `now`. When the rate has to be re-measured, `rebase_pending` is
    /// handed the new rate and `now`; it re-times every scheduled but
    /// unfilled slot and returns how many there are.
    pub fn integrate<F>(&mut self, now: u64, drift_error: i64, rebase_pending: F) -> Integration
    where
        F: FnOnce(&FrameRate, u64) -> u64,
    {
        let frame = self.frame_duration_us();
        let jittered =
            now.saturating_sub(self.time_of_last_tick) > frame + self.config.max_frame_jitter_us;

        if self.interrupt_frame_count < self.integrate_for_at_least
            || (self.interrupt_frame_count < 2 * self.integrate_for_at_least && jittered)
        {
            if !jittered {
                self.last_frame_drift_error = drift_error;
            }
            return Integration::Pending;
        }

        let mut outcome = Integration::Pending;
        let updating = self.standard_rate;
        let mut new_totals = None;

        if updating {
            let (totals, change) = self.recompute_correction(now);
            new_totals = Some(totals);
            outcome = Integration::Corrected {
                correction: self.correction,
                change,
            };
        }

        if !self.correction_in_band() {
            warn!(
                "Correction factor {:.9} outside supported clock error, marking frame rate invalid",
                self.correction as f64 / CORRECTION_ONE as f64
            );
            self.standard_rate = false;
        }

        if !self.standard_rate {
            let elapsed_us = now.saturating_sub(self.time_at_zero_count);
            let estimate = self.estimate_rate(elapsed_us, self.interrupt_frame_count);

            self.correction = CORRECTION_ONE;
            self.total_elapsed_us = 0;
            self.total_frames = 0;
            self.history.clear();
            self.interrupt_frame_count = 0;
            self.time_at_zero_count = now;
            self.integrate_for_at_least = self.config.min_integration_frames / 2;

            let pending = rebase_pending(&self.rate, now);
            self.frame_count = pending as i64 - i64::from(self.lead_in_frames);
            self.base_time = now;

            if let Some(estimate) = estimate {
                outcome = Integration::RateReset(estimate);
            }
        }

        self.current_drift_error = if drift_error.abs() < self.last_frame_drift_error.abs() {
            drift_error
        } else {
            self.last_frame_drift_error
        };
        self.base_time = (self.base_time as i64 + self.last_drift_correction) as u64;
        self.drift_frame_count = 0;
        self.last_drift_correction = 0;

        let drift_limit =
            (self.time_for_frames(u64::from(self.config.max_integration_frames)) / 500_000) as i64;
        self.current_drift_error = self.current_drift_error.clamp(-drift_limit, drift_limit);

        debug!(
            "Correction {:.9} over {} ticks, {} windows, drift {} ({} / {})",
            self.correction as f64 / CORRECTION_ONE as f64,
            self.interrupt_frame_count,
            self.history.len(),
            self.current_drift_error,
            drift_error,
            self.last_frame_drift_error
        );

        if self.integrate_for_at_least >= self.config.max_integration_frames {
            if let Some((elapsed_us, frames)) = new_totals {
                self.total_elapsed_us = elapsed_us;
                self.total_frames = frames;
                self.history.push(IntegrationRecord {
                    elapsed_us: now.saturating_sub(self.time_at_zero_count),
                    frames: self.interrupt_frame_count,
                });
            }
            self.interrupt_frame_count = 0;
            self.time_at_zero_count = now;
            self.integrate_for_at_least = self.config.max_integration_frames;
        } else {
            self.integrate_for_at_least *= 2;
        }

        outcome
    }

    /// Blend the current window with history into a new correction factor.
    ///
    /// Returns the new running totals and the signed change. The base time
    /// moves by the change's effect on frames already scheduled, so their
    /// expected fill times stay put.
    fn recompute_correction(&mut self, now: u64) -> ((u64, u32), i64) {
        let window_elapsed = now.saturating_sub(self.time_at_zero_count);
        let step_threshold = self.config.step_change_threshold_ppm * ONE_PPM;
        let sustained_threshold = self.config.sustained_change_threshold_ppm * ONE_PPM;

        let mut recent = (0u64, false);
        if !self.history.is_empty() {
            recent = self.difference_from_correction(
                window_elapsed,
                u64::from(self.interrupt_frame_count),
            );
            if recent.0 > step_threshold {
                self.total_elapsed_us = 0;
                self.total_frames = 0;
                self.history.clear();
            }
        }

        if self.history.len() > 1 {
            if let Some(latest) = self.history.latest() {
                let previous =
                    self.difference_from_correction(latest.elapsed_us, u64::from(latest.frames));
                if recent.0 > sustained_threshold
                    && previous.0 > sustained_threshold
                    && recent.1 == previous.1
                {
                    self.total_elapsed_us = latest.elapsed_us;
                    self.total_frames = latest.frames;
                    self.history.retain_latest();
                }
            }
        }

        let (new_elapsed, new_frames) = loop {
            let new_elapsed = self.total_elapsed_us + window_elapsed;
            let new_frames = self.total_frames + self.interrupt_frame_count;
            let overflow_likely = new_elapsed >= 1 << (64 - CORRECTION_FRACTION_BITS)
                || self.time_for_frames(u64::from(new_frames)) > u64::from(u32::MAX);
            let throw = overflow_likely || self.history.len() + 1 >= self.history.depth();
            if !throw {
                break (new_elapsed, new_frames);
            }
            match self.history.pop_oldest() {
                Some(oldest) => {
                    self.total_elapsed_us = self.total_elapsed_us.saturating_sub(oldest.elapsed_us);
                    self.total_frames = self.total_frames.saturating_sub(oldest.frames);
                }
                None => break (new_elapsed, new_frames),
            }
        };

        let nominal = self.time_for_frames(u64::from(new_frames)).max(1);
        let new_correction =
            ((u128::from(new_elapsed) << CORRECTION_FRACTION_BITS) / u128::from(nominal)) as u64;
        let change = new_correction as i64 - self.correction as i64;
        self.correction = new_correction;

        let scheduled = (self.frame_count + i64::from(self.lead_in_frames)).max(0) as u64;
        let affect = ((u128::from(self.time_for_frames(scheduled)) * u128::from(change.unsigned_abs()))
            >> CORRECTION_FRACTION_BITS) as u64;
        if change < 0 {
            self.base_time += affect;
        } else {
            self.base_time = self.base_time.saturating_sub(affect);
        }

        ((new_elapsed, new_frames), change)
    }

    /// Magnitude and sign (true when below) of a window's implied factor
    /// relative to the current correction
    fn difference_from_correction(&self, elapsed_us: u64, frames: u64) -> (u64, bool) {
        let nominal = self.time_for_frames(frames).max(1);
        let implied = ((u128::from(elapsed_us) << CORRECTION_FRACTION_BITS) / u128::from(nominal)) as u64;
        let below = implied < self.correction;
        (implied.abs_diff(self.correction), below)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const START: u64 = 1_000_000;

    /// Anchor and run warm-up with ticks at the given times, returning the
    /// number of ticks consumed to finish
    fn warm_up(model: &mut TimingModel, ticks: &mut impl Iterator<Item = u64>) -> Option<usize> {
        model.reset();
        let mut consumed = 0;
        for now in ticks {
            consumed += 1;
            model.begin_tick();
            if consumed == 1 {
                model.anchor(now);
            }
            let step = model.warm_up_tick(now);
            model.finish_tick(now);
            if step.finished {
                return Some(consumed);
            }
        }
        None
    }

    fn periodic(start: u64, period: f64) -> impl Iterator<Item = u64> {
        (0u64..).map(move |k| start + (k as f64 * period).round() as u64)
    }

    #[test]
    fn test_profile_selection() {
        let model = TimingModel::new(TimingConfig::default(), FrameRate::new(25, 1));
        assert_eq!(model.warm_up_frames(), 16);
        assert_eq!(model.lead_in_frames(), 2);

        let model = TimingModel::new(TimingConfig::default(), FrameRate::new(50, 1));
        assert_eq!(model.warm_up_frames(), 32);
        assert_eq!(model.lead_in_frames(), 4);
    }

    #[test]
    fn test_first_warm_up_tick_resynchronizes() {
        let mut model = TimingModel::new(TimingConfig::default(), FrameRate::new(50, 1));
        model.reset();
        model.begin_tick();
        model.anchor(START);
        let step = model.warm_up_tick(START);
        assert!(step.resynchronized);
        assert_eq!(model.base_time(), START);
        assert_eq!(model.warm_up_attempts(), 1);
    }

    #[test]
    fn test_warm_up_converges_on_clean_source() {
        let mut model = TimingModel::new(TimingConfig::default(), FrameRate::new(60000, 1001));
        let consumed = warm_up(&mut model, &mut periodic(START, 1_000_000.0 * 1001.0 / 60000.0));
        assert_eq!(consumed, Some(33));
        assert_eq!(model.warm_up_attempts(), 1);
        assert!(model.is_standard_rate());
    }

    #[test]
    fn test_warm_up_failure_remeasures_rate() {
        // Mode claims 60 fps, source runs at 25 fps
        let mut model = TimingModel::new(TimingConfig::default(), FrameRate::new(60, 1));
        let mut ticks = periodic(START, 40_000.0);
        let mut last = WarmUpStep::default();
        model.reset();
        for (i, now) in (&mut ticks).enumerate().take(200) {
            model.begin_tick();
            if i == 0 {
                model.anchor(now);
            }
            last = model.warm_up_tick(now);
            model.finish_tick(now);
            if last.finished {
                break;
            }
        }
        assert!(last.finished);
        assert_eq!(model.warm_up_attempts(), 4);
        let estimate = last.estimate.expect("rate re-measured");
        assert_eq!(estimate.rate, FrameRate::new(25, 1));
        assert!(estimate.standard);
        assert_eq!(model.warm_up_frames(), 32);
    }

    #[test]
    fn test_estimate_rate_non_standard_then_promoted() {
        let mut model = TimingModel::new(TimingConfig::default(), FrameRate::new(50, 1));
        let estimate = model.estimate_rate(18_000 * 100, 100).unwrap();
        assert!(!estimate.standard);
        assert_eq!(model.rate(), FrameRate::new(1_000_000, 18_000));

        // Same period again becomes the new standard
        let estimate = model.estimate_rate(18_000 * 100, 100).unwrap();
        assert!(estimate.standard);
        assert_eq!(model.rate(), FrameRate::new(1_000_000, 18_000));
    }

    #[test]
    fn test_estimate_rate_zero_frames() {
        let mut model = TimingModel::new(TimingConfig::default(), FrameRate::new(50, 1));
        assert!(model.estimate_rate(1000, 0).is_none());
    }

    #[test]
    fn test_missed_tick_compensation() {
        let mut model = TimingModel::new(TimingConfig::default(), FrameRate::new(50, 1));
        model.finish_tick(START);
        let before = model.interrupt_frame_count();
        assert_eq!(model.compensate_missed_ticks(START + 20_000), 0);
        assert_eq!(model.compensate_missed_ticks(START + 60_500), 2);
        assert_eq!(model.interrupt_frame_count(), before + 2);
    }

    #[test]
    fn test_schedule_frame_advances_by_period() {
        let mut model = TimingModel::new(TimingConfig::default(), FrameRate::new(50, 1));
        model.reset();
        model.begin_tick();
        model.anchor(START);
        model.warm_up_tick(START);
        let first = model.schedule_frame();
        let second = model.schedule_frame();
        assert_eq!(first, START + 4 * 20_000);
        assert_eq!(second - first, 20_000);
        assert_eq!(model.frame_count(), 2);
    }

    #[test]
    fn test_schedule_frame_rebases_after_long_run() {
        let mut model = TimingModel::new(TimingConfig::default(), FrameRate::new(50, 1));
        model.reset();
        model.anchor(START);
        let mut previous = model.schedule_frame();
        for _ in 0..120_000 {
            let next = model.schedule_frame();
            assert_eq!(next - previous, 20_000);
            previous = next;
        }
        assert!(model.frame_count() < 120_000);
    }

    /// Warm up on a source whose period is `ppm` away from nominal, then
    /// integrate one window
    fn run_window(ppm: f64) -> (TimingModel, Integration) {
        let mut model = TimingModel::new(TimingConfig::default(), FrameRate::new(60, 1));
        let period = 1_000_000.0 / 60.0 * (1.0 + ppm / 1_000_000.0);
        let mut ticks = periodic(START, period);
        warm_up(&mut model, &mut ticks).unwrap();

        let mut outcome = Integration::Pending;
        for now in ticks.take(40) {
            model.begin_tick();
            model.compensate_missed_ticks(now);
            outcome = model.integrate(now, 0, |_, _| 0);
            model.finish_tick(now);
            if outcome != Integration::Pending {
                break;
            }
        }
        (model, outcome)
    }

    #[test]
    fn test_small_clock_error_is_tracked() {
        let (model, outcome) = run_window(60.0);
        assert!(matches!(outcome, Integration::Corrected { .. }));
        assert!(model.is_standard_rate());
        assert!(model.correction_in_band());
        assert!(model.correction() > CORRECTION_ONE);
    }

    #[test]
    fn test_out_of_band_clock_marks_rate_non_standard() {
        let mut model = TimingModel::new(TimingConfig::default(), FrameRate::new(60, 1));
        let mut ticks = periodic(START, 1_000_000.0 / 60.0);
        assert_eq!(warm_up(&mut model, &mut ticks), Some(33));

        // 33 ticks spanning 550.7 ms instead of 550 ms is ~1270 PPM fast
        let now = START + 550_700;
        model.begin_tick();
        let outcome = model.integrate(now, 0, |_, _| 0);
        assert!(matches!(outcome, Integration::RateReset(e) if !e.standard));
        assert_eq!(model.rate(), FrameRate::new(1_000_000, 16688));
        assert!(!model.is_standard_rate());
        assert_eq!(model.correction(), CORRECTION_ONE);
        assert_eq!(model.interrupt_frame_count(), 0);
    }

    #[test]
    fn test_rate_reset_rebases_pending_frames() {
        let mut model = TimingModel::new(TimingConfig::default(), FrameRate::new(60, 1));
        let mut ticks = periodic(START, 1_000_000.0 / 60.0 * 1.0006);
        warm_up(&mut model, &mut ticks).unwrap();
        let mut rebased_at = None;
        for now in ticks.take(40) {
            model.begin_tick();
            let outcome = model.integrate(now, 0, |_, at| {
                rebased_at = Some(at);
                3
            });
            model.finish_tick(now);
            if matches!(outcome, Integration::RateReset(_)) {
                break;
            }
        }
        let at = rebased_at.expect("rebase requested");
        assert_eq!(model.base_time(), at);
        assert_eq!(model.frame_count(), 3 - i64::from(model.lead_in_frames()));
    }

    #[test]
    fn test_jittered_tick_defers_integration() {
        let mut model = TimingModel::new(TimingConfig::default(), FrameRate::new(50, 1));
        let mut ticks = periodic(START, 20_000.0);
        warm_up(&mut model, &mut ticks).unwrap();
        let last = START + 32 * 20_000;
        // One tick arrives two frames late
        let now = last + 40_000;
        model.begin_tick();
        assert_eq!(model.integrate(now, 0, |_, _| 0), Integration::Pending);
    }

    #[test]
    fn test_exact_source_keeps_unity_correction() {
        let mut model = TimingModel::new(TimingConfig::default(), FrameRate::new(50, 1));
        let mut ticks = periodic(START, 20_000.0);
        warm_up(&mut model, &mut ticks).unwrap();
        for now in ticks.take(5000) {
            model.begin_tick();
            model.integrate(now, 0, |_, _| 0);
            model.finish_tick(now);
        }
        assert_eq!(model.correction(), CORRECTION_ONE);
        assert!(!model.history().is_empty());
    }

    proptest! {
        #[test]
        fn prop_warm_up_reaches_started(ppm in -100.0f64..100.0, rate_index in 0usize..8) {
            let rate = CANONICAL_RATES[rate_index].rate;
            let mut model = TimingModel::new(TimingConfig::default(), rate);
            let period = 1_000_000.0 * rate.denominator as f64 / rate.numerator as f64
                * (1.0 + ppm / 1_000_000.0);
            let consumed = warm_up(&mut model, &mut periodic(START, period));
            prop_assert_eq!(consumed, Some(model.warm_up_frames() as usize + 1));
            prop_assert!(model.warm_up_attempts() < model.config().warm_up_tries);
        }

        #[test]
        fn prop_correction_stays_in_band(ppm in -400.0f64..400.0) {
            let (model, _) = run_window(ppm);
            prop_assert!(model.correction_in_band());
        }
    }
}
