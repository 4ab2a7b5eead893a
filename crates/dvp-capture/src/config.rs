//! Capture engine configuration

use ancillary::AncillaryConfig;
use frame_timing::TimingConfig;
use serde::{Deserialize, Serialize};

use crate::error::CaptureError;

/// How output window changes reach the downstream display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CropTransition {
    /// Apply at once, without waiting for a tick
    Immediate,
    /// Apply on the next injected frame
    SingleStep,
    /// Interpolate over this many injected frames
    StepOverVsyncs(u32),
}

/// Capture engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Clock recovery parameters
    pub timing: TimingConfig,

    /// Ancillary pool limits
    pub ancillary: AncillaryConfig,

    /// Decode ring depth in slots
    pub ring_depth: usize,

    /// End-to-end latency the display runs behind capture (us)
    pub video_latency_us: u64,

    /// Latency already accounted for by the capture path (us)
    pub capture_latency_us: u64,

    /// Lock the output vsync to the source
    pub vsync_lock: bool,

    /// Interlaced sources deliver the top field first
    pub top_field_first: bool,

    /// How early before the first scheduled frame running may begin (us)
    pub run_from_allowance_us: u64,

    /// Consecutive dropped frames that raise a post-mortem
    pub post_mortem_missed_frames: u32,

    /// Synchronizer aims this far ahead of the vsync phase (us)
    pub sync_early_margin_us: u64,

    /// A synchronize finishing later than this after its target is retried (us)
    pub sync_late_threshold_us: u64,

    /// Final approach to a synchronize point is spun rather than slept (us)
    pub sync_spin_window_us: u64,

    /// Time allowed for the downstream to drain at stream end (ms)
    pub drain_timeout_ms: u64,

    /// Allow horizontal downscaling
    pub horizontal_resize: bool,

    /// Allow vertical downscaling
    pub vertical_resize: bool,

    /// Bytes per pixel of the capture surface
    pub bytes_per_pixel: u32,

    /// Output window change policy
    pub crop_transition: CropTransition,

    /// Pixel aspect ratio reported downstream (numerator, denominator)
    pub pixel_aspect_ratio: (u32, u32),
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timing: TimingConfig::default(),
            ancillary: AncillaryConfig::default(),
            ring_depth: 32,
            video_latency_us: 80_000,
            capture_latency_us: 80_000,
            vsync_lock: true,
            top_field_first: false,
            run_from_allowance_us: 8000,
            post_mortem_missed_frames: 4,
            sync_early_margin_us: 32,
            sync_late_threshold_us: 128,
            sync_spin_window_us: 2000,
            drain_timeout_ms: 1000,
            horizontal_resize: true,
            vertical_resize: false,
            bytes_per_pixel: 2,
            crop_transition: CropTransition::SingleStep,
            pixel_aspect_ratio: (1, 1),
        }
    }
}

impl EngineConfig {
    /// Short transit and fast window changes for interactive sources
    pub fn low_latency() -> Self {
        Self {
            timing: TimingConfig {
                max_player_transit_us: 60_000,
                ..Default::default()
            },
            video_latency_us: 40_000,
            capture_latency_us: 40_000,
            crop_transition: CropTransition::Immediate,
            ..Default::default()
        }
    }

    /// Longer warm-up and smooth window changes for unstable sources
    pub fn robust() -> Self {
        Self {
            timing: TimingConfig {
                warm_up_tries: 8,
                max_player_transit_us: 200_000,
                ..Default::default()
            },
            post_mortem_missed_frames: 16,
            drain_timeout_ms: 3000,
            crop_transition: CropTransition::StepOverVsyncs(8),
            ..Default::default()
        }
    }

    /// Latency added to expected fill times to form presentation times
    pub fn applied_latency_us(&self) -> u64 {
        self.video_latency_us.saturating_sub(self.capture_latency_us)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<(), CaptureError> {
        fn check(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), CaptureError> {
            if value < min || value > max {
                return Err(CaptureError::OutOfRange {
                    field,
                    value,
                    min,
                    max,
                });
            }
            Ok(())
        }

        self.timing.validate()?;
        check("ring_depth", self.ring_depth as u64, 4, 256)?;
        check("bytes_per_pixel", u64::from(self.bytes_per_pixel), 1, 4)?;
        check("sync_spin_window_us", self.sync_spin_window_us, 0, 20_000)?;
        check(
            "ancillary.max_buffers",
            self.ancillary.max_buffers as u64,
            self.ancillary.min_buffers.max(1) as u64,
            1024,
        )?;
        check(
            "ancillary.max_buffer_size",
            self.ancillary.max_buffer_size as u64,
            self.ancillary.min_buffer_size.max(1) as u64,
            1 << 24,
        )?;
        check("ancillary.chunk_size", self.ancillary.chunk_size as u64, 1, 4096)?;
        if let CropTransition::StepOverVsyncs(steps) = self.crop_transition {
            check("crop_transition.steps", u64::from(steps), 1, 1000)?;
        }
        let (num, den) = self.pixel_aspect_ratio;
        check("pixel_aspect_ratio.0", u64::from(num), 1, u64::from(u16::MAX))?;
        check("pixel_aspect_ratio.1", u64::from(den), 1, u64::from(u16::MAX))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        assert!(EngineConfig::default().validate().is_ok());
        assert!(EngineConfig::low_latency().validate().is_ok());
        assert!(EngineConfig::robust().validate().is_ok());
    }

    #[test]
    fn test_applied_latency() {
        let config = EngineConfig {
            video_latency_us: 100_000,
            capture_latency_us: 60_000,
            ..Default::default()
        };
        assert_eq!(config.applied_latency_us(), 40_000);
        assert_eq!(EngineConfig::default().applied_latency_us(), 0);
    }

    #[test]
    fn test_rejects_tiny_ring() {
        let config = EngineConfig {
            ring_depth: 2,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CaptureError::OutOfRange { field: "ring_depth", .. })
        ));
    }

    #[test]
    fn test_rejects_bad_timing() {
        let mut config = EngineConfig::default();
        config.timing.max_integration_frames = 8;
        assert!(matches!(config.validate(), Err(CaptureError::Timing(_))));
    }
}
