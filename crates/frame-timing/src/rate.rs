//! Frame rates and fixed-point time helpers

use serde::{Deserialize, Serialize};

/// Fractional bits of the frame duration correction factor
pub const CORRECTION_FRACTION_BITS: u32 = 30;

/// Correction factor of exactly 1.0
pub const CORRECTION_ONE: u64 = 1 << CORRECTION_FRACTION_BITS;

/// One part per million of [`CORRECTION_ONE`]
pub const ONE_PPM: u64 = CORRECTION_ONE / 1_000_000;

/// Presentation timestamps wrap at 33 bits
pub const PTS_MASK: u64 = 0x1_FFFF_FFFF;

/// Frame rate as an exact rational (frames per second = numerator / denominator)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRate {
    pub numerator: u64,
    pub denominator: u64,
}

/// A broadcast rate paired with its rounded frame duration
#[derive(Debug, Clone, Copy)]
pub struct CanonicalRate {
    pub frame_duration_us: u64,
    pub rate: FrameRate,
}

/// Rates a measured period may snap to
pub const CANONICAL_RATES: [CanonicalRate; 8] = [
    CanonicalRate { frame_duration_us: 16667, rate: FrameRate::new(60, 1) },
    CanonicalRate { frame_duration_us: 16683, rate: FrameRate::new(60000, 1001) },
    CanonicalRate { frame_duration_us: 20000, rate: FrameRate::new(50, 1) },
    CanonicalRate { frame_duration_us: 33333, rate: FrameRate::new(30, 1) },
    CanonicalRate { frame_duration_us: 33367, rate: FrameRate::new(30000, 1001) },
    CanonicalRate { frame_duration_us: 40000, rate: FrameRate::new(25, 1) },
    CanonicalRate { frame_duration_us: 41667, rate: FrameRate::new(24, 1) },
    CanonicalRate { frame_duration_us: 41708, rate: FrameRate::new(24000, 1001) },
];

impl FrameRate {
    pub const fn new(numerator: u64, denominator: u64) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Rate from a mode table entry given in millihertz.
    ///
    /// The NTSC family (59.94, 29.97, 23.976) maps onto the exact /1001
    /// fractions, everything else onto an integer rate.
    pub fn from_millihertz(millihertz: u32) -> Self {
        match millihertz {
            59940 => Self::new(60000, 1001),
            29970 => Self::new(30000, 1001),
            23976 => Self::new(24000, 1001),
            other => Self::new(u64::from(other), 1000),
        }
    }

    /// Frame rate of the individual frames of an interlaced field rate
    pub fn halved(self) -> Self {
        Self::new(self.numerator / 2, self.denominator)
    }

    /// Microseconds covered by `frames` frames, rounded to nearest
    pub fn time_for_frames(&self, frames: u64) -> u64 {
        let numerator = u128::from(self.numerator.max(1));
        let scaled = u128::from(frames) * u128::from(self.denominator) * 1_000_000;
        ((scaled + numerator / 2) / numerator) as u64
    }

    /// Nominal duration of a single frame in microseconds
    pub fn frame_duration_us(&self) -> u64 {
        self.time_for_frames(1)
    }

    /// Frames per second as a float, for logging
    pub fn fps(&self) -> f64 {
        self.numerator as f64 / self.denominator.max(1) as f64
    }
}

impl std::fmt::Display for FrameRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

/// Outcome of re-measuring the frame rate from raw tick timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateEstimate {
    /// Measured frame duration, rounded to whole microseconds
    pub frame_duration_us: u64,
    /// Rate in effect after the estimate
    pub rate: FrameRate,
    /// Whether the rate in effect is one of the canonical rates
    pub standard: bool,
}

/// Scale a nominal duration by a fixed-point correction factor
pub fn corrected_time(time_us: u64, correction: u64) -> u64 {
    ((u128::from(time_us) * u128::from(correction)) >> CORRECTION_FRACTION_BITS) as u64
}

/// Whether `value` lies within `ppm` parts per million (plus one) of `target`
pub fn matches_frame_time(value: u64, target: u64, ppm: u64) -> bool {
    let range = (target * ppm) / 1_000_000 + 1;
    value >= target.saturating_sub(range) && value <= target + range
}

/// Convert a microsecond time to a 90 kHz presentation timestamp
pub fn micros_to_pts(time_us: u64) -> u64 {
    ((u128::from(time_us) * 27 + 150) / 300) as u64 & PTS_MASK
}
