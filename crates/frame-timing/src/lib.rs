//! Frame Timing
//!
//! Recovers the real frame period of a capture source from interrupt
//! timestamps. The nominal period comes from the selected video mode; a
//! fixed-point correction factor tracks the source's oscillator error and a
//! small drift term keeps the schedule locked to measured arrivals.

mod history;
mod model;
mod rate;

pub use history::{IntegrationHistory, IntegrationRecord};
pub use model::{Integration, TimingConfig, TimingModel, WarmUpStep};
pub use rate::{
    corrected_time, matches_frame_time, micros_to_pts, FrameRate, RateEstimate,
    CANONICAL_RATES, CORRECTION_FRACTION_BITS, CORRECTION_ONE, ONE_PPM, PTS_MASK,
};

use thiserror::Error;

/// Errors raised while building a timing model
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimingError {
    /// A configuration value outside its legal range
    #[error("{field} value {value} is out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
}
