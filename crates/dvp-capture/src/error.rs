//! Capture engine errors

use ancillary::AncillaryError;
use frame_timing::TimingError;
use ring_buffer::RingError;
use thiserror::Error;

use crate::pipeline::PipelineError;
use crate::window::Rect;

/// Capture error types
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Unknown video mode id {0:#x}")]
    UnknownMode(u32),

    #[error("No video mode selected")]
    NoMode,

    #[error("Input crop {rect} exceeds mode bounds {width}x{height}")]
    InvalidCrop { rect: Rect, width: u32, height: u32 },

    #[error("{field} value {value} is out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("Timing configuration: {0}")]
    Timing(#[from] TimingError),

    #[error("Decode buffer stride {actual} does not match expected {expected}")]
    UnexpectedStride { expected: u32, actual: u32 },

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error(transparent)]
    Downstream(#[from] PipelineError),

    #[error(transparent)]
    Ancillary(#[from] AncillaryError),

    #[error("Capture device already started")]
    AlreadyStarted,

    #[error("Capture device is stopped")]
    Stopped,

    #[error("Capture task failed: {0}")]
    Task(String),
}
