//! Ancillary Data Capture
//!
//! A pool of client-visible buffers filled from a hardware scratch ring of
//! VBI packets. Clients queue empty buffers, the capture path copies the
//! packets of each frame into the oldest queued buffer, and clients
//! dequeue filled buffers either blocking or non-blocking.

mod pool;
mod queue;
mod scratch;

pub use pool::{AncillaryConfig, AncillaryPool, BufferInfo, CaptureOutcome};
pub use queue::AncillaryQueue;
pub use scratch::{packet_len, ScratchRing};

use thiserror::Error;

/// Errors raised by the ancillary pool
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AncillaryError {
    /// Teardown requested while no buffers are allocated
    #[error("No ancillary buffers allocated")]
    NothingAllocated,

    /// Allocation requested while buffers are already allocated
    #[error("Ancillary buffers already allocated ({count} x {size} bytes)")]
    AlreadyAllocated { count: usize, size: usize },

    /// Backing storage could not be reserved
    #[error("Failed to allocate {bytes} bytes of ancillary storage")]
    Allocation { bytes: usize },

    /// Buffer index beyond the allocated count
    #[error("Ancillary buffer index {index} out of range (count {count})")]
    IndexOutOfRange { index: usize, count: usize },

    /// Buffer already queued or holding undelivered data
    #[error("Ancillary buffer {index} is already queued or done")]
    BufferBusy { index: usize },

    /// Streaming is off or the pool was torn down
    #[error("Ancillary stream is not running")]
    StreamOff,

    /// Non-blocking dequeue with nothing ready
    #[error("No filled ancillary buffer available")]
    WouldBlock,

    /// The pool has been shut down
    #[error("Ancillary pool shut down")]
    Shutdown,
}
