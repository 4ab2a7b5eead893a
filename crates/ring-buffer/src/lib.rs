//! Decode Slot Ring
//!
//! Fixed-depth ring of capture slots tracked by three monotonic cursors:
//! slots are *got* (programmed with a destination buffer and an expected
//! fill time), *filled* by the source in schedule order, then *injected*
//! downstream. At all times `next_to_inject <= next_to_fill <= next_to_get`.

mod buffer;

pub use buffer::{DecodeRing, DropReason, FillOutcome, Injectable, RingCursors};

use thiserror::Error;

/// Errors raised by the decode ring
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    /// Getting another slot would overwrite one not yet injected
    #[error("Decode ring full: {outstanding} of {depth} slots outstanding")]
    Full { outstanding: u64, depth: usize },
}
