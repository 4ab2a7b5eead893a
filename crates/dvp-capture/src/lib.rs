//! DVP Video Capture Engine
//!
//! Locks the presentation timeline of a downstream decoder to the frame
//! clock of an external video source. Supports:
//! - Source-tick driven capture state machine with warm-up and clock recovery
//! - Bounded-ahead decode buffer injection with presentation timestamps
//! - Output vsync synchronization
//! - Crop, scaling and ancillary (VBI) data capture

pub mod arena;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod mode;
pub mod pipeline;
pub mod session;
pub mod state;
pub mod stats;
pub mod window;

mod injector;
mod synchronizer;

pub use arena::{CaptureRegistry, SessionArena, SessionHandle};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{CropTransition, EngineConfig};
pub use device::CaptureDevice;
pub use error::CaptureError;
pub use mode::{ModeParams, ScanType, StreamInfo, MODE_TABLE};
pub use pipeline::{
    BufferId, DecodeBuffer, InjectPacket, PipelineCall, PipelineError, PresentationPipeline,
    SimulatedPipeline, StreamEvent, SurfaceFormat,
};
pub use session::{CaptureSession, CaptureSlot, TickActions};
pub use state::CaptureState;
pub use stats::{CaptureStats, NotificationEvent, Notifications, StatsSnapshot};
pub use window::{CropOutcome, Rect, ScalingParams, ScalingState, WindowRegisters};

pub use ancillary::{AncillaryConfig, AncillaryError, AncillaryQueue, BufferInfo};
pub use frame_timing::{FrameRate, TimingConfig};
pub use ring_buffer::RingCursors;
