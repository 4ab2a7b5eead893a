//! Downstream presentation pipeline contract
//!
//! The capture engine hands filled decode buffers to a presentation
//! pipeline it does not own. [`PresentationPipeline`] is the whole of that
//! contract; [`SimulatedPipeline`] implements it in memory for the
//! simulator binary and for tests.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::mode::StreamInfo;
use crate::window::Rect;

/// Errors reported by the presentation pipeline
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Decode buffer allocation failed: {0}")]
    Allocation(String),

    #[error("Unknown decode buffer {0}")]
    UnknownBuffer(u64),

    #[error("Pipeline rejected request: {0}")]
    Rejected(String),

    #[error("Pipeline timed out after {0:?}")]
    Timeout(Duration),
}

/// Handle of a decode buffer owned by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferId(pub u64);

/// Decode buffer granted by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeBuffer {
    pub id: BufferId,
    /// Bytes per line of the granted surface
    pub stride: u32,
}

/// Pixel format of capture surfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SurfaceFormat {
    Rgb565,
    Rgb888,
    Argb8888,
    Ycbcr422R,
}

impl SurfaceFormat {
    /// Capture surface format for a pixel size
    pub fn for_bytes_per_pixel(bytes: u32) -> Self {
        match bytes {
            3 => SurfaceFormat::Rgb888,
            4 => SurfaceFormat::Argb8888,
            _ => SurfaceFormat::Ycbcr422R,
        }
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            SurfaceFormat::Rgb565 | SurfaceFormat::Ycbcr422R => 2,
            SurfaceFormat::Rgb888 => 3,
            SurfaceFormat::Argb8888 => 4,
        }
    }
}

/// Metadata injected with a filled buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectPacket {
    pub buffer: BufferId,
    pub stream: StreamInfo,
    pub width: u32,
    pub height: u32,
    pub input_window: Rect,
    pub output_window: Rect,
    /// Time the frame was captured (us)
    pub expected_fill_time: u64,
}

/// Events raised by the pipeline towards the capture engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// Output vsync measured against the capture clock (us)
    VsyncOffsetMeasured(i64),
    /// The display started showing a new output window
    OutputSizeChanged(Rect),
    FatalHardwareFailure,
}

/// Services the capture engine consumes from the presentation pipeline
#[async_trait]
pub trait PresentationPipeline: Send + Sync {
    /// Obtain a decode buffer able to hold a `width` x `height` surface
    async fn allocate_decode_buffer(
        &self,
        format: SurfaceFormat,
        width: u32,
        height: u32,
    ) -> Result<DecodeBuffer, PipelineError>;

    /// Drop the capture engine's hold on a buffer
    async fn return_decode_buffer(&self, buffer: BufferId) -> Result<(), PipelineError>;

    /// Queue a filled buffer for presentation at `pts` (90 kHz)
    async fn inject_buffer(&self, packet: &InjectPacket, pts: u64) -> Result<(), PipelineError>;

    /// Tie presentation time `pts` to local time `local_time_us`
    async fn set_external_time_mapping(&self, pts: u64, local_time_us: u64) -> Result<(), PipelineError>;

    /// Align the output vsync with this instant
    async fn synchronize_now(&self) -> Result<(), PipelineError>;

    /// Wait until every injected buffer has been consumed
    async fn drain(&self, timeout: Duration) -> Result<(), PipelineError>;
}

/// A call made on [`SimulatedPipeline`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineCall {
    Allocate { width: u32, height: u32 },
    Return(BufferId),
    Inject { buffer: BufferId, pts: u64, expected_fill_time: u64 },
    TimeMapping { pts: u64, local_time_us: u64 },
    Synchronize,
    Drain,
}

#[derive(Debug, Default)]
struct SimulatedState {
    calls: Vec<PipelineCall>,
    next_buffer: u64,
    held: HashSet<u64>,
    allocations_left: Option<usize>,
    stride_padding: u32,
    fail_returns: bool,
    displayed_window: Option<Rect>,
    events: Vec<StreamEvent>,
}

/// In-memory pipeline that grants buffers, records every call and
/// reports output window changes as a display would
#[derive(Debug)]
pub struct SimulatedPipeline {
    format: SurfaceFormat,
    state: Mutex<SimulatedState>,
}

impl SimulatedPipeline {
    pub fn new(format: SurfaceFormat) -> Self {
        Self {
            format,
            state: Mutex::new(SimulatedState::default()),
        }
    }

    /// Fail allocations once `count` more have been granted
    pub fn fail_allocations_after(&self, count: usize) {
        self.state.lock().allocations_left = Some(count);
    }

    /// Grant surfaces whose stride is wider than requested
    pub fn pad_stride(&self, bytes: u32) {
        self.state.lock().stride_padding = bytes;
    }

    /// Make every buffer return fail
    pub fn fail_returns(&self, fail: bool) {
        self.state.lock().fail_returns = fail;
    }

    pub fn calls(&self) -> Vec<PipelineCall> {
        self.state.lock().calls.clone()
    }

    /// Buffers allocated and not yet returned
    pub fn held_buffers(&self) -> usize {
        self.state.lock().held.len()
    }

    pub fn injected(&self) -> Vec<(BufferId, u64, u64)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                PipelineCall::Inject {
                    buffer,
                    pts,
                    expected_fill_time,
                } => Some((*buffer, *pts, *expected_fill_time)),
                _ => None,
            })
            .collect()
    }

    pub fn synchronize_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, PipelineCall::Synchronize))
            .count()
    }

    /// Events raised since the last call
    pub fn take_events(&self) -> Vec<StreamEvent> {
        std::mem::take(&mut self.state.lock().events)
    }
}

#[async_trait]
impl PresentationPipeline for SimulatedPipeline {
    async fn allocate_decode_buffer(
        &self,
        format: SurfaceFormat,
        width: u32,
        height: u32,
    ) -> Result<DecodeBuffer, PipelineError> {
        let mut state = self.state.lock();
        state.calls.push(PipelineCall::Allocate { width, height });

        if let Some(left) = state.allocations_left.as_mut() {
            if *left == 0 {
                return Err(PipelineError::Allocation(format!(
                    "no {:?} surface for {}x{}",
                    format, width, height
                )));
            }
            *left -= 1;
        }

        let id = state.next_buffer;
        state.next_buffer += 1;
        state.held.insert(id);
        let stride = self.format.bytes_per_pixel() * ((width + 31) & !31) + state.stride_padding;
        Ok(DecodeBuffer {
            id: BufferId(id),
            stride,
        })
    }

    async fn return_decode_buffer(&self, buffer: BufferId) -> Result<(), PipelineError> {
        let mut state = self.state.lock();
        state.calls.push(PipelineCall::Return(buffer));
        if state.fail_returns {
            return Err(PipelineError::Rejected("return refused".to_string()));
        }
        if !state.held.remove(&buffer.0) {
            return Err(PipelineError::UnknownBuffer(buffer.0));
        }
        Ok(())
    }

    async fn inject_buffer(&self, packet: &InjectPacket, pts: u64) -> Result<(), PipelineError> {
        let mut state = self.state.lock();
        state.calls.push(PipelineCall::Inject {
            buffer: packet.buffer,
            pts,
            expected_fill_time: packet.expected_fill_time,
        });
        if state.displayed_window != Some(packet.output_window) {
            debug!("Simulated display now showing {}", packet.output_window);
            state.displayed_window = Some(packet.output_window);
            state.events.push(StreamEvent::OutputSizeChanged(packet.output_window));
        }
        Ok(())
    }

    async fn set_external_time_mapping(&self, pts: u64, local_time_us: u64) -> Result<(), PipelineError> {
        self.state
            .lock()
            .calls
            .push(PipelineCall::TimeMapping { pts, local_time_us });
        Ok(())
    }

    async fn synchronize_now(&self) -> Result<(), PipelineError> {
        self.state.lock().calls.push(PipelineCall::Synchronize);
        Ok(())
    }

    async fn drain(&self, _timeout: Duration) -> Result<(), PipelineError> {
        self.state.lock().calls.push(PipelineCall::Drain);
        Ok(())
    }
}
