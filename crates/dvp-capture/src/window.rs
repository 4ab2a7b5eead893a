//! Input/output windows and scaling register images
//!
//! The configuration surface writes crops here and the injection path
//! snapshots [`ScalingParams`] into every decode slot it programs.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::CropTransition;
use crate::error::CaptureError;

/// Resize register value meaning "no resize"
pub const RESIZE_OFF: u32 = 0x0000_0100;

const RESIZE_ENABLE: u32 = 0x0100_0000;

/// Downscaling is limited to this factor
const MAX_DOWNSCALE: u32 = 8;

/// Line alignment required by the display, in pixels
const LINE_ALIGN_PIXELS: u32 = 32;

/// Window rectangle. A zero width or height means "the full mode".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    fn round_up_even(self) -> Self {
        Self {
            x: self.x.saturating_add(1) & !1,
            y: self.y.saturating_add(1) & !1,
            width: self.width.saturating_add(1) & !1,
            height: self.height.saturating_add(1) & !1,
        }
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// Capture register images for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WindowRegisters {
    /// Captured width and per-field height
    pub cvs: u32,
    /// Memory pitch between captured lines
    pub vmp: u32,
    /// Offset of the bottom field from the top field
    pub vbp_minus_vtp: u32,
    /// Horizontal sample rate converter step
    pub hsrc: u32,
    /// Vertical sample rate converter step
    pub vsrc: u32,
}

/// Scaling parameters programmed into a decode slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScalingParams {
    /// Captured (post-scaling) width
    pub width: u32,
    /// Captured (post-scaling) height
    pub height: u32,
    pub bytes_per_line: u32,
    pub registers: WindowRegisters,
    pub input_window: Rect,
    pub output_window: Rect,
}

/// Result of requesting a new output window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CropOutcome {
    /// The window is already in place
    TargetReached,
    /// The change will be applied over this many injected frames
    Stepping { steps: u32 },
    /// The change was applied at once
    Applied,
}

/// Crop and scaling state shared between control and injection
#[derive(Debug, Clone)]
pub struct ScalingState {
    bytes_per_pixel: u32,
    horizontal_resize: bool,
    vertical_resize: bool,

    mode_width: u32,
    mode_height: u32,
    interlaced: bool,

    input_crop: Rect,
    output_crop: Rect,

    crop_start: Rect,
    crop_target: Rect,
    crop_steps: u32,
    crop_step: u32,
    stepping: bool,
    target_reached: bool,

    next: ScalingParams,
}

impl ScalingState {
    pub fn new(bytes_per_pixel: u32, horizontal_resize: bool, vertical_resize: bool) -> Self {
        Self {
            bytes_per_pixel,
            horizontal_resize,
            vertical_resize,
            mode_width: 0,
            mode_height: 0,
            interlaced: false,
            input_crop: Rect::default(),
            output_crop: Rect::default(),
            crop_start: Rect::default(),
            crop_target: Rect::default(),
            crop_steps: 0,
            crop_step: 0,
            stepping: false,
            target_reached: true,
            next: ScalingParams::default(),
        }
    }

    /// Adopt new mode dimensions. The input crop is cleared since it may
    /// not fit the new mode.
    pub fn configure_mode(&mut self, width: u32, height: u32, interlaced: bool) {
        self.mode_width = width;
        self.mode_height = height;
        self.interlaced = interlaced;
        self.input_crop = Rect::default();
        self.recalculate();
    }

    /// Parameters the next programmed slot will use
    pub fn next(&self) -> ScalingParams {
        self.next
    }

    pub fn input_crop(&self) -> Rect {
        self.input_crop
    }

    pub fn output_crop(&self) -> Rect {
        self.output_crop
    }

    pub fn crop_target(&self) -> Rect {
        self.crop_target
    }

    pub fn is_stepping(&self) -> bool {
        self.stepping
    }

    pub fn target_reached(&self) -> bool {
        self.target_reached
    }

    /// Recompute the next-slot parameters from mode size and crops.
    ///
    /// Returns false while there is no mode to scale from.
    pub fn recalculate(&mut self) -> bool {
        let mut scaled_crop = self.input_crop;

        let in_width = non_zero_or(scaled_crop.width, self.mode_width);
        let in_height = non_zero_or(scaled_crop.height, self.mode_height);
        let mut out_width = non_zero_or(self.output_crop.width, self.mode_width);
        let mut out_height = non_zero_or(self.output_crop.height, self.mode_height);

        if in_width == 0 || out_width == 0 {
            return false;
        }

        out_width = out_width.max(in_width / MAX_DOWNSCALE);
        out_height = out_height.max(in_height / MAX_DOWNSCALE);

        let mut hsrc = RESIZE_OFF;
        let mut vsrc = RESIZE_OFF;
        let mut scaled_width = self.mode_width;
        let mut scaled_height = self.mode_height;

        if self.horizontal_resize && in_width > out_width {
            hsrc = resize_step(in_width, out_width);
            scaled_crop.x = scaled_crop.x * out_width / in_width;
            scaled_crop.width = scaled_crop.width * out_width / in_width;
            scaled_width = self.mode_width * out_width / in_width;
        }

        if self.vertical_resize && in_height > out_height && out_height > 0 {
            vsrc = resize_step(in_height, out_height);
            scaled_crop.y = scaled_crop.y * out_height / in_height;
            scaled_crop.height = scaled_crop.height * out_height / in_height;
            scaled_height = self.mode_height * out_height / in_height;
        }

        let bytes_per_line =
            self.bytes_per_pixel * ((scaled_width + LINE_ALIGN_PIXELS - 1) & !(LINE_ALIGN_PIXELS - 1));
        let fields = if self.interlaced { 2 } else { 1 };

        self.next = ScalingParams {
            width: scaled_width,
            height: scaled_height,
            bytes_per_line,
            registers: WindowRegisters {
                cvs: scaled_width | ((scaled_height / fields) << 16),
                vmp: bytes_per_line * fields,
                vbp_minus_vtp: if self.interlaced { bytes_per_line } else { 0 },
                hsrc,
                vsrc,
            },
            input_window: scaled_crop,
            output_window: self.output_crop,
        };
        true
    }

    /// Set the capture window. Rejected when it exceeds the mode.
    pub fn set_input_crop(&mut self, rect: Rect) -> Result<(), CaptureError> {
        let exceeds = |start: u32, len: u32, limit: u32| {
            start.checked_add(len).map_or(true, |end| end > limit)
        };
        if exceeds(rect.x, rect.width, self.mode_width) || exceeds(rect.y, rect.height, self.mode_height) {
            return Err(CaptureError::InvalidCrop {
                rect,
                width: self.mode_width,
                height: self.mode_height,
            });
        }
        self.input_crop = rect;
        if !self.stepping {
            self.recalculate();
        }
        Ok(())
    }

    /// Request a new output window
    pub fn set_output_crop(&mut self, rect: Rect, transition: CropTransition) -> CropOutcome {
        if !self.target_reached && self.output_crop.x != 0 {
            warn!("Output crop {} set before the previous one reached the display", rect);
        }

        self.stepping = false;
        self.target_reached = false;
        self.crop_target = rect;
        self.crop_start = self.output_crop;

        if rect == self.crop_start {
            debug!("Output crop {} unchanged, target reached", rect);
            self.target_reached = true;
            return CropOutcome::TargetReached;
        }

        let steps = match transition {
            CropTransition::Immediate => {
                self.output_crop = rect;
                self.recalculate();
                return CropOutcome::Applied;
            }
            CropTransition::SingleStep => 1,
            CropTransition::StepOverVsyncs(steps) => steps.max(1),
        };
        self.crop_steps = steps;
        self.crop_step = 0;
        self.stepping = true;
        CropOutcome::Stepping { steps }
    }

    /// Move the output window one step towards its target.
    ///
    /// Intermediate windows are rounded up to even values; the final step
    /// lands exactly on the target.
    pub fn perform_step(&mut self) {
        if !self.stepping {
            return;
        }
        if self.crop_start.width == 0 {
            self.crop_start = Rect::new(0, 0, self.mode_width, self.mode_height);
        }

        self.crop_step += 1;
        let step = self.crop_step;
        let steps = self.crop_steps;
        let lerp = |from: u32, to: u32| {
            ((u64::from(from) * u64::from(steps - step) + u64::from(to) * u64::from(step))
                / u64::from(steps)) as u32
        };

        let mut crop = Rect {
            x: lerp(self.crop_start.x, self.crop_target.x),
            y: lerp(self.crop_start.y, self.crop_target.y),
            width: lerp(self.crop_start.width, self.crop_target.width),
            height: lerp(self.crop_start.height, self.crop_target.height),
        };

        if step >= steps {
            self.stepping = false;
        } else {
            crop = crop.round_up_even();
        }
        self.output_crop = crop;
        self.recalculate();
    }

    /// Downstream reported a new output size. Returns true when this is
    /// the first report of the pending target.
    pub fn on_output_size_changed(&mut self, rect: Rect) -> bool {
        if !self.target_reached && rect == self.crop_target {
            self.target_reached = true;
            return true;
        }
        false
    }
}

fn non_zero_or(value: u32, fallback: u32) -> u32 {
    if value != 0 {
        value
    } else {
        fallback
    }
}

fn resize_step(input: u32, output: u32) -> u32 {
    RESIZE_ENABLE | ((input - 1) * 256 / (output.saturating_sub(1)).max(1))
}
