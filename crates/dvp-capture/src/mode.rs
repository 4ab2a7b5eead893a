//! Supported source formats

use frame_timing::FrameRate;
use serde::{Deserialize, Serialize};

use crate::error::CaptureError;

/// Scan type of a source format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanType {
    Progressive,
    Interlaced,
}

/// One supported source format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeParams {
    /// Identifier accepted by mode selection
    pub id: u32,
    pub name: &'static str,
    /// Frame rate in millihertz (59940 for 59.94 Hz)
    pub frame_rate_mhz: u32,
    pub scan: ScanType,
    pub active_width: u32,
    pub active_height: u32,
    /// First active pixel on a line
    pub active_x_start: u32,
    /// Lines of vertical blanking before the active area
    pub vbi_height: u32,
}

const fn mode(
    id: u32,
    name: &'static str,
    frame_rate_mhz: u32,
    scan: ScanType,
    geometry: (u32, u32, u32, u32),
) -> ModeParams {
    ModeParams {
        id,
        name,
        frame_rate_mhz,
        scan,
        active_width: geometry.0,
        active_height: geometry.1,
        active_x_start: geometry.2,
        vbi_height: geometry.3,
    }
}

use ScanType::{Interlaced as I, Progressive as P};

/// Every format the capture path can lock to
pub const MODE_TABLE: &[ModeParams] = &[
    // SD/ED
    mode(0, "720x480i60", 60000, I, (720, 480, 119, 36)),
    mode(1, "720x480p60", 60000, P, (720, 480, 122, 36)),
    mode(2, "720x480i59.94", 59940, I, (720, 480, 119, 36)),
    mode(3, "720x480p59.94", 59940, P, (720, 480, 122, 36)),
    mode(4, "640x480i59.94", 59940, I, (640, 480, 118, 38)),
    mode(5, "720x576i50", 50000, I, (720, 576, 132, 44)),
    mode(6, "720x576p50", 50000, P, (720, 576, 132, 44)),
    mode(7, "768x576i50", 50000, I, (768, 576, 155, 44)),
    // VCR trick modes
    mode(8, "720x240p59.94", 59940, P, (720, 240, 119, 18)),
    mode(9, "720x240p60", 60000, P, (720, 240, 119, 18)),
    mode(10, "720x288p50", 50000, P, (720, 288, 132, 22)),
    // 1080p
    mode(11, "1920x1080p60", 60000, P, (1920, 1080, 192, 41)),
    mode(12, "1920x1080p59.94", 59940, P, (1920, 1080, 192, 41)),
    mode(13, "1920x1080p50", 50000, P, (1920, 1080, 192, 41)),
    mode(14, "1920x1080p30", 30000, P, (1920, 1080, 192, 41)),
    mode(15, "1920x1080p29.97", 29970, P, (1920, 1080, 192, 41)),
    mode(16, "1920x1080p25", 25000, P, (1920, 1080, 192, 41)),
    mode(17, "1920x1080p24", 24000, P, (1920, 1080, 192, 41)),
    mode(18, "1920x1080p23.976", 23976, P, (1920, 1080, 192, 41)),
    // 1080i
    mode(19, "1920x1080i60", 60000, I, (1920, 1080, 192, 40)),
    mode(20, "1920x1080i59.94", 59940, I, (1920, 1080, 192, 40)),
    mode(21, "1920x1080i50", 50000, I, (1920, 1080, 192, 40)),
    mode(22, "1920x1080i50-as4933", 50000, I, (1920, 1080, 352, 124)),
    // 720p
    mode(23, "1280x720p60", 60000, P, (1280, 720, 260, 25)),
    mode(24, "1280x720p59.94", 59940, P, (1280, 720, 260, 25)),
    mode(25, "1280x720p50", 50000, P, (1280, 720, 260, 25)),
    // Australian analogue HD
    mode(26, "1280x1152i50", 50000, I, (1280, 1152, 235, 178)),
    // VGA
    mode(27, "640x480p59.94", 59940, P, (640, 480, 144, 35)),
    mode(28, "640x480p60", 60000, P, (640, 480, 144, 35)),
];

/// Resolve a mode identifier against [`MODE_TABLE`]
pub fn lookup(id: u32) -> Result<&'static ModeParams, CaptureError> {
    MODE_TABLE
        .iter()
        .find(|m| m.id == id)
        .ok_or(CaptureError::UnknownMode(id))
}

impl ModeParams {
    pub fn is_interlaced(&self) -> bool {
        self.scan == ScanType::Interlaced
    }

    /// Rate at which the source ticks; interlaced sources tick once per
    /// field pair
    pub fn tick_rate(&self) -> FrameRate {
        let rate = FrameRate::from_millihertz(self.frame_rate_mhz);
        if self.is_interlaced() {
            rate.halved()
        } else {
            rate
        }
    }
}

/// Stream description sent downstream with every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub rate: FrameRate,
    pub interlaced: bool,
    pub width: u32,
    pub height: u32,
    pub top_field_first: bool,
    pub pixel_aspect_ratio: (u32, u32),
}

impl StreamInfo {
    pub fn for_mode(mode: &ModeParams, top_field_first: bool, pixel_aspect_ratio: (u32, u32)) -> Self {
        Self {
            rate: mode.tick_rate(),
            interlaced: mode.is_interlaced(),
            width: mode.active_width,
            height: mode.active_height,
            top_field_first,
            pixel_aspect_ratio,
        }
    }
}
