//! Simulated video source
//!
//! Runs on its own thread the way a capture interrupt would: advances the
//! shared clock to each source tick, calls into the device, and forwards
//! events raised by the presentation pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dvp_capture::{mode, CaptureDevice, Clock, FrameRate, ManualClock, SimulatedPipeline};
use tracing::{debug, info, warn};

use crate::settings::SimSettings;

/// VBI packet carrying three payload words
const PACKET: [u8; 18] = [0x55, 0x27, 0x00, 0x03, 0x00, 0x00, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];

pub struct SimulatedSource {
    pub device: Arc<CaptureDevice>,
    pub pipeline: Arc<SimulatedPipeline>,
    pub clock: Arc<ManualClock>,
    pub settings: SimSettings,
    pub stop: Arc<AtomicBool>,
}

/// What the source delivered
#[derive(Debug, Default, Clone, Copy)]
pub struct SourceReport {
    pub delivered: u64,
    pub skipped: u64,
}

impl SimulatedSource {
    pub fn run(self) -> SourceReport {
        let mut report = SourceReport::default();
        let mut rate = tick_rate(self.settings.mode);
        let mut start = self.clock.now_us();
        let mut since_switch = 0;
        let pace = Duration::from_micros(self.settings.source.pace_us);
        let source = &self.settings.source;

        for tick in 0..source.ticks {
            if self.stop.load(Ordering::Acquire) {
                info!("Source stopped after {} ticks", tick);
                break;
            }

            if source.switch_at == Some(tick) {
                match self.device.set_mode(source.switch_mode) {
                    Ok(()) => {
                        start = self.clock.now_us();
                        rate = tick_rate(source.switch_mode);
                        since_switch = 0;
                    }
                    Err(e) => warn!("Mode switch failed: {}", e),
                }
            }

            since_switch += 1;
            let now = self.settings.tick_time(start, rate, since_switch);
            self.clock.set(now);

            if source.skip_every > 0 && tick % source.skip_every == source.skip_every - 1 {
                debug!("Source skipping tick at {}", now);
                report.skipped += 1;
            } else {
                if source.ancillary {
                    self.device.ancillary().hardware_write(&PACKET);
                }
                self.device.on_tick(now);
                report.delivered += 1;
            }

            for event in self.pipeline.take_events() {
                self.device.handle_event(event);
            }
            thread::sleep(pace);
        }
        report
    }
}

fn tick_rate(mode_id: u32) -> FrameRate {
    mode::lookup(mode_id)
        .map(|m| m.tick_rate())
        .unwrap_or(FrameRate::new(50, 1))
}
