//! Capture device
//!
//! Owns a capture session and the two tasks that serve it: the injector,
//! which keeps decode buffers scheduled ahead of capture and hands filled
//! ones downstream, and the synchronizer, which locks the output vsync to
//! the source. Source ticks arrive through [`CaptureDevice::on_tick`] from
//! whatever thread observes them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ancillary::AncillaryQueue;
use parking_lot::Mutex;
use ring_buffer::RingCursors;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::CaptureError;
use crate::mode::{self, ModeParams, StreamInfo};
use crate::pipeline::{PresentationPipeline, StreamEvent};
use crate::session::{CaptureSession, TickActions};
use crate::state::CaptureState;
use crate::stats::{CaptureStats, Notifications, StatsSnapshot};
use crate::window::{CropOutcome, Rect, ScalingState};
use crate::{injector, synchronizer};

/// State shared between the tick context and the device tasks
pub(crate) struct Shared {
    pub config: EngineConfig,
    pub pipeline: Arc<dyn PresentationPipeline>,
    pub clock: Arc<dyn Clock>,

    pub session: Mutex<CaptureSession>,
    pub scaling: Mutex<ScalingState>,
    pub ancillary: Arc<AncillaryQueue>,
    pub stats: Arc<CaptureStats>,
    pub notifications: Arc<Notifications>,

    /// Slots the injector may schedule beyond those already filled
    pub ahead: Semaphore,
    pub synchronizer_wake: Notify,
    pub injector_wake: Notify,
    pub mode_changed: Notify,
    pub requested_mode: Mutex<Option<&'static ModeParams>>,

    pub running: AtomicBool,
    pub fast_mode_switch: AtomicBool,
    /// Output vsync must be re-locked
    pub synchronize: AtomicBool,
    pub shutdown: watch::Sender<bool>,
}

impl Shared {
    /// The current capture sequence should wind down
    pub fn should_exit(&self) -> bool {
        !self.running.load(Ordering::Acquire) || self.fast_mode_switch.load(Ordering::Acquire)
    }

    fn apply(&self, actions: TickActions) {
        if actions.release_ahead > 0 {
            self.ahead.add_permits(actions.release_ahead as usize);
        }
        if actions.resynchronize && self.config.vsync_lock {
            self.synchronize.store(true, Ordering::Release);
        }
        if actions.wake_synchronizer || actions.resynchronize {
            self.synchronizer_wake.notify_one();
        }
        if actions.wake_injector {
            self.injector_wake.notify_one();
        }
        if actions.first_content {
            debug!("First content captured");
        }
    }
}

/// A capture device bound to a presentation pipeline
pub struct CaptureDevice {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CaptureDevice {
    /// Build a device. Nothing runs until [`CaptureDevice::start`].
    pub fn open(
        config: EngineConfig,
        pipeline: Arc<dyn PresentationPipeline>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CaptureError> {
        config.validate()?;

        let stats = Arc::new(CaptureStats::default());
        let notifications = Arc::new(Notifications::new());
        let ancillary = Arc::new(AncillaryQueue::new(config.ancillary.clone()));
        let session = CaptureSession::new(&config, ancillary.clone(), stats.clone(), notifications.clone());
        let scaling = ScalingState::new(
            config.bytes_per_pixel,
            config.horizontal_resize,
            config.vertical_resize,
        );
        let (shutdown, _) = watch::channel(false);

        let shared = Shared {
            config,
            pipeline,
            clock,
            session: Mutex::new(session),
            scaling: Mutex::new(scaling),
            ancillary,
            stats,
            notifications,
            ahead: Semaphore::new(0),
            synchronizer_wake: Notify::new(),
            injector_wake: Notify::new(),
            mode_changed: Notify::new(),
            requested_mode: Mutex::new(None),
            running: AtomicBool::new(false),
            fast_mode_switch: AtomicBool::new(false),
            synchronize: AtomicBool::new(false),
            shutdown,
        };

        Ok(Self {
            shared: Arc::new(shared),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the injector and synchronizer tasks on the current runtime
    pub fn start(&self) -> Result<(), CaptureError> {
        if *self.shared.shutdown.borrow() {
            return Err(CaptureError::Stopped);
        }
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(CaptureError::AlreadyStarted);
        }

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(injector::run(self.shared.clone())));
        tasks.push(tokio::spawn(synchronizer::run(self.shared.clone())));
        info!("Capture device started");
        Ok(())
    }

    /// Source tick at `now_us`
    pub fn on_tick(&self, now_us: u64) {
        let actions = self.shared.session.lock().on_tick(now_us);
        self.shared.apply(actions);
    }

    /// Source tick stamped with the device clock
    pub fn tick(&self) {
        self.on_tick(self.shared.clock.now_us());
    }

    /// Select a video mode. A running sequence is torn down and restarted
    /// in the new mode.
    pub fn set_mode(&self, id: u32) -> Result<(), CaptureError> {
        let mode = mode::lookup(id)?;
        *self.shared.requested_mode.lock() = Some(mode);

        let state = self.shared.session.lock().state();
        if state != CaptureState::Inactive {
            info!("Mode switch to {} while {}", mode.name, state);
            self.shared.fast_mode_switch.store(true, Ordering::Release);
            self.shared.ahead.add_permits(1);
            self.shared.injector_wake.notify_one();
        } else {
            info!("Mode set to {}", mode.name);
        }
        self.shared.mode_changed.notify_one();
        Ok(())
    }

    /// Capture only `rect` of the active picture. A zero rect selects the
    /// whole picture.
    pub fn set_input_crop(&self, rect: Rect) -> Result<(), CaptureError> {
        self.shared.scaling.lock().set_input_crop(rect)
    }

    /// Move the displayed window to `rect` using the configured transition
    pub fn set_output_crop(&self, rect: Rect) -> CropOutcome {
        self.shared.notifications.arm_crop_target();
        let outcome = self
            .shared
            .scaling
            .lock()
            .set_output_crop(rect, self.shared.config.crop_transition);
        if outcome == CropOutcome::TargetReached {
            self.shared.notifications.crop_target_reached();
        }
        outcome
    }

    /// Event raised by the presentation pipeline
    pub fn handle_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::VsyncOffsetMeasured(offset_us) => {
                debug!("Output vsync offset {} us", offset_us);
                self.shared.notifications.set_vsync_offset(offset_us);
            }
            StreamEvent::OutputSizeChanged(rect) => {
                let reached = self.shared.scaling.lock().on_output_size_changed(rect);
                if reached {
                    debug!("Output crop target {} reached", rect);
                    self.shared.notifications.crop_target_reached();
                }
            }
            StreamEvent::FatalHardwareFailure => {
                error!("Presentation pipeline reported a fatal hardware failure");
                if self.shared.notifications.raise_post_mortem() {
                    self.shared.stats.post_mortems(1);
                }
                self.shared.synchronizer_wake.notify_one();
            }
        }
    }

    pub fn ancillary(&self) -> &Arc<AncillaryQueue> {
        &self.shared.ancillary
    }

    pub fn notifications(&self) -> &Arc<Notifications> {
        &self.shared.notifications
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn state(&self) -> CaptureState {
        self.shared.session.lock().state()
    }

    pub fn stream_info(&self) -> Option<StreamInfo> {
        self.shared.session.lock().stream_info()
    }

    pub fn cursors(&self) -> RingCursors {
        self.shared.session.lock().cursors()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Stop both tasks and wait for them. Buffers still held are returned
    /// to the pipeline on the way out. Calling again is a no-op.
    pub async fn stop(&self) -> Result<(), CaptureError> {
        self.shared.running.store(false, Ordering::Release);
        self.shared.shutdown.send_replace(true);
        self.shared.ahead.close();
        self.shared.ancillary.shutdown();
        self.shared.injector_wake.notify_one();
        self.shared.synchronizer_wake.notify_one();
        self.shared.mode_changed.notify_one();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return Ok(());
        }
        for task in tasks {
            task.await.map_err(|e| CaptureError::Task(e.to_string()))?;
        }
        info!("Capture device stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::pipeline::{SimulatedPipeline, SurfaceFormat};

    fn device() -> (CaptureDevice, Arc<SimulatedPipeline>) {
        let pipeline = Arc::new(SimulatedPipeline::new(SurfaceFormat::Ycbcr422R));
        let device = CaptureDevice::open(
            EngineConfig::default(),
            pipeline.clone(),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();
        (device, pipeline)
    }

    #[test]
    fn test_open_rejects_bad_config() {
        let config = EngineConfig {
            ring_depth: 1,
            ..Default::default()
        };
        let pipeline = Arc::new(SimulatedPipeline::new(SurfaceFormat::Ycbcr422R));
        assert!(matches!(
            CaptureDevice::open(config, pipeline, Arc::new(ManualClock::new(0))),
            Err(CaptureError::OutOfRange { field: "ring_depth", .. })
        ));
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let (device, _) = device();
        assert!(matches!(device.set_mode(0xbeef), Err(CaptureError::UnknownMode(0xbeef))));
    }

    #[test]
    fn test_output_crop_unchanged_fires_at_once() {
        let (device, _) = device();
        let mut rx = device.notifications().subscribe();
        assert_eq!(device.set_output_crop(Rect::default()), CropOutcome::TargetReached);
        assert!(!device.notifications().crop_target_outstanding());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_fatal_failure_raises_post_mortem() {
        let (device, _) = device();
        device.handle_event(StreamEvent::FatalHardwareFailure);
        device.handle_event(StreamEvent::FatalHardwareFailure);
        assert_eq!(device.notifications().post_mortem(), 1);
        assert_eq!(device.stats().post_mortems, 1);
    }

    #[test]
    fn test_vsync_offset_recorded() {
        let (device, _) = device();
        device.handle_event(StreamEvent::VsyncOffsetMeasured(-250));
        assert_eq!(device.notifications().vsync_offset_us(), -250);
    }

    #[test]
    fn test_tick_while_inactive_is_harmless() {
        let (device, _) = device();
        device.on_tick(1000);
        assert_eq!(device.state(), CaptureState::Inactive);
        assert_eq!(device.stats().ticks, 1);
    }

    #[tokio::test]
    async fn test_start_twice_and_stop_twice() {
        let (device, _) = device();
        device.start().unwrap();
        assert!(matches!(device.start(), Err(CaptureError::AlreadyStarted)));
        device.stop().await.unwrap();
        device.stop().await.unwrap();
        assert!(!device.is_running());
        assert!(matches!(device.start(), Err(CaptureError::Stopped)));
    }
}
