//! Capture counters and client notifications
//!
//! Both are written from the tick context and read from anywhere, so they
//! are plain atomics. Counter increments are mirrored to the `metrics`
//! facade.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::broadcast;

macro_rules! counters {
    ($($field:ident => $metric:literal),* $(,)?) => {
        /// Running totals for one capture device
        #[derive(Debug, Default)]
        pub struct CaptureStats {
            $($field: AtomicU64,)*
        }

        /// Point-in-time copy of [`CaptureStats`]
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
        pub struct StatsSnapshot {
            $(pub $field: u64,)*
        }

        impl CaptureStats {
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }

            $(
                pub fn $field(&self, count: u64) {
                    if count > 0 {
                        self.$field.fetch_add(count, Ordering::Relaxed);
                        metrics::counter!($metric).increment(count);
                    }
                }
            )*
        }
    };
}

counters! {
    ticks => "dvp_capture_ticks_total",
    missed_ticks => "dvp_capture_missed_ticks_total",
    dropped_frames => "dvp_capture_dropped_frames_total",
    late_fills => "dvp_capture_late_fills_total",
    resynchronizations => "dvp_capture_resynchronizations_total",
    correction_updates => "dvp_capture_correction_updates_total",
    rate_resets => "dvp_capture_rate_resets_total",
    ancillary_fills => "dvp_capture_ancillary_fills_total",
    ancillary_discards => "dvp_capture_ancillary_discards_total",
    synchronizations => "dvp_capture_synchronizations_total",
    sync_retries => "dvp_capture_sync_retries_total",
    injected_buffers => "dvp_capture_injected_buffers_total",
    release_failures => "dvp_capture_release_failures_total",
    post_mortems => "dvp_capture_post_mortems_total",
}

/// Notification delivered to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationEvent {
    /// The frame counting countdown reached zero
    FrameCounting,
    /// The frame capture countdown reached zero
    FrameCapture,
    /// The requested output window is on the display
    OutputCropTargetReached,
    /// Capture degraded beyond recovery
    PostMortem,
    /// Nominal tick duration changed
    MicrosecondsPerFrame(u64),
}

/// Client-visible notification state.
///
/// Tick-context changes only mark a notification pending; the synchronizer
/// task publishes pending notifications when it next wakes.
#[derive(Debug)]
pub struct Notifications {
    frame_counting: AtomicI64,
    frame_capture: AtomicI64,
    crop_target: AtomicI64,
    post_mortem: AtomicU32,
    microseconds_per_frame: AtomicU64,
    vsync_offset_us: AtomicI64,

    frame_counting_pending: AtomicBool,
    frame_capture_pending: AtomicBool,
    post_mortem_pending: AtomicBool,
    microseconds_pending: AtomicBool,

    events: broadcast::Sender<NotificationEvent>,
}

impl Default for Notifications {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrement a positive countdown; true on the one-to-zero transition
fn count_down(counter: &AtomicI64) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| (v > 0).then(|| v - 1))
        .map(|old| old == 1)
        .unwrap_or(false)
}

impl Notifications {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            frame_counting: AtomicI64::new(0),
            frame_capture: AtomicI64::new(0),
            crop_target: AtomicI64::new(0),
            post_mortem: AtomicU32::new(0),
            microseconds_per_frame: AtomicU64::new(0),
            vsync_offset_us: AtomicI64::new(0),
            frame_counting_pending: AtomicBool::new(false),
            frame_capture_pending: AtomicBool::new(false),
            post_mortem_pending: AtomicBool::new(false),
            microseconds_pending: AtomicBool::new(false),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.events.subscribe()
    }

    /// Notify after `frames` more running ticks
    pub fn arm_frame_counting(&self, frames: i64) {
        self.frame_counting.store(frames, Ordering::Release);
    }

    /// Notify after `frames` more captured frames
    pub fn arm_frame_capture(&self, frames: i64) {
        self.frame_capture.store(frames, Ordering::Release);
    }

    pub fn frame_counting(&self) -> i64 {
        self.frame_counting.load(Ordering::Acquire)
    }

    pub fn frame_capture(&self) -> i64 {
        self.frame_capture.load(Ordering::Acquire)
    }

    pub fn post_mortem(&self) -> u32 {
        self.post_mortem.load(Ordering::Acquire)
    }

    pub fn clear_post_mortem(&self) {
        self.post_mortem.store(0, Ordering::Release);
    }

    pub fn microseconds_per_frame(&self) -> u64 {
        self.microseconds_per_frame.load(Ordering::Acquire)
    }

    pub fn vsync_offset_us(&self) -> i64 {
        self.vsync_offset_us.load(Ordering::Acquire)
    }

    pub fn crop_target_outstanding(&self) -> bool {
        self.crop_target.load(Ordering::Acquire) > 0
    }

    /// Tick context: count down both frame notifiers. Returns true if a
    /// notification became pending.
    pub(crate) fn on_running_tick(&self) -> bool {
        let mut pending = false;
        if count_down(&self.frame_counting) {
            self.frame_counting_pending.store(true, Ordering::Release);
            pending = true;
        }
        if count_down(&self.frame_capture) {
            self.frame_capture_pending.store(true, Ordering::Release);
            pending = true;
        }
        pending
    }

    /// Raise the post-mortem flag. Returns true if it was clear.
    pub(crate) fn raise_post_mortem(&self) -> bool {
        let raised = self
            .post_mortem
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if raised {
            self.post_mortem_pending.store(true, Ordering::Release);
        }
        raised
    }

    /// Publish a new nominal tick duration. Returns true if it changed.
    pub(crate) fn set_microseconds_per_frame(&self, micros: u64) -> bool {
        let changed = self.microseconds_per_frame.swap(micros, Ordering::AcqRel) != micros;
        if changed {
            self.microseconds_pending.store(true, Ordering::Release);
        }
        changed
    }

    pub(crate) fn set_vsync_offset(&self, offset_us: i64) {
        self.vsync_offset_us.store(offset_us, Ordering::Release);
    }

    /// A new output window was requested
    pub(crate) fn arm_crop_target(&self) {
        self.crop_target.store(1, Ordering::Release);
    }

    /// The requested output window reached the display
    pub(crate) fn crop_target_reached(&self) {
        if count_down(&self.crop_target) {
            let _ = self.events.send(NotificationEvent::OutputCropTargetReached);
        }
    }

    /// Send every pending notification to subscribers
    pub(crate) fn publish_pending(&self) {
        if self.frame_counting_pending.swap(false, Ordering::AcqRel) {
            let _ = self.events.send(NotificationEvent::FrameCounting);
        }
        if self.frame_capture_pending.swap(false, Ordering::AcqRel) {
            let _ = self.events.send(NotificationEvent::FrameCapture);
        }
        if self.post_mortem_pending.swap(false, Ordering::AcqRel) {
            let _ = self.events.send(NotificationEvent::PostMortem);
        }
        if self.microseconds_pending.swap(false, Ordering::AcqRel) {
            let _ = self.events.send(NotificationEvent::MicrosecondsPerFrame(
                self.microseconds_per_frame(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let stats = CaptureStats::default();
        stats.ticks(3);
        stats.dropped_frames(1);
        stats.missed_ticks(0);
        let snap = stats.snapshot();
        assert_eq!(snap.ticks, 3);
        assert_eq!(snap.dropped_frames, 1);
        assert_eq!(snap.missed_ticks, 0);
    }

    #[test]
    fn test_frame_counting_fires_once() {
        let notifications = Notifications::new();
        let mut rx = notifications.subscribe();
        notifications.arm_frame_counting(2);

        assert!(!notifications.on_running_tick());
        assert!(notifications.on_running_tick());
        assert!(!notifications.on_running_tick());
        assert_eq!(notifications.frame_counting(), 0);

        notifications.publish_pending();
        assert_eq!(rx.try_recv().unwrap(), NotificationEvent::FrameCounting);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_post_mortem_latches() {
        let notifications = Notifications::new();
        assert!(notifications.raise_post_mortem());
        assert!(!notifications.raise_post_mortem());
        assert_eq!(notifications.post_mortem(), 1);
        notifications.clear_post_mortem();
        assert!(notifications.raise_post_mortem());
    }

    #[test]
    fn test_crop_target_published_directly() {
        let notifications = Notifications::new();
        let mut rx = notifications.subscribe();
        notifications.arm_crop_target();
        assert!(notifications.crop_target_outstanding());
        notifications.crop_target_reached();
        notifications.crop_target_reached();
        assert_eq!(rx.try_recv().unwrap(), NotificationEvent::OutputCropTargetReached);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_microseconds_change_pending() {
        let notifications = Notifications::new();
        let mut rx = notifications.subscribe();
        assert!(notifications.set_microseconds_per_frame(20_000));
        assert!(!notifications.set_microseconds_per_frame(20_000));
        notifications.publish_pending();
        assert_eq!(
            rx.try_recv().unwrap(),
            NotificationEvent::MicrosecondsPerFrame(20_000)
        );
    }
}
