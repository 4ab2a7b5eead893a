//! Output vsync synchronizer
//!
//! Woken from the tick context. Publishes pending client notifications and,
//! when the time base has moved, asks the presentation pipeline to align
//! its vsync to the capture schedule. The last stretch before the trigger
//! point is a bounded busy-wait since a timer cannot hit it to the
//! microsecond.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::device::Shared;

/// Delay from `now` until the next instant in phase with `trigger`.
///
/// The trigger is moved by whole frames into the window `[now, now +
/// frame]`. A trigger already in the past lands strictly after `now`.
pub(crate) fn next_trigger_delay(trigger: u64, now: u64, frame_duration_us: u64) -> u64 {
    let frame = frame_duration_us.max(1) as i64;
    let mut sleep = trigger as i64 - now as i64;
    let frames = if sleep < 0 {
        -sleep / frame + 1
    } else {
        -(sleep / frame)
    };
    sleep += frames * frame;
    sleep as u64
}

/// Phase of the output vsync relative to the schedule base time
struct Phase {
    trigger: u64,
    frame_duration_us: u64,
}

enum Wait {
    Reached,
    Rearmed,
    Stopped,
}

pub(crate) async fn run(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = shared.synchronizer_wake.notified() => {}
        }
        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        shared.notifications.publish_pending();

        while shared.synchronize.load(Ordering::Acquire) {
            if !synchronize_once(&shared, &mut shutdown).await {
                break;
            }
        }
    }
    debug!("Synchronizer task exiting");
}

fn phase(shared: &Shared) -> Phase {
    let session = shared.session.lock();
    let timing = session.timing();
    let frame_duration_us = timing.frame_duration_us();
    let mut trigger = (timing.base_time() + shared.config.video_latency_us)
        .saturating_sub(shared.config.sync_early_margin_us);
    let bottom_field_first = session
        .stream_info()
        .map(|s| s.interlaced && !s.top_field_first)
        .unwrap_or(false);
    if bottom_field_first {
        trigger += frame_duration_us / 2;
    }
    Phase {
        trigger,
        frame_duration_us,
    }
}

/// One synchronize attempt. Returns false when the task should stop.
async fn synchronize_once(shared: &Shared, shutdown: &mut watch::Receiver<bool>) -> bool {
    shared.synchronize.store(false, Ordering::Release);

    let phase = phase(shared);
    let now = shared.clock.now_us();
    let expected_wake = now + next_trigger_delay(phase.trigger, now, phase.frame_duration_us);

    match wait_until(shared, shutdown, expected_wake).await {
        Wait::Stopped => return false,
        Wait::Rearmed => return true,
        Wait::Reached => {}
    }

    if let Err(e) = shared.pipeline.synchronize_now().await {
        warn!("Output vsync synchronize failed: {}", e);
        return true;
    }

    let late = shared.clock.now_us().saturating_sub(expected_wake);
    if late > shared.config.sync_late_threshold_us {
        warn!("Synchronize ran {} us late, retrying", late);
        shared.stats.sync_retries(1);
        shared.synchronize.store(true, Ordering::Release);
    } else {
        debug!("Output vsync synchronized at {}", expected_wake);
        shared.stats.synchronizations(1);
    }
    true
}

/// Sleep until shortly before `deadline`, then spin onto it
async fn wait_until(shared: &Shared, shutdown: &mut watch::Receiver<bool>, deadline: u64) -> Wait {
    let spin_window = shared.config.sync_spin_window_us;
    let coarse = deadline
        .saturating_sub(spin_window)
        .saturating_sub(shared.clock.now_us());
    if coarse > 0 {
        tokio::select! {
            biased;
            _ = shutdown.changed() => return Wait::Stopped,
            _ = tokio::time::sleep(Duration::from_micros(coarse)) => {}
        }
    }

    // The spin is bounded in real time as well, so a clock that stalls
    // cannot hold the task here
    let spin_limit = Instant::now() + Duration::from_micros(spin_window + 1000);
    while shared.clock.now_us() < deadline && Instant::now() < spin_limit {
        if !shared.running.load(Ordering::Acquire) {
            return Wait::Stopped;
        }
        if shared.synchronize.load(Ordering::Acquire) {
            return Wait::Rearmed;
        }
        std::hint::spin_loop();
    }
    if !shared.running.load(Ordering::Acquire) {
        return Wait::Stopped;
    }
    Wait::Reached
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_future_trigger_within_one_frame() {
        assert_eq!(next_trigger_delay(1_005_000, 1_000_000, 20_000), 5000);
        assert_eq!(next_trigger_delay(1_065_000, 1_000_000, 20_000), 5000);
    }

    #[test]
    fn test_past_trigger_moves_forward() {
        assert_eq!(next_trigger_delay(995_000, 1_000_000, 20_000), 15_000);
        assert_eq!(next_trigger_delay(900_000, 1_000_000, 20_000), 20_000);
    }

    #[test]
    fn test_trigger_now_fires_at_once() {
        assert_eq!(next_trigger_delay(1_000_000, 1_000_000, 20_000), 0);
    }

    #[test]
    fn test_delay_always_within_one_frame() {
        for offset in (0..200_000u64).step_by(777) {
            let delay = next_trigger_delay(500_000 + offset, 600_000, 16_683);
            assert!(delay <= 16_683, "offset {} gave {}", offset, delay);
            assert_eq!((600_000 + delay) as i64 % 16_683, (500_000 + offset) as i64 % 16_683);
        }
    }
}
