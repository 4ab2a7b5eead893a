//! Injector task
//!
//! Keeps decode slots scheduled ahead of capture, bounded by the
//! bounded-ahead semaphore, and hands every filled slot to the
//! presentation pipeline with its presentation timestamp.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use frame_timing::micros_to_pts;
use ring_buffer::Injectable;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::device::Shared;
use crate::error::CaptureError;
use crate::mode::{ModeParams, StreamInfo};
use crate::pipeline::{BufferId, InjectPacket, SurfaceFormat};
use crate::session::CaptureSlot;

pub(crate) async fn run(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();

    loop {
        let Some(mode) = wait_for_mode(&shared, &mut shutdown).await else {
            break;
        };

        if let Err(e) = capture_sequence(&shared, mode, &mut shutdown).await {
            warn!("Capture sequence in {} ended: {}", mode.name, e);
        }
        finish(&shared).await;

        if !shared.running.load(Ordering::Acquire) {
            break;
        }
    }
    debug!("Injector task exiting");
}

async fn wait_for_mode(
    shared: &Shared,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<&'static ModeParams> {
    loop {
        if !shared.running.load(Ordering::Acquire) {
            return None;
        }
        shared.fast_mode_switch.store(false, Ordering::Release);
        let requested = shared.requested_mode.lock().take();
        if let Some(mode) = requested {
            return Some(mode);
        }
        tokio::select! {
            biased;
            _ = shutdown.changed() => return None,
            _ = shared.mode_changed.notified() => {}
        }
    }
}

async fn capture_sequence(
    shared: &Shared,
    mode: &'static ModeParams,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), CaptureError> {
    shared
        .scaling
        .lock()
        .configure_mode(mode.active_width, mode.active_height, mode.is_interlaced());
    let initial_permits = {
        let mut session = shared.session.lock();
        session.configure_mode(mode);
        session.startup()?
    };
    shared
        .ancillary
        .set_applied_latency(shared.config.applied_latency_us());
    shared.ahead.forget_permits(shared.ahead.available_permits());
    shared.ahead.add_permits(initial_permits as usize);
    info!("Capture sequence starting in {}", mode.name);

    if !wait_until_started(shared, shutdown).await {
        return Ok(());
    }

    get_buffer(shared).await?;
    inject_filled(shared).await?;
    shared.session.lock().request_run();

    loop {
        let permit = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            permit = shared.ahead.acquire() => permit,
        };
        match permit {
            Ok(permit) => permit.forget(),
            Err(_) => break,
        }
        if shared.should_exit() {
            break;
        }

        {
            let mut scaling = shared.scaling.lock();
            if scaling.is_stepping() {
                scaling.perform_step();
            }
        }

        get_buffer(shared).await?;
        inject_filled(shared).await?;
    }
    Ok(())
}

/// Wait for warm-up to finish. False if the sequence was abandoned first.
async fn wait_until_started(shared: &Shared, shutdown: &mut watch::Receiver<bool>) -> bool {
    loop {
        if shared.should_exit() {
            return false;
        }
        let locked = shared.session.lock().state().is_locked();
        if locked {
            return true;
        }
        tokio::select! {
            biased;
            _ = shutdown.changed() => return false,
            _ = shared.injector_wake.notified() => {}
        }
    }
}

/// Obtain a decode buffer and schedule it with the current scaling
async fn get_buffer(shared: &Shared) -> Result<(), CaptureError> {
    shared.session.lock().ensure_slot()?;
    let scaling = shared.scaling.lock().next();
    let format = SurfaceFormat::for_bytes_per_pixel(shared.config.bytes_per_pixel);

    let buffer = shared
        .pipeline
        .allocate_decode_buffer(format, scaling.width, scaling.height)
        .await?;

    let committed = shared
        .session
        .lock()
        .commit_slot(CaptureSlot { buffer, scaling });
    if let Err(e) = committed {
        release(shared, buffer.id).await;
        return Err(e);
    }
    Ok(())
}

/// Hand every filled slot downstream, oldest first
async fn inject_filled(shared: &Shared) -> Result<(), CaptureError> {
    loop {
        let (ready, stream, base_time) = {
            let mut session = shared.session.lock();
            (
                session.take_injectable(),
                session.stream_info(),
                session.timing().base_time(),
            )
        };
        let Some(ready) = ready else {
            return Ok(());
        };
        let Some(stream) = stream else {
            release(shared, ready.payload.buffer.id).await;
            return Err(CaptureError::NoMode);
        };
        inject(shared, ready, stream, base_time).await?;
    }
}

async fn inject(
    shared: &Shared,
    ready: Injectable<CaptureSlot>,
    stream: StreamInfo,
    base_time: u64,
) -> Result<(), CaptureError> {
    let slot = ready.payload;
    let packet = InjectPacket {
        buffer: slot.buffer.id,
        stream,
        width: slot.scaling.width,
        height: slot.scaling.height,
        input_window: slot.scaling.input_window,
        output_window: slot.scaling.output_window,
        expected_fill_time: ready.expected_fill_time,
    };
    let pts = micros_to_pts(ready.expected_fill_time + shared.config.applied_latency_us());

    let mapped = shared
        .pipeline
        .set_external_time_mapping(micros_to_pts(base_time), base_time)
        .await;
    let injected = match mapped {
        Ok(()) => shared.pipeline.inject_buffer(&packet, pts).await,
        Err(e) => Err(e),
    };
    release(shared, slot.buffer.id).await;
    injected?;

    shared.stats.injected_buffers(1);
    Ok(())
}

async fn release(shared: &Shared, buffer: BufferId) {
    if let Err(e) = shared.pipeline.return_decode_buffer(buffer).await {
        warn!("Failed to return decode buffer {}: {}", buffer.0, e);
        shared.stats.release_failures(1);
    }
}

/// Halt capture, let the pipeline drain and return every buffer still held
async fn finish(shared: &Shared) {
    shared.session.lock().halt();

    let timeout = Duration::from_millis(shared.config.drain_timeout_ms);
    if let Err(e) = shared.pipeline.drain(timeout).await {
        warn!("Presentation pipeline did not drain: {}", e);
    }

    let leftover = shared.session.lock().drain_uninjected();
    if !leftover.is_empty() {
        debug!("Returning {} uninjected decode buffers", leftover.len());
    }
    for slot in leftover {
        release(shared, slot.buffer.id).await;
    }
}
