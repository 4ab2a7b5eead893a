//! DVP Capture Simulator - Main Entry Point
//!
//! Locks a capture device to a simulated source, lets it run for the
//! configured number of ticks and prints the final counters as JSON.

mod settings;
mod source;

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use dvp_capture::{CaptureDevice, ManualClock, SimulatedPipeline, SurfaceFormat};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use settings::SimSettings;
use source::SimulatedSource;

/// Simulated clock origin (us)
const START_US: u64 = 1_000_000;

/// Ancillary buffers cycled by the reader task
const ANCILLARY_BUFFERS: usize = 4;
const ANCILLARY_BUFFER_SIZE: usize = 256;

/// Initialize logging
fn init_logging(level: &str) -> anyhow::Result<()> {
    let level = Level::from_str(level).unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = SimSettings::load().context("Failed to load capture settings")?;
    init_logging(&settings.log_level)?;

    info!("=== DVP Capture Simulator v{} ===", env!("CARGO_PKG_VERSION"));

    let format = SurfaceFormat::for_bytes_per_pixel(settings.engine.bytes_per_pixel);
    let pipeline = Arc::new(SimulatedPipeline::new(format));
    let clock = Arc::new(ManualClock::new(START_US));
    let device = Arc::new(
        CaptureDevice::open(settings.engine.clone(), pipeline.clone(), clock.clone())
            .context("Failed to open capture device")?,
    );

    device.start()?;
    let reader = if settings.source.ancillary {
        Some(spawn_ancillary_reader(device.clone())?)
    } else {
        None
    };
    let notifier = spawn_notification_logger(&device);
    device.set_mode(settings.mode)?;

    let stop = Arc::new(AtomicBool::new(false));
    let source = SimulatedSource {
        device: device.clone(),
        pipeline: pipeline.clone(),
        clock,
        settings: settings.clone(),
        stop: stop.clone(),
    };
    let mut source = tokio::task::spawn_blocking(move || source.run());

    let report = tokio::select! {
        report = &mut source => report?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping source");
            stop.store(true, Ordering::Release);
            source.await?
        }
    };

    info!(
        "Source delivered {} ticks ({} skipped), device {}",
        report.delivered,
        report.skipped,
        device.state()
    );

    device.stop().await?;
    if let Some(reader) = reader {
        let captured = reader.await?;
        info!("Ancillary reader received {} buffers", captured);
    }
    notifier.abort();

    if pipeline.held_buffers() > 0 {
        warn!("{} decode buffers still held downstream", pipeline.held_buffers());
    }

    let stats = device.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

/// Dequeue filled ancillary buffers and hand them straight back
fn spawn_ancillary_reader(
    device: Arc<CaptureDevice>,
) -> anyhow::Result<tokio::task::JoinHandle<u64>> {
    let queue = device.ancillary().clone();
    queue.request_buffers(ANCILLARY_BUFFERS, ANCILLARY_BUFFER_SIZE)?;
    for index in 0..ANCILLARY_BUFFERS {
        queue.queue_buffer(index)?;
    }
    queue.stream_on()?;

    Ok(tokio::spawn(async move {
        let mut captured = 0;
        while let Ok(index) = queue.dequeue(true).await {
            match queue.read_buffer(index) {
                Ok(data) => debug!("Ancillary buffer {} carried {} bytes", index, data.len()),
                Err(e) => warn!("Failed to read ancillary buffer {}: {}", index, e),
            }
            captured += 1;
            if let Err(e) = queue.queue_buffer(index) {
                warn!("Failed to requeue ancillary buffer {}: {}", index, e);
            }
        }
        captured
    }))
}

fn spawn_notification_logger(device: &CaptureDevice) -> tokio::task::JoinHandle<()> {
    let mut events = device.notifications().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!("Notification: {:?}", event),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} notifications", missed),
                Err(RecvError::Closed) => break,
            }
        }
    })
}
