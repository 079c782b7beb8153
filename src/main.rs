//! Camera adapter demo session against the simulated component

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use camera_adapter::component::SimComponent;
use camera_adapter::{utils, CameraAdapter, CameraBuffer, Notification, PortId, CONFIG};
use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const PREVIEW_BUFFERS: usize = 6;
const PREVIEW_QUEUEABLE: usize = 4;
const IMAGE_BUFFERS: usize = 4;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = utils::load_config(config_path.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("camera adapter launching");
    CONFIG.store(Arc::new(config.clone()));

    let component = SimComponent::new(config.simulator.clone());
    let adapter = Arc::new(CameraAdapter::new(component, config.adapter.clone())?);

    // consumer side: hand every frame straight back
    let frames = adapter.frames();
    let consumer = Arc::clone(&adapter);
    let frame_task = tokio::spawn(async move {
        while let Ok(frame) = frames.recv_async().await {
            debug!(
                kind = ?frame.frame_type,
                seq = frame.meta.sequence,
                bytes = frame.meta.filled_len,
                "frame"
            );
            if let Err(e) = consumer.fill_this_buffer(&frame.buffer, frame.frame_type) {
                warn!(error = %e, "buffer return failed");
            }
        }
    });

    let session_adapter = Arc::clone(&adapter);
    let session = tokio::task::spawn_blocking(move || run_session(&session_adapter));

    let outcome = tokio::select! {
        joined = session => joined.map_err(|e| eyre!(e))?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    };

    frame_task.abort();
    let _ = frame_task.await;

    let metrics = adapter.metrics();
    info!(?metrics, "session finished");
    tokio::task::spawn_blocking(move || drop(adapter)).await?;

    outcome
}

fn run_session(adapter: &CameraAdapter) -> Result<()> {
    let events = adapter.events();

    let preview = adapter.get_frame_size()?;
    info!(?preview, "preview geometry");
    let preview_pool = CameraBuffer::pool(1, PREVIEW_BUFFERS, preview.buffer_size);
    adapter.use_buffers(PortId::Preview, &preview_pool, PREVIEW_QUEUEABLE)?;
    adapter.start_preview()?;

    let picture = adapter.get_picture_buffer_size(IMAGE_BUFFERS)?;
    info!(?picture, "picture geometry");
    let image_pool = CameraBuffer::pool(100, IMAGE_BUFFERS, picture.buffer_size);
    adapter.use_buffers(PortId::Image, &image_pool, 0)?;

    adapter.auto_focus()?;
    wait_for(&events, |n| matches!(n, Notification::Focus { .. }), Duration::from_secs(2));

    let mut params = adapter.parameters();
    params.picture.burst = 3;
    adapter.set_parameters(params.clone())?;
    adapter.take_picture()?;
    wait_for_capture(&events)?;

    params.picture.burst = 5;
    params.picture.bracketing = "-2,0,2".into();
    adapter.set_parameters(params.clone())?;
    adapter.take_picture()?;
    wait_for_capture(&events)?;

    params.picture.burst = 1;
    params.picture.bracketing.clear();
    adapter.set_parameters(params)?;
    adapter.start_bracketing(2)?;
    std::thread::sleep(Duration::from_millis(100));
    adapter.take_picture()?;
    wait_for_capture(&events)?;
    adapter.stop_bracketing()?;

    adapter.stop_preview()?;
    Ok(())
}

fn wait_for_capture(events: &flume::Receiver<Notification>) -> Result<()> {
    let outcome = wait_for(
        events,
        |n| matches!(n, Notification::CaptureComplete { .. } | Notification::CaptureFailed { .. }),
        Duration::from_secs(10),
    );
    match outcome {
        Some(Notification::CaptureComplete { frames }) => {
            info!(frames, "capture complete");
            Ok(())
        }
        Some(Notification::CaptureFailed { error }) => Err(eyre!(error)),
        _ => Err(eyre!("capture did not complete")),
    }
}

/// Log notifications until one matches `pred` or `timeout` passes
fn wait_for(
    events: &flume::Receiver<Notification>,
    pred: impl Fn(&Notification) -> bool,
    timeout: Duration,
) -> Option<Notification> {
    let deadline = Instant::now() + timeout;
    while let Ok(n) = events.recv_deadline(deadline) {
        info!(notification = ?n, "event");
        if pred(&n) {
            return Some(n);
        }
    }
    warn!("timed out waiting for notification");
    None
}
