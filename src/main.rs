//! Sightline vision appliance

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use tracing::{info, warn};

use sightline::capture::{
    CaptureHandle, CaptureThread, FrameBufferPool, TestPatternDriver, NR_FRAME_BUFFERS,
};
use sightline::ipc::{
    self, ApplicationState, IpcReply, IpcRequest, Param, PeerEndpoint, STATUS_RECORD_LEN,
};
use sightline::pipeline::{ProcessingController, ThresholdProcessor};
use sightline::{utils, CameraSource, Config, CONFIG_ENV};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// TOML configuration file
    #[arg(long, env = CONFIG_ENV)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    utils::init_tracing(&config.logging.filter);

    info!("Sightline launching...");
    info!("Using camera: {:?}", config.camera.source());

    let geometry = config.geometry();
    let (pool, capture) = FrameBufferPool::new(
        NR_FRAME_BUFFERS,
        geometry.raw_frame_len(),
        config.camera.max_capture_stalls,
    )?;
    let capture = spawn_capture(&config, capture)?;

    let (transport, peer) = ipc::pair(config.ipc.reply_slots);
    let processor = ThresholdProcessor::new(geometry, config.processing.background_weight);
    let mut controller =
        ProcessingController::new(pool, transport, processor, &config).with_capture(capture);
    let shutdown = controller.shutdown_handle();
    let status = controller.status();

    let pin_core = config.control.pin_core;
    let mut control = tokio::task::spawn_blocking(move || {
        if let Some(core) = pin_core {
            utils::pin_current_thread(core);
        }
        controller.state_control()
    });

    // Spawn status poller
    let poller = (config.ipc.status_poll_ms > 0).then(|| {
        tokio::spawn(poll_status(
            peer.clone(),
            Duration::from_millis(config.ipc.status_poll_ms),
        ))
    });

    let result = tokio::select! {
        result = &mut control => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupt received, shutting down");
            shutdown.store(true, Ordering::Release);
            control.await?
        }
    };

    if let Some(poller) = poller {
        poller.abort();
    }
    drop(peer);

    let last = status.load();
    info!(
        frame = last.frame_sequence,
        cycles = last.cycles,
        "Sightline shutting down"
    );
    result.map_err(Into::into)
}

fn spawn_capture(config: &Config, capture: CaptureHandle) -> Result<CaptureThread> {
    let geometry = config.geometry();
    let thread = match config.camera.source() {
        CameraSource::TestPattern => {
            CaptureThread::spawn(TestPatternDriver::new(geometry, config.camera.fps), capture)?
        }
        #[cfg(feature = "v4l2")]
        CameraSource::Auto => {
            let path = utils::auto_detect_device()?;
            CaptureThread::spawn(sightline::capture::V4l2Driver::open(&path, geometry)?, capture)?
        }
        #[cfg(feature = "v4l2")]
        CameraSource::Device(path) => CaptureThread::spawn(
            sightline::capture::V4l2Driver::open(&path.to_string_lossy(), geometry)?,
            capture,
        )?,
        #[cfg(not(feature = "v4l2"))]
        source => return Err(color_eyre::eyre::eyre!("{:?} needs the v4l2 feature", source)),
    };
    Ok(thread)
}

/// Ask for the status record every `period` and log it.
async fn poll_status(peer: PeerEndpoint, period: Duration) {
    let mut interval = tokio::time::interval(period);
    let mut tag = 0;
    loop {
        interval.tick().await;
        tag += 1;
        let request = IpcRequest::get(tag, Param::AppState, STATUS_RECORD_LEN);
        if let Err(e) = peer.send_async(request).await {
            warn!("Status poller stopping: {}", e);
            return;
        }
        match peer.recv_async().await {
            Ok(IpcReply::Ack { payload, .. }) => {
                if let Some(state) = ApplicationState::decode(&payload) {
                    info!(
                        frame = state.frame_sequence,
                        cycles = state.cycles,
                        threshold = state.threshold,
                        perspective = ?state.perspective,
                        "Status"
                    );
                }
            }
            Ok(IpcReply::Nack { reason, .. }) => warn!("Status request refused: {}", reason),
            Err(e) => {
                warn!("Status poller stopping: {}", e);
                return;
            }
        }
    }
}
