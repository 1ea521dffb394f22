//! The appliance control loop

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use crate::capture::driver::CaptureThread;
use crate::capture::pool::{FrameBufferPool, FrameHandle, CAMERA_TIMEOUT};
use crate::error::{Error, NackReason, Result};
use crate::ipc::channel::{IpcRequestChannel, RequestService, RequestState};
use crate::ipc::request::{IpcRequest, Param};
use crate::ipc::response::ResponseArea;
use crate::ipc::state::{ApplicationState, Perspective, SharedStatus};
use crate::ipc::transport::Transport;
use crate::overlay::{Color, DrawCommandQueue, Font};
use crate::pipeline::artifacts::ImageArtifactStore;
use crate::pipeline::processor::{FrameProcessor, ProcessingContext};
use crate::Config;

/// Steps of one control cycle, run in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitFrame,
    Process,
    ServiceIpc,
    Acknowledge,
}

/// Owns everything a processing cycle touches and drives the cycles.
///
/// Barring a fatal error the loop never exits. Resources are released by
/// [`ProcessingController::unload`] on every exit path.
pub struct ProcessingController<T: Transport, P: FrameProcessor> {
    pool: FrameBufferPool,
    artifacts: ImageArtifactStore,
    overlay: DrawCommandQueue,
    channel: IpcRequestChannel<T>,
    processor: P,
    state: ApplicationState,
    status: SharedStatus,
    phase: Phase,
    /// Frame borrowed between AwaitFrame and Process
    frame: Option<FrameHandle>,
    capture_timeout: Duration,
    capture: Option<CaptureThread>,
    shutdown: Arc<AtomicBool>,
    unloaded: bool,
}

impl<T: Transport, P: FrameProcessor> ProcessingController<T, P> {
    pub fn new(pool: FrameBufferPool, transport: T, processor: P, config: &Config) -> Self {
        let geometry = config.geometry();
        let state = config.initial_state();
        Self {
            pool,
            artifacts: ImageArtifactStore::new(geometry),
            overlay: DrawCommandQueue::new(config.overlay.max_commands),
            channel: IpcRequestChannel::new(transport),
            processor,
            status: SharedStatus::new(state.clone()),
            state,
            phase: Phase::AwaitFrame,
            frame: None,
            capture_timeout: CAMERA_TIMEOUT,
            capture: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            unloaded: false,
        }
    }

    /// Hand over the capture thread so that unloading stops it.
    pub fn with_capture(mut self, capture: CaptureThread) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn with_capture_timeout(mut self, timeout: Duration) -> Self {
        self.capture_timeout = timeout;
        self
    }

    /// Setting the flag ends [`ProcessingController::state_control`] after
    /// the current step.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &ApplicationState {
        &self.state
    }

    pub fn artifacts(&self) -> &ImageArtifactStore {
        &self.artifacts
    }

    pub fn overlay(&self) -> &DrawCommandQueue {
        &self.overlay
    }

    pub fn channel_state(&self) -> RequestState {
        self.channel.state()
    }

    pub fn is_unloaded(&self) -> bool {
        self.unloaded
    }

    /// Run cycles until a fatal error or shutdown, then unload.
    pub fn state_control(&mut self) -> Result<()> {
        info!(capture_timeout = ?self.capture_timeout, "Entering state control");
        let result = self.run();
        if let Err(e) = &result {
            error!("State control stopped: {}", e);
        }
        let unloaded = self.unload();
        result.and(unloaded)
    }

    fn run(&mut self) -> Result<()> {
        while !self.shutdown.load(Ordering::Acquire) {
            self.step()?;
        }
        info!(cycles = self.state.cycles, "Shutdown requested");
        Ok(())
    }

    /// Run the current phase and move on to the next one.
    pub fn step(&mut self) -> Result<Phase> {
        let next = match self.phase {
            Phase::AwaitFrame => self.await_frame()?,
            Phase::Process => {
                self.process_frame()?;
                Phase::ServiceIpc
            }
            Phase::ServiceIpc => {
                self.service_ipc()?;
                Phase::Acknowledge
            }
            Phase::Acknowledge => {
                match self.channel.acknowledge() {
                    Ok(()) | Err(Error::TransportBusy) => {}
                    Err(e) => return Err(e),
                }
                Phase::AwaitFrame
            }
        };
        self.phase = next;
        Ok(next)
    }

    fn await_frame(&mut self) -> Result<Phase> {
        match self.pool.try_acquire_ready(self.capture_timeout) {
            Ok(frame) => {
                self.frame = Some(frame);
                Ok(Phase::Process)
            }
            Err(Error::Timeout) => {
                if self.capture.as_ref().is_some_and(|c| !c.is_running()) {
                    return Err(Error::fault("capture thread stopped"));
                }
                Ok(Phase::ServiceIpc)
            }
            Err(e) => Err(e),
        }
    }

    /// Run the processing step on the acquired frame, then release it.
    ///
    /// Does nothing when no frame was acquired this cycle.
    #[instrument(level = "trace", skip(self))]
    pub fn process_frame(&mut self) -> Result<()> {
        let Some(frame) = self.frame.take() else {
            return Ok(());
        };
        if self.state.reset_pending || self.state.exposure_changed {
            self.reset_process();
        }
        self.overlay.clear();

        let started = Instant::now();
        let result = {
            let raw = frame.lock()?;
            let mut ctx = ProcessingContext {
                artifacts: &mut self.artifacts,
                overlay: &mut self.overlay,
                state: &self.state,
            };
            self.processor
                .process(&raw, &mut ctx)
                .map(|()| raw.meta().sequence)
        };
        self.pool.release(frame);

        match result {
            Ok(sequence) => {
                self.state.frame_sequence = sequence;
                metrics::counter!("frames_processed").increment(1);
            }
            Err(e @ Error::UnrecoverableFault(_)) => return Err(e),
            Err(e) => warn!("Processing failed: {}", e),
        }
        metrics::histogram!("processing_time_us").record(started.elapsed().as_micros() as f64);

        self.state.cycles += 1;
        self.status.publish(&self.state);
        Ok(())
    }

    /// Blank every artifact, drop queued overlays and clear the reset flags.
    pub fn reset_process(&mut self) {
        info!(
            reset_pending = self.state.reset_pending,
            exposure_changed = self.state.exposure_changed,
            "Resetting processing"
        );
        self.artifacts.reset_all();
        self.overlay.clear();
        self.processor.reset();
        self.state.reset_pending = false;
        self.state.exposure_changed = false;
        self.status.publish(&self.state);
    }

    fn service_ipc(&mut self) -> Result<()> {
        let Some(param_id) = self.channel.check_for_request()? else {
            return Ok(());
        };

        let before = self.state.clone();
        let mut responder = Responder {
            artifacts: &mut self.artifacts,
            overlay: &mut self.overlay,
            state: &mut self.state,
        };
        self.channel.service_request(param_id, &mut responder)?;
        if self.state != before {
            self.status.publish(&self.state);
        }
        Ok(())
    }

    pub fn draw_bounding_box(
        &mut self,
        left: i32,
        bottom: i32,
        right: i32,
        top: i32,
        filled: bool,
        color: Color,
    ) -> bool {
        self.overlay
            .enqueue_box(left, bottom, right, top, filled, color)
    }

    pub fn draw_line(&mut self, x1: i32, y1: i32, x2: i32, y2: i32, color: Color) -> bool {
        self.overlay.enqueue_line(x1, y1, x2, y2, color)
    }

    pub fn draw_string(
        &mut self,
        x: i32,
        y: i32,
        len: usize,
        font: Font,
        color: Color,
        text: &str,
    ) -> bool {
        self.overlay.enqueue_string(x, y, len, font, color, text)
    }

    /// Stop capture and release every buffer. Safe to call more than once.
    pub fn unload(&mut self) -> Result<()> {
        if self.unloaded {
            return Ok(());
        }
        self.unloaded = true;
        self.shutdown.store(true, Ordering::Release);
        self.frame = None;

        let mut result = Ok(());
        if let Some(mut capture) = self.capture.take() {
            result = capture.stop();
        }
        if self.channel.state() != RequestState::Idle {
            if let Err(e) = self.channel.acknowledge() {
                debug!("Dropping undelivered reply: {}", e);
            }
        }
        self.overlay.clear();
        self.artifacts.reset_all();

        let stats = self.pool.stats();
        info!(
            cycles = self.state.cycles,
            captured = stats.captured,
            superseded = stats.superseded,
            stalls = stats.stalls,
            "Unloaded"
        );
        result
    }
}

impl<T: Transport, P: FrameProcessor> Drop for ProcessingController<T, P> {
    fn drop(&mut self) {
        if let Err(e) = self.unload() {
            warn!("Unload failed: {}", e);
        }
    }
}

/// Answers requests from the controller's artifacts and state.
struct Responder<'a> {
    artifacts: &'a mut ImageArtifactStore,
    overlay: &'a mut DrawCommandQueue,
    state: &'a mut ApplicationState,
}

fn invalid(argument: i64) -> Error {
    Error::InvalidRequest(NackReason::InvalidArgument(argument))
}

impl RequestService for Responder<'_> {
    fn respond(&mut self, request: &IpcRequest, param: Param, area: &mut ResponseArea) -> Result<()> {
        let argument = request.argument;
        match param {
            Param::AppState => area.send_status(self.state),
            Param::Threshold => area.send_i32(self.state.threshold),
            Param::Image(kind) => {
                if kind.is_reserved() {
                    return Err(Error::InvalidRequest(NackReason::ReservedSlot));
                }
                // Refuse before compositing so the queue survives for a retry
                let len = self.artifacts.read(kind).pixels().len();
                if len > area.capacity() {
                    return Err(Error::InvalidRequest(NackReason::PayloadTooLarge {
                        len,
                        capacity: area.capacity(),
                    }));
                }
                let image = self.artifacts.composite(kind, self.overlay)?;
                area.send_image(image.pixels(), len)
            }
            Param::SetThreshold => {
                if !(0..=255).contains(&argument) {
                    return Err(invalid(argument));
                }
                self.state.threshold = argument as i32;
                Ok(())
            }
            Param::SetExposureTime => {
                let exposure = u32::try_from(argument)
                    .ok()
                    .filter(|us| *us > 0)
                    .ok_or_else(|| invalid(argument))?;
                if exposure != self.state.exposure_time_us {
                    self.state.exposure_time_us = exposure;
                    self.state.exposure_changed = true;
                }
                Ok(())
            }
            Param::SetPerspective => {
                let perspective = Perspective::from_code(argument).ok_or_else(|| invalid(argument))?;
                self.state.perspective = perspective;
                Ok(())
            }
            Param::ResetProcessing => {
                self.state.reset_pending = true;
                Ok(())
            }
        }
    }
}
