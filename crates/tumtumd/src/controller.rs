//! Challenge coordinator.
//!
//! One tokio task owns the lifecycle, the session and the media pipeline.
//! Commands from the control surface, frames from the media thread and
//! completions from detection and network tasks all arrive here over
//! channels, so phase changes are never made from two places at once.
//!
//! Every asynchronous job is tagged with the epoch it was issued under. The
//! epoch moves forward whenever a challenge starts or stops, and completions
//! from an older epoch are dropped unread.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tumtum_core::{
    ChallengeLifecycle, ChallengeSession, DetectionResult, Frame, LifecycleError, MessageLevel,
    Notifier, OverlayDrawData, OverlayState, Phase,
};

use crate::backend::{BackendError, Verdict, VerificationBackend};
use crate::config::BackendKind;
use crate::engine::DetectionPool;
use crate::pipeline::{self, FrameSink, MediaPipeline, PipelineBuildError, RunningPipeline};

const COMMAND_QUEUE: usize = 16;

/// Best-effort frame uploads allowed in flight at once. Frames past the cap
/// are not uploaded; the frame that carries the verify call always is.
const MAX_UPLOADS_IN_FLIGHT: usize = 2;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("challenge coordinator is not running")]
    Closed,
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Pipeline(#[from] PipelineBuildError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Builds the backend client for a provider.
pub type BackendFactory =
    Box<dyn Fn(BackendKind) -> Result<Arc<dyn VerificationBackend>, BackendError> + Send>;

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub device: String,
    pub backend: BackendKind,
    pub jpeg_quality: u8,
    pub shutdown_timeout: Duration,
    /// Frames buffered between the media thread and the coordinator.
    pub frame_queue: usize,
}

/// Snapshot published after every coordinator step.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControllerStatus {
    pub phase: Option<Phase>,
    pub session_id: Option<String>,
    pub backend: String,
    pub device: String,
    pub last_verdict: Option<Verdict>,
    pub last_error: Option<String>,
    pub overlay: OverlayDrawData,
}

type Reply<T> = oneshot::Sender<Result<T, ControllerError>>;

enum Command {
    Start(Reply<()>),
    Stop(Reply<()>),
    SwitchDevice(String, Reply<()>),
    SwitchBackend(BackendKind, Reply<()>),
    Shutdown(oneshot::Sender<()>),
}

enum Completion {
    Detection {
        epoch: u64,
        result: Option<DetectionResult>,
    },
    Started {
        epoch: u64,
        result: Result<ChallengeSession, BackendError>,
    },
    Verified {
        epoch: u64,
        result: Result<Verdict, BackendError>,
    },
}

/// Clone-safe handle to the coordinator task.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Command>,
    status: watch::Receiver<ControllerStatus>,
}

impl ControllerHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| ControllerError::Closed)?;
        rx.await.map_err(|_| ControllerError::Closed)?
    }

    pub async fn start(&self) -> Result<(), ControllerError> {
        self.request(Command::Start).await
    }

    pub async fn stop(&self) -> Result<(), ControllerError> {
        self.request(Command::Stop).await
    }

    pub async fn switch_device(&self, device: String) -> Result<(), ControllerError> {
        self.request(|reply| Command::SwitchDevice(device, reply))
            .await
    }

    pub async fn switch_backend(&self, kind: BackendKind) -> Result<(), ControllerError> {
        self.request(|reply| Command::SwitchBackend(kind, reply))
            .await
    }

    pub fn status(&self) -> ControllerStatus {
        self.status.borrow().clone()
    }

    /// Stop everything and wait for the coordinator to finish tearing down.
    pub async fn shutdown(&self) -> Result<(), ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown(reply))
            .await
            .map_err(|_| ControllerError::Closed)?;
        rx.await.map_err(|_| ControllerError::Closed)
    }
}

struct Controller {
    commands: mpsc::Receiver<Command>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    frame_sink: FrameSink,
    frames: mpsc::Receiver<Frame>,

    pool: Option<DetectionPool>,
    media: Arc<dyn MediaPipeline>,
    pipeline: Option<Box<dyn RunningPipeline>>,
    make_backend: BackendFactory,
    backend: Arc<dyn VerificationBackend>,
    backend_kind: BackendKind,
    uploads: Arc<Semaphore>,
    notifier: Arc<dyn Notifier>,
    overlay: OverlayState,

    lifecycle: ChallengeLifecycle,
    session: Option<Arc<ChallengeSession>>,
    epoch: u64,
    detecting: bool,
    verify_armed: bool,

    device: String,
    jpeg_quality: u8,
    shutdown_timeout: Duration,
    last_verdict: Option<Verdict>,
    last_error: Option<String>,
    status: watch::Sender<ControllerStatus>,
}

/// Spawn the coordinator on the current tokio runtime.
pub fn spawn(
    options: ControllerOptions,
    pool: DetectionPool,
    media: Arc<dyn MediaPipeline>,
    make_backend: BackendFactory,
    notifier: Arc<dyn Notifier>,
) -> Result<(ControllerHandle, JoinHandle<()>), ControllerError> {
    let backend = make_backend(options.backend)?;
    let (tx, commands) = mpsc::channel(COMMAND_QUEUE);
    let (completions_tx, completions) = mpsc::unbounded_channel();
    let (frame_sink, frames) = FrameSink::channel(options.frame_queue);
    let (status, status_rx) = watch::channel(ControllerStatus {
        backend: options.backend.to_string(),
        device: options.device.clone(),
        ..Default::default()
    });

    let controller = Controller {
        commands,
        completions_tx,
        completions,
        frame_sink,
        frames,
        pool: Some(pool),
        media,
        pipeline: None,
        make_backend,
        backend,
        backend_kind: options.backend,
        uploads: Arc::new(Semaphore::new(MAX_UPLOADS_IN_FLIGHT)),
        notifier,
        overlay: OverlayState::new(),
        lifecycle: ChallengeLifecycle::new(),
        session: None,
        epoch: 0,
        detecting: false,
        verify_armed: false,
        device: options.device,
        jpeg_quality: options.jpeg_quality,
        shutdown_timeout: options.shutdown_timeout,
        last_verdict: None,
        last_error: None,
        status,
    };
    let task = tokio::spawn(controller.run());
    Ok((
        ControllerHandle {
            tx,
            status: status_rx,
        },
        task,
    ))
}

impl Controller {
    async fn run(mut self) {
        tracing::debug!("challenge coordinator started");
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        self.teardown().await;
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Some(done) = self.completions.recv() => self.handle_completion(done),
                Some(frame) = self.frames.recv() => self.handle_frame(frame),
            }
            self.publish();
        }
        tracing::debug!("challenge coordinator stopped");
    }

    /// Returns `false` once the coordinator should exit.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start(reply) => {
                let _ = reply.send(self.start_challenge());
            }
            Command::Stop(reply) => {
                let _ = reply.send(self.stop_challenge().map_err(Into::into));
            }
            Command::SwitchDevice(device, reply) => {
                tracing::info!(from = %self.device, to = %device, "switching device");
                let _ = self.stop_challenge();
                self.teardown_pipeline().await;
                self.device = device;
                let _ = reply.send(self.start_challenge());
            }
            Command::SwitchBackend(kind, reply) => {
                tracing::info!(from = %self.backend_kind, to = %kind, "switching backend");
                let result = match (self.make_backend)(kind) {
                    Ok(backend) => {
                        let _ = self.stop_challenge();
                        self.teardown_pipeline().await;
                        self.backend = backend;
                        self.backend_kind = kind;
                        self.start_challenge()
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "cannot build backend client");
                        Err(e.into())
                    }
                };
                let _ = reply.send(result);
            }
            Command::Shutdown(reply) => {
                self.teardown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn start_challenge(&mut self) -> Result<(), ControllerError> {
        if let Some(phase) = self.lifecycle.phase().filter(|p| !p.is_terminal()) {
            return Err(LifecycleError::InvalidTransition {
                event: "start",
                from: Some(phase),
            }
            .into());
        }
        let (width, height) = self.ensure_pipeline()?;

        self.epoch += 1;
        self.lifecycle = ChallengeLifecycle::new();
        self.session = None;
        self.verify_armed = false;
        self.last_verdict = None;
        self.last_error = None;
        self.overlay.clear();
        self.lifecycle.start(Arc::clone(&self.notifier))?;

        let backend = Arc::clone(&self.backend);
        let done = self.completions_tx.clone();
        let epoch = self.epoch;
        tracing::info!(epoch, backend = backend.name(), width, height, "starting challenge");
        tokio::spawn(async move {
            let result = backend.start(width, height).await;
            let _ = done.send(Completion::Started { epoch, result });
        });
        Ok(())
    }

    fn stop_challenge(&mut self) -> Result<(), LifecycleError> {
        self.lifecycle.stop()?;
        self.epoch += 1;
        self.verify_armed = false;
        Ok(())
    }

    /// Build the media pipeline if none is running and return its geometry.
    fn ensure_pipeline(&mut self) -> Result<(u32, u32), ControllerError> {
        if let Some(pipeline) = &self.pipeline {
            return Ok(pipeline.geometry());
        }
        match pipeline::build_with_fallback(
            self.media.as_ref(),
            &self.device,
            self.frame_sink.clone(),
        ) {
            Ok(pipeline) => {
                let geometry = pipeline.geometry();
                self.pipeline = Some(pipeline);
                Ok(geometry)
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                self.notifier.user_message(
                    &format!("Cannot open video source {}", self.device),
                    MessageLevel::Error,
                );
                Err(e.into())
            }
        }
    }

    /// Stop the media thread. The bounded join runs on the blocking pool so
    /// the runtime keeps serving other tasks meanwhile.
    async fn teardown_pipeline(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            let timeout = self.shutdown_timeout;
            if let Err(e) = tokio::task::spawn_blocking(move || pipeline.stop(timeout)).await {
                tracing::warn!(error = %e, "pipeline stop task failed");
            }
        }
        while self.frames.try_recv().is_ok() {}
    }

    async fn teardown(&mut self) {
        let _ = self.stop_challenge();
        self.teardown_pipeline().await;
        if let Some(pool) = self.pool.take() {
            let timeout = self.shutdown_timeout;
            if let Err(e) = tokio::task::spawn_blocking(move || pool.shutdown(timeout)).await {
                tracing::warn!(error = %e, "detection pool shutdown task failed");
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        let Some(phase) = self.lifecycle.phase().filter(|p| !p.is_terminal()) else {
            return;
        };

        if matches!(phase, Phase::PositioningNose | Phase::Verifying) {
            if let Some(session) = &self.session {
                let verify = phase == Phase::Verifying && std::mem::take(&mut self.verify_armed);
                self.upload(frame.clone(), Arc::clone(session), verify);
            }
        }

        if self.detecting {
            tracing::trace!("detection in flight, frame skipped");
            return;
        }
        let Some(pool) = &self.pool else { return };
        self.detecting = true;
        let job = pool.submit(frame);
        let done = self.completions_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = job.await;
            let _ = done.send(Completion::Detection { epoch, result });
        });
    }

    /// Encode and submit one frame, then verify if asked to.
    fn upload(&self, frame: Frame, session: Arc<ChallengeSession>, verify: bool) {
        let permit = match Arc::clone(&self.uploads).try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) if verify => None,
            Err(_) => {
                tracing::trace!("uploads saturated, frame not submitted");
                return;
            }
        };
        let backend = Arc::clone(&self.backend);
        let done = self.completions_tx.clone();
        let epoch = self.epoch;
        let quality = self.jpeg_quality;
        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        tokio::spawn(async move {
            let jpeg = match tokio::task::spawn_blocking(move || frame.to_jpeg(quality)).await {
                Ok(Ok(jpeg)) => Some(jpeg),
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "failed to encode frame");
                    None
                }
                Err(e) => {
                    tracing::warn!(error = %e, "frame encoder task failed");
                    None
                }
            };
            if let Some(jpeg) = jpeg {
                if let Err(e) = backend.submit_frame(&session, &jpeg, timestamp_ms).await {
                    tracing::warn!(error = %e, "frame upload failed");
                }
            }
            drop(permit);
            if verify {
                let result = backend.verify(&session).await;
                let _ = done.send(Completion::Verified { epoch, result });
            }
        });
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Detection { epoch, result } => {
                self.detecting = false;
                if epoch != self.epoch {
                    tracing::debug!(epoch, "discarding stale detection");
                    return;
                }
                self.on_detection(result.unwrap_or_default());
            }
            Completion::Started { epoch, result } => {
                if epoch != self.epoch {
                    tracing::debug!(epoch, "discarding stale start response");
                    return;
                }
                match result {
                    Ok(session) => {
                        tracing::info!(session = %session.id, "challenge session created");
                        self.session = Some(Arc::new(session));
                        log_rejected(self.lifecycle.center_face());
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to start challenge");
                        self.last_error = Some(e.to_string());
                        self.notifier.user_message(
                            "Could not start the challenge, please try again",
                            MessageLevel::Error,
                        );
                    }
                }
            }
            Completion::Verified { epoch, result } => {
                if epoch != self.epoch {
                    tracing::debug!(epoch, "discarding stale verify response");
                    return;
                }
                match result {
                    Ok(verdict) => {
                        tracing::info!(success = ?verdict.success(), "verification answered");
                        self.last_verdict = Some(verdict);
                        log_rejected(self.stop_challenge());
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "verification request failed");
                        self.last_error = Some(e.to_string());
                        self.notifier.user_message(
                            "Verification failed to complete, please restart the challenge",
                            MessageLevel::Error,
                        );
                    }
                }
            }
        }
    }

    fn on_detection(&mut self, result: DetectionResult) {
        self.overlay.put(result.clone());
        let Some(session) = self.session.clone() else {
            return;
        };
        match self.lifecycle.phase() {
            Some(Phase::CenteringFace) => {
                log_rejected(self.lifecycle.position_nose(&session.target, &result));
            }
            Some(Phase::PositioningNose | Phase::Verifying) => {
                match self.lifecycle.verify(&session.target, &result) {
                    Ok(_) => self.verify_armed = true,
                    Err(e) => log_rejected::<Phase>(Err(e)),
                }
            }
            _ => {}
        }
    }

    fn publish(&self) {
        let phase = self.lifecycle.phase();
        let latest = self.overlay.latest();
        let next = ControllerStatus {
            phase,
            session_id: self.session.as_ref().map(|s| s.id.clone()),
            backend: self.backend_kind.to_string(),
            device: self.device.clone(),
            last_verdict: self.last_verdict.clone(),
            last_error: self.last_error.clone(),
            overlay: OverlayDrawData::compose(latest.as_ref(), phase, self.session.as_deref()),
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

/// Rejected events are routine: most frames do not satisfy a guard.
fn log_rejected<T>(outcome: Result<T, LifecycleError>) {
    match outcome {
        Ok(_) => {}
        Err(e @ LifecycleError::GuardRejected { .. }) => tracing::trace!(error = %e),
        Err(e) => tracing::debug!(error = %e, "lifecycle event dropped"),
    }
}
