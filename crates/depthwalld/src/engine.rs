use depthwall_core::{ControllerError, DepthController, SessionConfig, SessionState};
use depthwall_hw::DeviceBackend;
use image::GrayImage;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};

/// Longest stretch the engine sleeps without checking for requests.
const BACKOFF_SLICE: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error("no frame captured yet")]
    NoFrame,
    #[error("failed to write snapshot: {0}")]
    Snapshot(#[from] image::ImageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Tuning for the engine's recovery behaviour.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Consecutive acquisition failures before the session is reset.
    pub failures_before_reset: u32,
    /// Sleep between attempts to revive a failed session.
    pub retry_backoff: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            failures_before_reset: 3,
            retry_backoff: Duration::from_secs(2),
        }
    }
}

/// Latest processed matrices, shared with request handlers without copying.
#[derive(Clone)]
pub struct FrameSnapshot {
    pub depth: Arc<GrayImage>,
    pub users: Arc<GrayImage>,
    /// Frames processed by the engine when this snapshot was taken.
    pub sequence: u64,
    pub tracked_users: Vec<u16>,
}

impl FrameSnapshot {
    /// Write `depth-<seq>.png` and `users-<seq>.png` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<(PathBuf, PathBuf), EngineError> {
        std::fs::create_dir_all(dir)?;
        let depth_path = dir.join(format!("depth-{:06}.png", self.sequence));
        let users_path = dir.join(format!("users-{:06}.png", self.sequence));
        self.depth.save(&depth_path)?;
        self.users.save(&users_path)?;
        Ok((depth_path, users_path))
    }
}

/// Engine state reported over D-Bus.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub backend: String,
    pub state: String,
    pub iterations: u32,
    pub max_iterations: u32,
    pub resets: u64,
    pub depth_threshold: i32,
    pub motor_angle: i32,
    pub initial_motor_angle: i32,
    pub has_motor: bool,
    pub tracked_users: Vec<u16>,
    pub valid_fraction: f32,
    pub frames: u64,
    pub acquisition_failures: u64,
    pub last_error: Option<String>,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    SetDepth {
        delta: i32,
        reply: oneshot::Sender<Result<i32, EngineError>>,
    },
    SetMotorAngle {
        delta: i32,
        reply: oneshot::Sender<Result<i32, EngineError>>,
    },
    ResetMotorAngle {
        reply: oneshot::Sender<Result<i32, EngineError>>,
    },
    Reset {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    frames: watch::Receiver<Option<FrameSnapshot>>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Shift the depth threshold; returns the new threshold.
    pub async fn set_depth(&self, delta: i32) -> Result<i32, EngineError> {
        self.request(|reply| EngineRequest::SetDepth { delta, reply })
            .await?
    }

    /// Shift the tilt angle; returns the new angle.
    pub async fn set_motor_angle(&self, delta: i32) -> Result<i32, EngineError> {
        self.request(|reply| EngineRequest::SetMotorAngle { delta, reply })
            .await?
    }

    pub async fn reset_motor_angle(&self) -> Result<i32, EngineError> {
        self.request(|reply| EngineRequest::ResetMotorAngle { reply })
            .await?
    }

    /// Tear the device session down and reopen it.
    pub async fn reset(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Reset { reply }).await?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }

    /// Most recent processed frame, if any.
    pub fn latest_frame(&self) -> Option<FrameSnapshot> {
        self.frames.borrow().clone()
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The backend is built and the controller initialised on the engine thread
/// itself. This call blocks until that first initialisation finishes and
/// fails fast if it does not succeed.
pub fn spawn_engine<B, F>(
    make_backend: F,
    config: SessionConfig,
    options: EngineOptions,
) -> Result<EngineHandle, EngineError>
where
    B: DeviceBackend,
    F: FnOnce() -> B + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<EngineRequest>(8);
    let (frames_tx, frames_rx) = watch::channel(None);
    let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<(), ControllerError>>(1);

    std::thread::Builder::new()
        .name("depthwall-engine".into())
        .spawn(move || {
            let controller = match DepthController::new(make_backend(), config) {
                Ok(c) => {
                    let _ = ready_tx.send(Ok(()));
                    c
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            tracing::info!(backend = controller.backend().name(), "engine thread started");

            let mut engine = Engine {
                controller,
                options,
                frames_tx,
                frames: 0,
                consecutive_failures: 0,
                acquisition_failures: 0,
                last_error: None,
                retry_at: None,
            };
            engine.run(rx);
            tracing::info!("engine thread exiting");
        })?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(EngineHandle {
            tx,
            frames: frames_rx,
        }),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(EngineError::ChannelClosed),
    }
}

struct Engine<B: DeviceBackend> {
    controller: DepthController<B>,
    options: EngineOptions,
    frames_tx: watch::Sender<Option<FrameSnapshot>>,
    frames: u64,
    consecutive_failures: u32,
    acquisition_failures: u64,
    last_error: Option<String>,
    /// When the next revival of a failed session is due.
    retry_at: Option<Instant>,
}

impl<B: DeviceBackend> Engine<B> {
    /// Alternate between serving queued requests and acquiring frames until
    /// every handle is dropped.
    fn run(&mut self, mut rx: mpsc::Receiver<EngineRequest>) {
        loop {
            loop {
                match rx.try_recv() {
                    Ok(req) => self.handle(req),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.controller.close();
                        return;
                    }
                }
            }
            self.step();
        }
    }

    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::SetDepth { delta, reply } => {
                let result = self.controller.set_depth(delta).map_err(EngineError::from);
                if let Ok(threshold) = result {
                    tracing::info!(threshold, "depth threshold changed");
                }
                let _ = reply.send(result);
            }
            EngineRequest::SetMotorAngle { delta, reply } => {
                let result = self
                    .controller
                    .set_motor_angle(delta)
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::ResetMotorAngle { reply } => {
                let result = self
                    .controller
                    .reset_motor_angle()
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::Reset { reply } => {
                let result = self.reset();
                let _ = reply.send(result.map_err(EngineError::from));
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    /// One acquisition cycle, or a revival attempt when the session failed.
    fn step(&mut self) {
        if self.controller.state() == SessionState::Failed {
            let now = Instant::now();
            let retry_at = *self
                .retry_at
                .get_or_insert(now + self.options.retry_backoff);
            if now < retry_at {
                std::thread::sleep((retry_at - now).min(BACKOFF_SLICE));
                return;
            }
            self.retry_at = None;
            if self.reset().is_ok() {
                tracing::info!("session revived");
            }
            return;
        }

        match self.controller.update() {
            Ok(()) => {
                self.consecutive_failures = 0;
                self.publish();
            }
            Err(e) if e.is_recoverable() => {
                self.consecutive_failures += 1;
                self.acquisition_failures += 1;
                tracing::warn!(
                    error = %e,
                    consecutive = self.consecutive_failures,
                    "frame acquisition failed"
                );
                self.last_error = Some(e.to_string());
                if self.consecutive_failures >= self.options.failures_before_reset {
                    tracing::warn!("too many consecutive failures; resetting session");
                    let _ = self.reset();
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "session update failed");
                self.last_error = Some(e.to_string());
            }
        }
    }

    fn reset(&mut self) -> Result<(), ControllerError> {
        self.consecutive_failures = 0;
        match self.controller.reset() {
            Ok(()) => {
                self.retry_at = None;
                self.publish();
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "session reset failed");
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn publish(&mut self) {
        self.frames += 1;
        self.frames_tx.send_replace(Some(FrameSnapshot {
            depth: Arc::new(self.controller.depth_matrix().clone()),
            users: Arc::new(self.controller.users_matrix().clone()),
            sequence: self.frames,
            tracked_users: self.controller.tracked_users().to_vec(),
        }));
    }

    fn status(&self) -> EngineStatus {
        let c = &self.controller;
        EngineStatus {
            backend: c.backend().name().to_string(),
            state: format!("{:?}", c.state()),
            iterations: c.iterations(),
            max_iterations: c.max_iterations(),
            resets: c.resets(),
            depth_threshold: c.depth_threshold(),
            motor_angle: c.motor_angle(),
            initial_motor_angle: c.initial_motor_angle(),
            has_motor: c.has_motor(),
            tracked_users: c.tracked_users().to_vec(),
            valid_fraction: c.valid_fraction(),
            frames: self.frames,
            acquisition_failures: self.acquisition_failures,
            last_error: self.last_error.clone(),
        }
    }
}
