use crate::engine::{EngineError, EngineHandle};
use depthwall_core::ControllerError;
use depthwall_hw::MotorError;
use std::path::PathBuf;
use zbus::interface;

pub const BUS_NAME: &str = "org.depthwall.Depthwall1";
pub const OBJECT_PATH: &str = "/org/depthwall/Depthwall1";

/// D-Bus interface for the depthwall daemon.
///
/// Bus name: org.depthwall.Depthwall1
/// Object path: /org/depthwall/Depthwall1
pub struct DepthwallService {
    engine: EngineHandle,
    snapshot_dir: PathBuf,
}

impl DepthwallService {
    pub fn new(engine: EngineHandle, snapshot_dir: PathBuf) -> Self {
        Self {
            engine,
            snapshot_dir,
        }
    }
}

#[interface(name = "org.depthwall.Depthwall1")]
impl DepthwallService {
    /// Return engine status as a JSON object.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        let mut value = serde_json::to_value(&status)
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        value["version"] = env!("CARGO_PKG_VERSION").into();
        Ok(value.to_string())
    }

    /// Shift the depth threshold by `delta`; returns the new threshold.
    async fn set_depth(&self, delta: i32) -> zbus::fdo::Result<i32> {
        tracing::info!(delta, "set_depth requested");
        self.engine.set_depth(delta).await.map_err(to_fdo)
    }

    /// Shift the tilt angle by `delta`; returns the new angle.
    async fn set_motor_angle(&self, delta: i32) -> zbus::fdo::Result<i32> {
        tracing::info!(delta, "set_motor_angle requested");
        self.engine.set_motor_angle(delta).await.map_err(to_fdo)
    }

    async fn reset_motor_angle(&self) -> zbus::fdo::Result<i32> {
        tracing::info!("reset_motor_angle requested");
        self.engine.reset_motor_angle().await.map_err(to_fdo)
    }

    /// Tear down and reopen the device session.
    async fn reset(&self) -> zbus::fdo::Result<()> {
        tracing::info!("reset requested");
        self.engine.reset().await.map_err(to_fdo)
    }

    /// Write the latest depth and users matrices as PNGs into `dir` (or the
    /// configured snapshot directory when empty). Returns the written paths.
    async fn snapshot(&self, dir: &str) -> zbus::fdo::Result<Vec<String>> {
        let snapshot = self
            .engine
            .latest_frame()
            .ok_or_else(|| to_fdo(EngineError::NoFrame))?;
        let dir = if dir.is_empty() {
            self.snapshot_dir.clone()
        } else {
            PathBuf::from(dir)
        };
        tracing::info!(dir = %dir.display(), sequence = snapshot.sequence, "snapshot requested");

        let (depth, users) = tokio::task::spawn_blocking(move || snapshot.save(&dir))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?
            .map_err(to_fdo)?;
        Ok(vec![
            depth.display().to_string(),
            users.display().to_string(),
        ])
    }
}

fn to_fdo(e: EngineError) -> zbus::fdo::Error {
    match e {
        EngineError::Controller(ControllerError::Config(e)) => {
            zbus::fdo::Error::InvalidArgs(e.to_string())
        }
        EngineError::Controller(ControllerError::Actuator(MotorError::Closed)) => {
            zbus::fdo::Error::NotSupported("no tilt motor attached".into())
        }
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}
