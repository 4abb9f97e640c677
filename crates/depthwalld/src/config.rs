use anyhow::Context;
use depthwall_core::{IntensityMapping, SessionConfig};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::EngineOptions;

/// Which device backend the engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    V4l2,
    Sim,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "v4l2" => Ok(Self::V4l2),
            "sim" => Ok(Self::Sim),
            other => Err(format!("unknown backend {other:?} (expected v4l2 or sim)")),
        }
    }
}

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    pub backend: BackendKind,
    /// V4L2 depth node (default: /dev/video0).
    pub depth_device: String,
    /// V4L2 nodes searched by motor index (default: the depth node).
    pub motor_devices: Vec<String>,
    /// Session settings: `DEPTHWALL_CONFIG` TOML file, then env overrides.
    pub session: SessionConfig,
    /// Consecutive acquisition failures that trigger a session reset.
    pub failures_before_reset: u32,
    /// Wait between attempts to revive a failed session.
    pub retry_backoff_secs: u64,
    /// Register on the system bus instead of the session bus.
    pub system_bus: bool,
    /// Default directory for snapshots.
    pub snapshot_dir: PathBuf,
}

impl Config {
    /// Load configuration from `DEPTHWALL_*` environment variables with defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut session = match var("DEPTHWALL_CONFIG") {
            Some(path) => {
                let src = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {path}"))?;
                SessionConfig::from_toml_str(&src).with_context(|| format!("invalid {path}"))?
            }
            None => SessionConfig::default(),
        };

        session.max_users = parse_or(&var, "DEPTHWALL_MAX_USERS", session.max_users);
        session.max_iterations = parse_or(&var, "DEPTHWALL_MAX_ITERATIONS", session.max_iterations);
        session.depth_threshold =
            parse_or(&var, "DEPTHWALL_DEPTH_THRESHOLD", session.depth_threshold);
        session.motor_angle = parse_or(&var, "DEPTHWALL_MOTOR_ANGLE", session.motor_angle);
        session.frame_timeout_ms =
            parse_or(&var, "DEPTHWALL_FRAME_TIMEOUT_MS", session.frame_timeout_ms);
        if let Some(v) = var("DEPTHWALL_REQUIRE_MOTOR") {
            session.require_motor = v != "0";
        }
        match var("DEPTHWALL_INTENSITY").as_deref() {
            Some("wrapping") => session.intensity = IntensityMapping::Wrapping,
            Some("inverted") => session.intensity = IntensityMapping::Inverted,
            Some(other) => tracing::warn!(value = other, "ignoring unknown DEPTHWALL_INTENSITY"),
            None => {}
        }
        session.validate()?;

        let backend = match var("DEPTHWALL_BACKEND") {
            Some(v) => v.parse().map_err(anyhow::Error::msg)?,
            None => BackendKind::V4l2,
        };

        let depth_device = var("DEPTHWALL_DEPTH_DEVICE").unwrap_or_else(|| "/dev/video0".to_string());
        let motor_devices = var("DEPTHWALL_MOTOR_DEVICES")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_else(|| vec![depth_device.clone()]);

        let snapshot_dir = var("DEPTHWALL_SNAPSHOT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                var("XDG_RUNTIME_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join("depthwall")
            });

        Ok(Self {
            backend,
            depth_device,
            motor_devices,
            session,
            failures_before_reset: parse_or(&var, "DEPTHWALL_FAILURES_BEFORE_RESET", 3),
            retry_backoff_secs: parse_or(&var, "DEPTHWALL_RETRY_BACKOFF_SECS", 2),
            system_bus: var("DEPTHWALL_SYSTEM_BUS")
                .map(|v| v != "0")
                .unwrap_or(false),
            snapshot_dir,
        })
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            failures_before_reset: self.failures_before_reset.max(1),
            retry_backoff: Duration::from_secs(self.retry_backoff_secs),
        }
    }
}

fn parse_or<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
