use crate::config::ConfigError;
use depthwall_hw::{FrameError, MotorError, SensorError};
use std::collections::TryReserveError;
use std::fmt;
use thiserror::Error;

/// Step of session setup that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    OpenSensor,
    OpenMotor,
    StartStreaming,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OpenSensor => "opening sensor",
            Self::OpenMotor => "opening motor",
            Self::StartStreaming => "starting stream",
        })
    }
}

/// Which device a setup failure came from.
#[derive(Error, Debug)]
pub enum DeviceFault {
    #[error(transparent)]
    Sensor(#[from] SensorError),
    #[error(transparent)]
    Motor(#[from] MotorError),
}

#[derive(Error, Debug)]
pub enum ControllerError {
    /// Connection, mode negotiation or stream start failed. The session is
    /// unusable until a reset succeeds.
    #[error("device init failed while {phase}: {source}")]
    DeviceInit {
        phase: Phase,
        #[source]
        source: DeviceFault,
    },
    /// Frame wait timed out or the device went away. Retry or reset.
    #[error("frame acquisition failed: {0}")]
    Acquisition(#[source] SensorError),
    /// Output or frame buffers could not be allocated.
    #[error("buffer allocation failed: {0}")]
    Resource(#[from] TryReserveError),
    /// Tilt command failed. Acquisition is unaffected.
    #[error("actuator command failed: {0}")]
    Actuator(#[from] MotorError),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("session failed; reset required")]
    SessionFailed,
}

impl ControllerError {
    pub(crate) fn init(phase: Phase, source: impl Into<DeviceFault>) -> Self {
        Self::DeviceInit {
            phase,
            source: source.into(),
        }
    }

    /// Whether retrying `update` (or a reset) can clear the error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Acquisition(_) | Self::Actuator(_))
    }
}

impl From<FrameError> for ControllerError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Allocation(e) => Self::Resource(e),
            other => Self::Acquisition(SensorError::Frame(other)),
        }
    }
}
