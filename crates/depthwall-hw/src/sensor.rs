//! Device abstraction traits shared by every capture backend.
//!
//! A backend opens one depth sensor and one tilt motor. Sensors fill a
//! caller-owned [`RawFrame`] so storage is reused across frames.

use crate::frame::{FrameError, RawFrame};
use crate::motor::MotorError;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SensorError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("failed to start streaming: {0}")]
    StreamStartFailed(String),
    #[error("sensor is not streaming")]
    NotStreaming,
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("device disconnected: {0}")]
    Disconnected(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Requested map output mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SensorMode {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl SensorMode {
    /// 640x480 at 30 frames per second.
    pub const VGA_30: Self = Self {
        width: 640,
        height: 480,
        fps: 30,
    };

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Nominal time between frames.
    pub fn frame_interval(&self) -> Duration {
        if self.fps == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs(1) / self.fps
    }
}

impl Default for SensorMode {
    fn default() -> Self {
        Self::VGA_30
    }
}

/// A depth sensor producing depth and user-label maps.
pub trait DepthSensor {
    /// Mode the sensor actually negotiated.
    fn mode(&self) -> SensorMode;

    /// Begin continuous frame generation.
    fn start_streaming(&mut self) -> Result<(), SensorError>;

    /// Block until the next frame is ready and copy it into `frame`.
    ///
    /// Returns [`SensorError::Timeout`] if nothing arrives within `timeout`.
    fn wait_for_frame(&mut self, frame: &mut RawFrame, timeout: Duration)
        -> Result<(), SensorError>;

    /// Stop streaming and release the device. Calling twice is a no-op.
    fn close(&mut self);
}

/// A tilt actuator positioned in the range
/// [`TILT_MIN`](crate::motor::TILT_MIN)..=[`TILT_MAX`](crate::motor::TILT_MAX).
pub trait TiltMotor {
    /// Move to an absolute, already clamped, angle.
    fn set_position(&mut self, angle: i32) -> Result<(), MotorError>;

    /// Release the actuator. Calling twice is a no-op.
    fn close(&mut self);
}

/// Opens the sensor and actuator for a session.
///
/// Called again on every session reset, so implementations must be able to
/// reopen devices they previously handed out.
pub trait DeviceBackend {
    type Sensor: DepthSensor;
    type Motor: TiltMotor;

    /// Short backend name for logs.
    fn name(&self) -> &str;

    fn open_sensor(&mut self, mode: SensorMode) -> Result<Self::Sensor, SensorError>;

    /// Open the actuator at `index` among the backend's motor devices.
    fn open_motor(&mut self, index: usize) -> Result<Self::Motor, MotorError>;
}
