//! depthwall-hw — Hardware abstraction for depth capture and tilt control.
//!
//! Defines the sensor/motor/backend traits a session drives, plus a
//! V4L2 backend for kernel depth-camera drivers and a simulated backend.

pub mod frame;
pub mod motor;
pub mod profiles;
pub mod sensor;
pub mod sim;
pub mod v4l2;

pub use frame::{FrameError, RawFrame};
pub use motor::{clamp_tilt, MotorError, V4l2TiltMotor, TILT_MAX, TILT_MIN};
pub use sensor::{DepthSensor, DeviceBackend, SensorError, SensorMode, TiltMotor};
pub use sim::{SimBackend, SimHandle, SimScene};
pub use v4l2::{V4l2Backend, V4l2DepthSensor};
