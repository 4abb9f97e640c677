//! depthwall-core — Depth/user frame processing and session lifecycle.
//!
//! Wraps a depth sensor and tilt motor from `depthwall-hw` in a session
//! that thresholds, maps and mirrors every frame into two 8-bit matrices,
//! and periodically tears itself down and reopens.

pub mod actuator;
pub mod config;
pub mod controller;
pub mod error;
pub mod observer;
pub mod processor;
pub mod session;

pub use actuator::Actuator;
pub use config::{ConfigError, IntensityMapping, SessionConfig};
pub use controller::{DepthController, SessionState};
pub use error::{ControllerError, DeviceFault, Phase};
pub use observer::{LogObserver, NoopObserver, UserObserver};
pub use processor::FrameProcessor;
pub use session::DeviceSession;
