//! Device session and frame acquisition.
//!
//! A [`DeviceSession`] owns the backend, the open sensor and motor, and the
//! reusable raw frame. It can be closed and reopened any number of times.

use crate::config::SessionConfig;
use crate::error::{ControllerError, Phase};
use crate::observer::UserObserver;
use depthwall_hw::{DepthSensor, DeviceBackend, RawFrame, SensorError, SensorMode, TiltMotor};
use std::time::Duration;

pub struct DeviceSession<B: DeviceBackend> {
    backend: B,
    sensor: Option<B::Sensor>,
    motor: Option<B::Motor>,
    frame: RawFrame,
    /// Users seen in the previous frame.
    tracked: Vec<u16>,
    observer: Box<dyn UserObserver>,
    mode: SensorMode,
    frame_timeout: Duration,
    motor_index: usize,
    require_motor: bool,
}

impl<B: DeviceBackend> DeviceSession<B> {
    /// Allocate frame storage. Devices stay closed until [`open`](Self::open).
    pub fn new(
        backend: B,
        config: &SessionConfig,
        observer: Box<dyn UserObserver>,
    ) -> Result<Self, ControllerError> {
        let max_users = config.max_users as usize;
        let frame = RawFrame::allocate(config.mode.width, config.mode.height, max_users)?;
        let mut tracked = Vec::new();
        tracked.try_reserve_exact(max_users)?;

        Ok(Self {
            backend,
            sensor: None,
            motor: None,
            frame,
            tracked,
            observer,
            mode: config.mode,
            frame_timeout: config.frame_timeout(),
            motor_index: config.motor_index,
            require_motor: config.require_motor,
        })
    }

    /// Connect to the sensor and the motor.
    ///
    /// Anything already open is closed first. On failure nothing is left open.
    pub fn open(&mut self) -> Result<(), ControllerError> {
        self.close();

        let mut sensor = self
            .backend
            .open_sensor(self.mode)
            .map_err(|e| ControllerError::init(Phase::OpenSensor, e))?;

        let negotiated = sensor.mode();
        if negotiated.width != self.mode.width || negotiated.height != self.mode.height {
            sensor.close();
            return Err(ControllerError::init(
                Phase::OpenSensor,
                SensorError::FormatNegotiationFailed(format!(
                    "sensor runs at {}x{}, session expects {}x{}",
                    negotiated.width, negotiated.height, self.mode.width, self.mode.height
                )),
            ));
        }
        self.sensor = Some(sensor);

        match self.backend.open_motor(self.motor_index) {
            Ok(motor) => self.motor = Some(motor),
            Err(e) if !self.require_motor => {
                tracing::warn!(error = %e, index = self.motor_index, "no tilt motor; continuing without one");
            }
            Err(e) => {
                self.close();
                return Err(ControllerError::init(Phase::OpenMotor, e));
            }
        }

        tracing::info!(
            backend = self.backend.name(),
            width = self.mode.width,
            height = self.mode.height,
            fps = self.mode.fps,
            motor = self.motor.is_some(),
            "device session open"
        );
        Ok(())
    }

    /// Begin continuous frame generation on the open sensor.
    pub fn start_streaming(&mut self) -> Result<(), ControllerError> {
        let sensor = self.sensor.as_mut().ok_or_else(|| {
            ControllerError::init(Phase::StartStreaming, SensorError::NotStreaming)
        })?;
        sensor
            .start_streaming()
            .map_err(|e| ControllerError::init(Phase::StartStreaming, e))
    }

    /// Block until the sensor delivers the next frame.
    ///
    /// Raises user presence events for changes since the previous frame.
    pub fn wait_for_next_frame(&mut self) -> Result<&RawFrame, ControllerError> {
        let sensor = self
            .sensor
            .as_mut()
            .ok_or(ControllerError::Acquisition(SensorError::NotStreaming))?;
        sensor
            .wait_for_frame(&mut self.frame, self.frame_timeout)
            .map_err(ControllerError::Acquisition)?;

        self.dispatch_user_events();
        Ok(&self.frame)
    }

    /// Release sensor and motor. Safe to call at any time, including after a
    /// partial open.
    pub fn close(&mut self) {
        let was_open = self.sensor.is_some() || self.motor.is_some();
        if let Some(mut sensor) = self.sensor.take() {
            sensor.close();
        }
        if let Some(mut motor) = self.motor.take() {
            motor.close();
        }
        for &id in &self.tracked {
            self.observer.on_user_lost(id);
        }
        self.tracked.clear();
        self.frame.clear();
        if was_open {
            tracing::info!(backend = self.backend.name(), "device session closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.sensor.is_some()
    }

    pub fn has_motor(&self) -> bool {
        self.motor.is_some()
    }

    pub fn motor_mut(&mut self) -> Option<&mut B::Motor> {
        self.motor.as_mut()
    }

    /// Latest raw frame (zeroed until the first acquisition).
    pub fn frame(&self) -> &RawFrame {
        &self.frame
    }

    /// Users present in the latest frame.
    pub fn tracked_users(&self) -> &[u16] {
        &self.tracked
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn dispatch_user_events(&mut self) {
        let current = self.frame.users();
        for &id in &self.tracked {
            if !current.contains(&id) {
                self.observer.on_user_lost(id);
            }
        }
        for &id in current {
            if !self.tracked.contains(&id) {
                self.observer.on_user_detected(id);
            }
        }
        self.tracked.clear();
        self.tracked.extend_from_slice(current);
    }
}

impl<B: DeviceBackend> Drop for DeviceSession<B> {
    fn drop(&mut self) {
        self.close();
    }
}
